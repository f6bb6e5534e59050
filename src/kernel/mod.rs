//! Kernel - core infrastructure shared by every component.
//!
//! The kernel holds the database pool and the external client adapters; it
//! carries no business logic of its own (that lives in the component
//! modules at the crate root: `jobs`, `async_poller`, `progress_poller`,
//! `recovery`, `phantom`, `conflict`, `state_sync`, `bulk_ops`, `logging`,
//! `discovery`).

pub mod db;
pub mod service_host;

use std::sync::Arc;

use sqlx::PgPool;

use crate::clients::{IaasClient, SourceAgentClient};
use crate::config::Config;

/// Shared dependencies threaded into every component.
pub struct Kernel {
    pub db: PgPool,
    pub config: Config,
    pub iaas: Arc<dyn IaasClient>,
    pub source_agent: Arc<dyn SourceAgentClient>,
}

impl Kernel {
    pub fn new(
        db: PgPool,
        config: Config,
        iaas: Arc<dyn IaasClient>,
        source_agent: Arc<dyn SourceAgentClient>,
    ) -> Self {
        Self {
            db,
            config,
            iaas,
            source_agent,
        }
    }
}
