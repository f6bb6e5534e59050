//! Hub Appliance job-tracking, async-polling, and state-reconciliation core.

pub mod async_poller;
pub mod bulk_ops;
pub mod clients;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod discovery;
pub mod error;
pub mod jobs;
pub mod kernel;
pub mod logging;
pub mod models;
pub mod phantom;
pub mod progress_poller;
pub mod recovery;
pub mod server;
pub mod state_sync;
