//! Service host for long-running background loops (spec §5).
//!
//! Each loop (async poller, progress poller, health monitor, state sync,
//! log rotator) implements [`Service`]; [`ServiceHost`] spawns them all
//! under one process-wide [`CancellationToken`] and waits for a clean
//! drain on shutdown.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Supervises a set of [`Service`]s, fanning a single cancellation signal
/// out to all of them.
#[derive(Default)]
pub struct ServiceHost {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn spawn(&mut self, service: Box<dyn Service>) {
        let name = service.name();
        let shutdown = self.shutdown.clone();
        info!(service = name, "starting service");
        let handle = tokio::spawn(async move { service.run(shutdown).await });
        self.handles.push((name, handle));
    }

    /// Cancel every service and wait for them to drain, with a hard
    /// deadline so a stuck loop cannot block process exit forever.
    pub async fn shutdown(self, drain_timeout: Duration) {
        self.shutdown.cancel();

        let drain = async {
            for (name, handle) in self.handles {
                match handle.await {
                    Ok(Ok(())) => info!(service = name, "service stopped cleanly"),
                    Ok(Err(e)) => error!(service = name, error = %e, "service exited with error"),
                    Err(e) => error!(service = name, error = %e, "service task panicked"),
                }
            }
        };

        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            error!("service host drain timed out; exiting anyway");
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
