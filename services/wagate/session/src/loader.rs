//! Startup loader: brings every persisted session back up at boot

use crate::manager::SessionManager;
use serde::Serialize;
use tracing::{error, info};
use wagate_storage::StorageError;

/// Outcome of a startup load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Sessions whose client handle was started
    pub started: usize,
    /// Persisted sessions already present in the registry
    pub skipped: usize,
    /// Sessions whose creation failed
    pub failed: usize,
}

/// Reconnects persisted sessions through the lifecycle manager
#[derive(Debug, Clone)]
pub struct StartupLoader {
    manager: SessionManager,
}

impl StartupLoader {
    /// Loader driving `manager`
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Start every persisted session that is not registered yet.
    ///
    /// Individual failures are logged and counted; only a failure to
    /// enumerate the store aborts the load. User bindings are not restored.
    pub async fn run(&self) -> Result<LoadReport, StorageError> {
        let ids = self.manager.store().list().await?;
        info!("Found {} persisted sessions", ids.len());

        let mut report = LoadReport::default();
        for id in ids {
            if self.manager.registry().contains(&id) {
                report.skipped += 1;
                continue;
            }
            match self.manager.create_or_reconnect(&id, None, false).await {
                Ok(_) => report.started += 1,
                Err(e) => {
                    error!("Failed to restore session {}: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Startup load finished: {} started, {} skipped, {} failed",
            report.started, report.skipped, report.failed
        );
        Ok(report)
    }
}
