//! Retention-driven metadata cleanup
//!
//! Periodically bulk-deletes terminal runs of whitelisted workflows older
//! than the retention period, along with their child work items, logs and
//! step records. Live runs are kept regardless of age.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use trellis_storage::{DataContext, PurgeCounts};

use crate::config::CleanupConfig;
use crate::error::EngineError;

/// Periodic retention sweep over terminal metadata
pub struct MetadataCleanup {
    ctx: Arc<dyn DataContext>,
    config: CleanupConfig,
}

impl MetadataCleanup {
    pub fn new(ctx: Arc<dyn DataContext>, config: CleanupConfig) -> Self {
        Self { ctx, config }
    }

    /// Run one retention sweep.
    pub async fn tick(&self) -> Result<PurgeCounts, EngineError> {
        if self.config.workflow_whitelist.is_empty() {
            return Ok(PurgeCounts::default());
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        let counts = self
            .ctx
            .purge_terminal_metadata(&self.config.workflow_whitelist, cutoff)
            .await?;

        if counts.metadata > 0 {
            info!(
                metadata = counts.metadata,
                step_metadata = counts.step_metadata,
                logs = counts.logs,
                work_items = counts.work_items,
                "cleanup purged terminal runs"
            );
        }
        Ok(counts)
    }

    /// Spawn the cooperative periodic loop.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Staggered start keeps concurrent instances off a shared beat.
            let stagger = crate::jittered_start(this.config.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = shutdown.changed() => {
                    debug!("metadata cleanup: shutdown requested");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(this.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            error!("metadata cleanup tick failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("metadata cleanup: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_storage::InMemoryDataContext;

    #[tokio::test]
    async fn empty_whitelist_is_a_no_op() {
        let cleanup = MetadataCleanup::new(
            Arc::new(InMemoryDataContext::new()),
            CleanupConfig::default(),
        );
        let counts = cleanup.tick().await.unwrap();
        assert_eq!(counts, PurgeCounts::default());
    }
}
