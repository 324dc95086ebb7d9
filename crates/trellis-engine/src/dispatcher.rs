//! Job dispatcher loop
//!
//! One tick: load every queued work item with its dispatch envelope, order
//! dependent-schedule items first then priority descending then FIFO,
//! budget per-group capacity (`min(group cap, global cap) - active`), and
//! dispatch each selected item through the store's atomic triple. A failed
//! dispatch leaves the row queued for the next tick.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use trellis_core::model::ScheduleType;
use trellis_storage::{DataContext, MetadataSeed, NewMetadata, QueuedWork};

use crate::error::EngineError;
use crate::task_server::TaskServer;

/// Counters from one dispatcher tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub considered: usize,
    pub dispatched: usize,
    pub skipped_capacity: usize,
    pub skipped_disabled: usize,
}

/// Periodic consumer of queued work items
pub struct JobDispatcher {
    ctx: Arc<dyn DataContext>,
    task_server: Arc<dyn TaskServer>,
    poll_interval: Duration,
    global_max_active: Option<i64>,
}

impl JobDispatcher {
    pub fn new(
        ctx: Arc<dyn DataContext>,
        task_server: Arc<dyn TaskServer>,
        poll_interval: Duration,
        global_max_active: Option<i64>,
    ) -> Self {
        Self {
            ctx,
            task_server,
            poll_interval,
            global_max_active,
        }
    }

    /// Run one load-order-budget-dispatch pass.
    pub async fn tick(&self) -> Result<DispatchStats, EngineError> {
        let mut queued = self.ctx.load_queued().await?;
        let mut stats = DispatchStats {
            considered: queued.len(),
            ..Default::default()
        };
        if queued.is_empty() {
            return Ok(stats);
        }

        // Dependent chains unblock their parents' downstream work, so they
        // dispatch ahead of everything else.
        queued.sort_by_key(|q| {
            (
                Reverse(q.schedule_type == Some(ScheduleType::Dependent)),
                Reverse(q.item.priority),
                q.item.created_at,
                q.item.id,
            )
        });

        let mut active = self.ctx.count_active_jobs_per_group().await?;

        for q in queued {
            if !q.group_enabled {
                stats.skipped_disabled += 1;
                continue;
            }
            if !self.has_capacity(&q, &active) {
                stats.skipped_capacity += 1;
                continue;
            }

            let seed = match q.item.metadata_id {
                // Dead-letter retries arrive with their metadata pre-created.
                Some(id) => MetadataSeed::Existing(id),
                None => MetadataSeed::New(NewMetadata {
                    name: q.item.workflow_name.clone(),
                    input: Some(q.item.input.clone()),
                    manifest_id: q.item.manifest_id,
                    parent_id: None,
                }),
            };

            match self.ctx.dispatch_work_item(q.item.id, seed).await {
                Ok(dispatched) => {
                    if let Some(group_id) = q.group_id {
                        *active.entry(group_id).or_default() += 1;
                    }
                    stats.dispatched += 1;
                    debug!(
                        work_id = dispatched.work.id,
                        metadata_id = dispatched.metadata.id,
                        "dispatched"
                    );
                    if let Err(e) = self.task_server.notify(&dispatched.job).await {
                        error!(job_id = dispatched.job.id, "task server notify failed: {e}");
                    }
                }
                Err(e) => {
                    // The row stays queued; the next tick retries.
                    warn!(work_id = q.item.id, "dispatch failed: {e}");
                }
            }
        }

        Ok(stats)
    }

    fn has_capacity(&self, q: &QueuedWork, active: &HashMap<i64, i64>) -> bool {
        let Some(group_id) = q.group_id else {
            // Manifest-less items carry no group envelope.
            return true;
        };
        let group_active = active.get(&group_id).copied().unwrap_or(0);
        let cap = match (q.group_max_active.map(i64::from), self.global_max_active) {
            (None, None) => return true,
            (Some(g), None) => g,
            (None, Some(global)) => global,
            (Some(g), Some(global)) => g.min(global),
        };
        group_active < cap
    }

    /// Spawn the cooperative periodic loop.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Staggered start keeps concurrent instances off a shared beat.
            let stagger = crate::jittered_start(this.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = shutdown.changed() => {
                    debug!("job dispatcher: shutdown requested");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            error!("job dispatcher tick failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("job dispatcher: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}
