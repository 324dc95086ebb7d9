//! Manifest manager loop
//!
//! One tick: load every enabled manifest (with failure counts, open letters
//! and live queue presence in a single query), reap retry-exhausted
//! manifests into dead letters, then enqueue the ones that are due. Dead
//! letters persist as they are found so a failure later in the tick cannot
//! lose them. A failing manifest never stops the tick; a failing tick never
//! stops the loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use trellis_core::model::ScheduleType;
use trellis_storage::{DataContext, ManifestState, NewDeadLetter, NewWorkItem, StoreError};

use crate::error::EngineError;
use crate::schedule::{next_fire_after, parse_cron};

/// Counters from one manager tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub dead_lettered: usize,
    pub enqueued: usize,
}

/// Periodic producer of work-queue rows
pub struct ManifestManager {
    ctx: Arc<dyn DataContext>,
    poll_interval: Duration,
}

impl ManifestManager {
    pub fn new(ctx: Arc<dyn DataContext>, poll_interval: Duration) -> Self {
        Self { ctx, poll_interval }
    }

    /// Run one reap-then-enqueue pass.
    pub async fn tick(&self) -> Result<ManagerStats, EngineError> {
        let now = Utc::now();
        let states = self.ctx.load_manifest_states().await?;
        let mut stats = ManagerStats::default();

        // Reap first, persisting each letter immediately.
        let mut reaped: HashSet<i64> = HashSet::new();
        for state in &states {
            if state.has_open_dead_letter {
                continue;
            }
            if state.failed_runs > 0 && state.failed_runs >= state.manifest.max_retries as i64 {
                let letter = NewDeadLetter {
                    manifest_id: state.manifest.id,
                    reason: format!(
                        "Max retries exceeded: {} >= {}",
                        state.failed_runs, state.manifest.max_retries
                    ),
                    retry_count_at_dead_letter: state.failed_runs as i32,
                };
                match self.ctx.insert_dead_letter(letter).await {
                    Ok(letter) => {
                        info!(
                            manifest = %state.manifest.external_id,
                            dead_letter_id = letter.id,
                            failed_runs = state.failed_runs,
                            "manifest dead-lettered"
                        );
                        reaped.insert(state.manifest.id);
                        stats.dead_lettered += 1;
                    }
                    // Lost a race with another letter writer; same outcome.
                    Err(StoreError::OpenDeadLetterExists(_)) => {
                        reaped.insert(state.manifest.id);
                    }
                    Err(e) => {
                        error!(manifest = %state.manifest.external_id, "dead-letter insert failed: {e}");
                    }
                }
            }
        }

        // Enqueue whatever is due among the survivors.
        for state in &states {
            if state.has_open_dead_letter || reaped.contains(&state.manifest.id) {
                continue;
            }
            match self.is_due(state, now) {
                Ok(false) => {}
                Ok(true) => {
                    let item = NewWorkItem {
                        workflow_name: state.manifest.name.clone(),
                        input: state.manifest.properties.clone(),
                        input_type_name: state.manifest.property_type.clone(),
                        priority: state.group.priority,
                        manifest_id: Some(state.manifest.id),
                        metadata_id: None,
                    };
                    match self.ctx.enqueue_work(item).await {
                        Ok(work) => {
                            debug!(
                                manifest = %state.manifest.external_id,
                                work_id = work.id,
                                "enqueued due manifest"
                            );
                            stats.enqueued += 1;
                        }
                        Err(e) => {
                            error!(manifest = %state.manifest.external_id, "enqueue failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    error!(manifest = %state.manifest.external_id, "due check failed: {e}");
                }
            }
        }

        Ok(stats)
    }

    /// Whether a manifest should be enqueued now. Gated on the absence of a
    /// live work-queue entry, so at most one execution is in flight per
    /// manifest under normal operation.
    fn is_due(&self, state: &ManifestState, now: DateTime<Utc>) -> Result<bool, EngineError> {
        if state.live_queue_count > 0 {
            return Ok(false);
        }

        let manifest = &state.manifest;
        match manifest.schedule_type {
            ScheduleType::OnDemand | ScheduleType::None => Ok(false),
            ScheduleType::Cron => {
                let expression = manifest.cron_expression.as_deref().unwrap_or_default();
                let schedule = parse_cron(expression)?;
                let anchor = manifest.last_successful_run.unwrap_or(manifest.created_at);
                Ok(next_fire_after(&schedule, anchor)
                    .map(|fire| fire <= now)
                    .unwrap_or(false))
            }
            ScheduleType::Interval => {
                let period = chrono::Duration::seconds(manifest.interval_seconds.unwrap_or(0));
                Ok(manifest
                    .last_successful_run
                    .map(|last| now - last >= period)
                    .unwrap_or(true))
            }
            ScheduleType::Dependent => {
                match (
                    state.parent_last_successful_run,
                    manifest.last_successful_run,
                ) {
                    (Some(parent), Some(mine)) => Ok(parent > mine),
                    (Some(_), None) => Ok(true),
                    (None, _) => Ok(false),
                }
            }
        }
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
                    debug!("manifest manager: shutdown requested");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            error!("manifest manager tick failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("manifest manager: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}
