//! In-memory implementation of DataContext
//!
//! Primarily for tests and the in-process task server. All data lives behind
//! one lock and every operation provides the same observable semantics as the
//! PostgreSQL implementation, including the atomicity of dispatch and the
//! single-claimant guarantee on background jobs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use trellis_core::model::{
    clamp_priority, new_external_id, BackgroundJob, DeadLetter, DeadLetterStatus, LogEntry,
    Manifest, ManifestGroup, Metadata, StepMetadata, WorkQueueItem, WorkQueueStatus,
    WorkflowState,
};

use crate::context::*;

#[derive(Default)]
struct Inner {
    metadata: HashMap<i64, Metadata>,
    step_metadata: HashMap<i64, StepMetadata>,
    logs: HashMap<i64, LogEntry>,
    manifests: HashMap<i64, Manifest>,
    groups: HashMap<i64, ManifestGroup>,
    work_queue: HashMap<i64, WorkQueueItem>,
    dead_letters: HashMap<i64, DeadLetter>,
    background_jobs: HashMap<i64, BackgroundJob>,
    next_id: i64,
}

impl Inner {
    fn alloc(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of [`DataContext`]
///
/// # Example
///
/// ```
/// use trellis_storage::InMemoryDataContext;
///
/// let ctx = InMemoryDataContext::new();
/// ```
#[derive(Default)]
pub struct InMemoryDataContext {
    inner: RwLock<Inner>,
}

impl InMemoryDataContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of metadata rows (for tests).
    pub fn metadata_count(&self) -> usize {
        self.inner.read().metadata.len()
    }

    /// Number of queued work items (for tests).
    pub fn queued_count(&self) -> usize {
        self.inner
            .read()
            .work_queue
            .values()
            .filter(|w| w.status == WorkQueueStatus::Queued)
            .count()
    }

    /// Number of claimable background jobs (for tests).
    pub fn job_count(&self) -> usize {
        self.inner.read().background_jobs.len()
    }

    /// Clear all data (for tests).
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

#[async_trait]
impl DataContext for InMemoryDataContext {
    async fn save_metadata(&self, mut metadata: Metadata) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        metadata.pending_input = None;
        metadata.pending_output = None;
        if metadata.id == 0 {
            metadata.id = inner.alloc();
        }
        let id = metadata.id;
        inner.metadata.insert(id, metadata);
        Ok(id)
    }

    async fn get_metadata(&self, id: i64) -> Result<Metadata, StoreError> {
        self.inner
            .read()
            .metadata
            .get(&id)
            .cloned()
            .ok_or(StoreError::MetadataNotFound(id))
    }

    async fn get_metadata_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Metadata, StoreError> {
        self.inner
            .read()
            .metadata
            .values()
            .find(|m| m.external_id == external_id)
            .cloned()
            .ok_or(StoreError::MetadataNotFound(0))
    }

    async fn list_metadata_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<Metadata>, StoreError> {
        let mut rows: Vec<Metadata> = self
            .inner
            .read()
            .metadata
            .values()
            .filter(|m| m.manifest_id == Some(manifest_id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        Ok(rows)
    }

    async fn save_step_metadata(&self, mut step: StepMetadata) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        if step.id == 0 {
            step.id = inner.alloc();
        }
        let id = step.id;
        inner.step_metadata.insert(id, step);
        Ok(id)
    }

    async fn list_step_metadata(
        &self,
        workflow_external_id: &str,
    ) -> Result<Vec<StepMetadata>, StoreError> {
        let mut rows: Vec<StepMetadata> = self
            .inner
            .read()
            .step_metadata
            .values()
            .filter(|s| s.workflow_external_id == workflow_external_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        Ok(rows)
    }

    async fn append_log(&self, mut entry: LogEntry) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        entry.id = inner.alloc();
        let id = entry.id;
        inner.logs.insert(id, entry);
        Ok(id)
    }

    async fn list_logs(&self, metadata_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        let mut rows: Vec<LogEntry> = self
            .inner
            .read()
            .logs
            .values()
            .filter(|l| l.metadata_id == metadata_id)
            .cloned()
            .collect();
        rows.sort_by_key(|l| l.id);
        Ok(rows)
    }

    async fn upsert_manifest(&self, mut manifest: Manifest) -> Result<Manifest, StoreError> {
        let mut inner = self.inner.write();
        let existing = inner
            .manifests
            .values()
            .find(|m| m.external_id == manifest.external_id)
            .map(|m| (m.id, m.last_successful_run, m.created_at));

        match existing {
            Some((id, last_successful_run, created_at)) => {
                manifest.id = id;
                manifest.last_successful_run = last_successful_run;
                manifest.created_at = created_at;
            }
            None => {
                manifest.id = inner.alloc();
            }
        }
        inner.manifests.insert(manifest.id, manifest.clone());
        Ok(manifest)
    }

    async fn get_manifest(&self, id: i64) -> Result<Manifest, StoreError> {
        self.inner
            .read()
            .manifests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::ManifestNotFound(id.to_string()))
    }

    async fn get_manifest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Manifest, StoreError> {
        self.inner
            .read()
            .manifests
            .values()
            .find(|m| m.external_id == external_id)
            .cloned()
            .ok_or_else(|| StoreError::ManifestNotFound(external_id.to_string()))
    }

    async fn set_last_successful_run(
        &self,
        manifest_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let manifest = inner
            .manifests
            .get_mut(&manifest_id)
            .ok_or_else(|| StoreError::ManifestNotFound(manifest_id.to_string()))?;
        manifest.last_successful_run = Some(at);
        Ok(())
    }

    async fn load_manifest_states(&self) -> Result<Vec<ManifestState>, StoreError> {
        let inner = self.inner.read();
        let mut states = Vec::new();

        let mut manifests: Vec<&Manifest> =
            inner.manifests.values().filter(|m| m.is_enabled).collect();
        manifests.sort_by_key(|m| m.id);

        for manifest in manifests {
            let group = inner
                .groups
                .get(&manifest.manifest_group_id)
                .cloned()
                .ok_or(StoreError::GroupNotFound(manifest.manifest_group_id))?;

            let failed_runs = inner
                .metadata
                .values()
                .filter(|m| {
                    m.manifest_id == Some(manifest.id) && m.state == WorkflowState::Failed
                })
                .count() as i64;

            let has_open_dead_letter = inner.dead_letters.values().any(|d| {
                d.manifest_id == manifest.id && d.status == DeadLetterStatus::AwaitingIntervention
            });

            // A dispatched item only counts while its run is still live;
            // terminal runs must not block the next schedule of the manifest.
            let live_queue_count = inner
                .work_queue
                .values()
                .filter(|w| {
                    if w.manifest_id != Some(manifest.id) {
                        return false;
                    }
                    match w.status {
                        WorkQueueStatus::Queued => true,
                        WorkQueueStatus::Dispatched => w
                            .metadata_id
                            .and_then(|id| inner.metadata.get(&id))
                            .map(|m| !m.state.is_terminal())
                            .unwrap_or(true),
                        WorkQueueStatus::Cancelled => false,
                    }
                })
                .count() as i64;

            let parent_last_successful_run = manifest
                .depends_on_manifest_id
                .and_then(|pid| inner.manifests.get(&pid))
                .and_then(|p| p.last_successful_run);

            states.push(ManifestState {
                manifest: manifest.clone(),
                group,
                failed_runs,
                has_open_dead_letter,
                live_queue_count,
                parent_last_successful_run,
            });
        }
        Ok(states)
    }

    async fn get_or_create_group(&self, name: &str) -> Result<ManifestGroup, StoreError> {
        let mut inner = self.inner.write();
        if let Some(group) = inner.groups.values().find(|g| g.name == name) {
            return Ok(group.clone());
        }
        let mut group = ManifestGroup::new(name);
        group.id = inner.alloc();
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn save_group(&self, mut group: ManifestGroup) -> Result<ManifestGroup, StoreError> {
        let mut inner = self.inner.write();
        group.priority = clamp_priority(group.priority);
        let existing_id = inner
            .groups
            .values()
            .find(|g| g.name == group.name)
            .map(|g| g.id);
        group.id = match existing_id {
            Some(id) => id,
            None => inner.alloc(),
        };
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn get_group(&self, id: i64) -> Result<ManifestGroup, StoreError> {
        self.inner
            .read()
            .groups
            .get(&id)
            .cloned()
            .ok_or(StoreError::GroupNotFound(id))
    }

    async fn delete_group(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let name = inner
            .groups
            .get(&id)
            .map(|g| g.name.clone())
            .ok_or(StoreError::GroupNotFound(id))?;
        if inner.manifests.values().any(|m| m.manifest_group_id == id) {
            return Err(StoreError::GroupInUse(name));
        }
        inner.groups.remove(&id);
        Ok(())
    }

    async fn enqueue_work(&self, item: NewWorkItem) -> Result<WorkQueueItem, StoreError> {
        let mut inner = self.inner.write();
        let id = inner.alloc();
        let work = WorkQueueItem {
            id,
            external_id: new_external_id(),
            workflow_name: item.workflow_name,
            input: item.input,
            input_type_name: item.input_type_name,
            status: WorkQueueStatus::Queued,
            created_at: Utc::now(),
            dispatched_at: None,
            priority: clamp_priority(item.priority),
            manifest_id: item.manifest_id,
            metadata_id: item.metadata_id,
        };
        inner.work_queue.insert(id, work.clone());
        Ok(work)
    }

    async fn load_queued(&self) -> Result<Vec<QueuedWork>, StoreError> {
        let inner = self.inner.read();
        let mut items: Vec<&WorkQueueItem> = inner
            .work_queue
            .values()
            .filter(|w| w.status == WorkQueueStatus::Queued)
            .collect();
        items.sort_by_key(|w| (w.created_at, w.id));

        Ok(items
            .into_iter()
            .map(|item| {
                let manifest = item.manifest_id.and_then(|id| inner.manifests.get(&id));
                let group =
                    manifest.and_then(|m| inner.groups.get(&m.manifest_group_id));
                QueuedWork {
                    item: item.clone(),
                    schedule_type: manifest.map(|m| m.schedule_type),
                    group_id: group.map(|g| g.id),
                    group_enabled: group.map(|g| g.is_enabled).unwrap_or(true),
                    group_max_active: group.and_then(|g| g.max_active_jobs),
                }
            })
            .collect())
    }

    async fn get_work_item(&self, id: i64) -> Result<WorkQueueItem, StoreError> {
        self.inner
            .read()
            .work_queue
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkItemNotFound(id))
    }

    async fn list_work_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<WorkQueueItem>, StoreError> {
        let mut rows: Vec<WorkQueueItem> = self
            .inner
            .read()
            .work_queue
            .values()
            .filter(|w| w.manifest_id == Some(manifest_id))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn cancel_work_item(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let item = inner
            .work_queue
            .get_mut(&id)
            .ok_or(StoreError::WorkItemNotFound(id))?;
        if item.status != WorkQueueStatus::Queued {
            return Err(StoreError::NotQueued(id));
        }
        item.status = WorkQueueStatus::Cancelled;
        Ok(())
    }

    async fn count_active_jobs_per_group(&self) -> Result<HashMap<i64, i64>, StoreError> {
        let inner = self.inner.read();
        let mut counts: HashMap<i64, i64> = HashMap::new();
        for metadata in inner.metadata.values() {
            if !matches!(
                metadata.state,
                WorkflowState::Pending | WorkflowState::InProgress
            ) {
                continue;
            }
            let Some(manifest_id) = metadata.manifest_id else {
                continue;
            };
            if let Some(manifest) = inner.manifests.get(&manifest_id) {
                *counts.entry(manifest.manifest_group_id).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn dispatch_work_item(
        &self,
        work_id: i64,
        seed: MetadataSeed,
    ) -> Result<DispatchedWork, StoreError> {
        // One write lock for the whole triple keeps it atomic.
        let mut inner = self.inner.write();

        let item = inner
            .work_queue
            .get(&work_id)
            .cloned()
            .ok_or(StoreError::WorkItemNotFound(work_id))?;
        if item.status != WorkQueueStatus::Queued {
            return Err(StoreError::NotQueued(work_id));
        }

        let now = Utc::now();
        let metadata = match seed {
            MetadataSeed::New(new) => {
                let id = inner.alloc();
                let mut metadata = Metadata::new(new.name);
                metadata.id = id;
                metadata.input = new.input;
                metadata.manifest_id = new.manifest_id;
                metadata.parent_id = new.parent_id;
                inner.metadata.insert(id, metadata.clone());
                metadata
            }
            MetadataSeed::Existing(id) => inner
                .metadata
                .get(&id)
                .cloned()
                .ok_or(StoreError::MetadataNotFound(id))?,
        };

        let work = {
            let item = inner.work_queue.get_mut(&work_id).expect("locked above");
            item.status = WorkQueueStatus::Dispatched;
            item.dispatched_at = Some(now);
            item.metadata_id = Some(metadata.id);
            item.clone()
        };

        let job_id = inner.alloc();
        let job = BackgroundJob {
            id: job_id,
            metadata_id: metadata.id,
            input: Some(work.input.clone()),
            input_type: Some(work.input_type_name.clone()),
            created_at: now,
            fetched_at: None,
        };
        inner.background_jobs.insert(job_id, job.clone());

        Ok(DispatchedWork {
            work,
            metadata,
            job,
        })
    }

    async fn insert_dead_letter(&self, letter: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        let mut inner = self.inner.write();
        let open_exists = inner.dead_letters.values().any(|d| {
            d.manifest_id == letter.manifest_id
                && d.status == DeadLetterStatus::AwaitingIntervention
        });
        if open_exists {
            return Err(StoreError::OpenDeadLetterExists(letter.manifest_id));
        }

        let id = inner.alloc();
        let dead_letter = DeadLetter {
            id,
            manifest_id: letter.manifest_id,
            dead_lettered_at: Utc::now(),
            reason: letter.reason,
            retry_count_at_dead_letter: letter.retry_count_at_dead_letter,
            status: DeadLetterStatus::AwaitingIntervention,
            resolved_at: None,
            resolution_note: None,
            retry_metadata_id: None,
        };
        inner.dead_letters.insert(id, dead_letter.clone());
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, id: i64) -> Result<DeadLetter, StoreError> {
        self.inner
            .read()
            .dead_letters
            .get(&id)
            .cloned()
            .ok_or(StoreError::DeadLetterNotFound(id))
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut rows: Vec<DeadLetter> = self
            .inner
            .read()
            .dead_letters
            .values()
            .filter(|d| status.map(|s| d.status == s).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|d| std::cmp::Reverse(d.id));
        Ok(rows)
    }

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: DeadLetterResolution,
    ) -> Result<DeadLetter, StoreError> {
        let mut inner = self.inner.write();
        let letter = inner
            .dead_letters
            .get_mut(&id)
            .ok_or(StoreError::DeadLetterNotFound(id))?;
        if letter.status != DeadLetterStatus::AwaitingIntervention {
            return Err(StoreError::DeadLetterNotOpen(id));
        }

        letter.resolved_at = Some(Utc::now());
        match resolution {
            DeadLetterResolution::Acknowledge { note } => {
                letter.status = DeadLetterStatus::Acknowledged;
                letter.resolution_note = Some(note);
            }
            DeadLetterResolution::Retry { retry_metadata_id } => {
                letter.status = DeadLetterStatus::Retried;
                letter.retry_metadata_id = Some(retry_metadata_id);
            }
        }
        Ok(letter.clone())
    }

    async fn insert_background_job(
        &self,
        job: NewBackgroundJob,
    ) -> Result<BackgroundJob, StoreError> {
        let mut inner = self.inner.write();
        let id = inner.alloc();
        let job = BackgroundJob {
            id,
            metadata_id: job.metadata_id,
            input: job.input,
            input_type: job.input_type,
            created_at: Utc::now(),
            fetched_at: None,
        };
        inner.background_jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn claim_background_job(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let lease_cutoff =
            now - chrono::Duration::from_std(visibility_timeout).unwrap_or_default();

        let claimable = inner
            .background_jobs
            .values()
            .filter(|j| j.fetched_at.map(|t| t < lease_cutoff).unwrap_or(true))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(claimable.map(|id| {
            let job = inner.background_jobs.get_mut(&id).expect("locked above");
            job.fetched_at = Some(now);
            job.clone()
        }))
    }

    async fn delete_background_job(&self, id: i64) -> Result<(), StoreError> {
        self.inner.write().background_jobs.remove(&id);
        Ok(())
    }

    async fn purge_terminal_metadata(
        &self,
        workflow_names: &[String],
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, StoreError> {
        let mut inner = self.inner.write();

        let victims: Vec<(i64, String)> = inner
            .metadata
            .values()
            .filter(|m| {
                workflow_names.contains(&m.name)
                    && m.start_time < cutoff
                    && m.state.is_terminal()
            })
            .map(|m| (m.id, m.external_id.clone()))
            .collect();

        let mut counts = PurgeCounts::default();
        for (id, external_id) in &victims {
            let before = inner.work_queue.len();
            inner.work_queue.retain(|_, w| w.metadata_id != Some(*id));
            counts.work_items += (before - inner.work_queue.len()) as u64;

            let before = inner.logs.len();
            inner.logs.retain(|_, l| l.metadata_id != *id);
            counts.logs += (before - inner.logs.len()) as u64;

            let before = inner.step_metadata.len();
            inner
                .step_metadata
                .retain(|_, s| s.workflow_external_id != *external_id);
            counts.step_metadata += (before - inner.step_metadata.len()) as u64;

            inner.metadata.remove(id);
            counts.metadata += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> InMemoryDataContext {
        InMemoryDataContext::new()
    }

    async fn seeded_manifest(ctx: &InMemoryDataContext) -> Manifest {
        let group = ctx.get_or_create_group("default").await.unwrap();
        ctx.upsert_manifest(Manifest {
            id: 0,
            external_id: "daily-x".into(),
            name: "ReportWorkflow".into(),
            full_name: "app::ReportWorkflow".into(),
            property_type: "ReportRequest".into(),
            properties: json!({"day": 1}),
            schedule_type: trellis_core::model::ScheduleType::Cron,
            cron_expression: Some("0 * * * * *".into()),
            interval_seconds: None,
            max_retries: 3,
            is_enabled: true,
            last_successful_run: None,
            depends_on_manifest_id: None,
            manifest_group_id: group.id,
            created_at: Utc::now(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn metadata_insert_assigns_ids_and_round_trips() {
        let ctx = ctx();
        let id = ctx
            .save_metadata(Metadata::new("OrderWorkflow"))
            .await
            .unwrap();
        assert!(id > 0);

        let loaded = ctx.get_metadata(id).await.unwrap();
        assert_eq!(loaded.name, "OrderWorkflow");
        assert_eq!(loaded.state, WorkflowState::Pending);

        assert!(matches!(
            ctx.get_metadata(9999).await,
            Err(StoreError::MetadataNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn manifest_upsert_is_idempotent_on_external_id() {
        let ctx = ctx();
        let first = seeded_manifest(&ctx).await;
        ctx.set_last_successful_run(first.id, Utc::now())
            .await
            .unwrap();

        // Re-scheduling with the same external id keeps the row and its
        // last successful run.
        let second = seeded_manifest(&ctx).await;
        assert_eq!(first.id, second.id);
        let reloaded = ctx.get_manifest(first.id).await.unwrap();
        assert!(reloaded.last_successful_run.is_some());
    }

    #[tokio::test]
    async fn dispatch_flips_status_and_creates_the_triple() {
        let ctx = ctx();
        let manifest = seeded_manifest(&ctx).await;
        let item = ctx
            .enqueue_work(NewWorkItem {
                workflow_name: manifest.name.clone(),
                input: manifest.properties.clone(),
                input_type_name: manifest.property_type.clone(),
                priority: 5,
                manifest_id: Some(manifest.id),
                metadata_id: None,
            })
            .await
            .unwrap();
        assert_eq!(item.status, WorkQueueStatus::Queued);

        let dispatched = ctx
            .dispatch_work_item(
                item.id,
                MetadataSeed::New(NewMetadata {
                    name: manifest.name.clone(),
                    input: Some(manifest.properties.clone()),
                    manifest_id: Some(manifest.id),
                    parent_id: None,
                }),
            )
            .await
            .unwrap();

        assert_eq!(dispatched.work.status, WorkQueueStatus::Dispatched);
        assert!(dispatched.work.dispatched_at.is_some());
        assert_eq!(dispatched.work.metadata_id, Some(dispatched.metadata.id));
        assert_eq!(dispatched.job.metadata_id, dispatched.metadata.id);

        // A second dispatch of the same item is refused.
        assert!(matches!(
            ctx.dispatch_work_item(item.id, MetadataSeed::Existing(dispatched.metadata.id))
                .await,
            Err(StoreError::NotQueued(_))
        ));
    }

    #[tokio::test]
    async fn only_one_open_dead_letter_per_manifest() {
        let ctx = ctx();
        let manifest = seeded_manifest(&ctx).await;

        ctx.insert_dead_letter(NewDeadLetter {
            manifest_id: manifest.id,
            reason: "Max retries exceeded: 3 >= 3".into(),
            retry_count_at_dead_letter: 3,
        })
        .await
        .unwrap();

        let second = ctx
            .insert_dead_letter(NewDeadLetter {
                manifest_id: manifest.id,
                reason: "again".into(),
                retry_count_at_dead_letter: 4,
            })
            .await;
        assert!(matches!(second, Err(StoreError::OpenDeadLetterExists(_))));
    }

    #[tokio::test]
    async fn resolve_requires_an_open_letter() {
        let ctx = ctx();
        let manifest = seeded_manifest(&ctx).await;
        let letter = ctx
            .insert_dead_letter(NewDeadLetter {
                manifest_id: manifest.id,
                reason: "r".into(),
                retry_count_at_dead_letter: 1,
            })
            .await
            .unwrap();

        let resolved = ctx
            .resolve_dead_letter(
                letter.id,
                DeadLetterResolution::Acknowledge {
                    note: "known flake".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, DeadLetterStatus::Acknowledged);
        assert!(resolved.resolved_at.is_some());

        let again = ctx
            .resolve_dead_letter(
                letter.id,
                DeadLetterResolution::Acknowledge { note: "again".into() },
            )
            .await;
        assert!(matches!(again, Err(StoreError::DeadLetterNotOpen(_))));
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_the_lease_ages_out() {
        let ctx = ctx();
        let metadata_id = ctx
            .save_metadata(Metadata::new("OrderWorkflow"))
            .await
            .unwrap();
        ctx.insert_background_job(NewBackgroundJob {
            metadata_id,
            input: Some(json!({})),
            input_type: Some("Order".into()),
        })
        .await
        .unwrap();

        let timeout = Duration::from_secs(300);
        let first = ctx.claim_background_job(timeout).await.unwrap();
        assert!(first.is_some());

        // Claimed and inside the visibility window: nothing to claim.
        let second = ctx.claim_background_job(timeout).await.unwrap();
        assert!(second.is_none());

        // A zero timeout ages the lease out immediately.
        let reclaimed = ctx.claim_background_job(Duration::ZERO).await.unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn claim_takes_the_oldest_job_first() {
        let ctx = ctx();
        let first_metadata = ctx
            .save_metadata(Metadata::new("OrderWorkflow"))
            .await
            .unwrap();
        let second_metadata = ctx
            .save_metadata(Metadata::new("OrderWorkflow"))
            .await
            .unwrap();
        ctx.insert_background_job(NewBackgroundJob {
            metadata_id: first_metadata,
            input: None,
            input_type: None,
        })
        .await
        .unwrap();
        ctx.insert_background_job(NewBackgroundJob {
            metadata_id: second_metadata,
            input: None,
            input_type: None,
        })
        .await
        .unwrap();

        let claimed = ctx
            .claim_background_job(Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.metadata_id, first_metadata);
    }

    #[tokio::test]
    async fn group_deletion_is_refused_while_referenced() {
        let ctx = ctx();
        let manifest = seeded_manifest(&ctx).await;
        let err = ctx.delete_group(manifest.manifest_group_id).await;
        assert!(matches!(err, Err(StoreError::GroupInUse(_))));
    }

    #[tokio::test]
    async fn purge_deletes_terminal_rows_and_children_only() {
        let ctx = ctx();

        // Old terminal run with children.
        let mut old = Metadata::new("ReportWorkflow");
        old.start_time = Utc::now() - chrono::Duration::hours(2);
        old.complete();
        let old_external = old.external_id.clone();
        let old_id = ctx.save_metadata(old).await.unwrap();
        ctx.append_log(LogEntry {
            id: 0,
            metadata_id: old_id,
            level: "INFO".into(),
            message: "done".into(),
            logged_at: Utc::now(),
        })
        .await
        .unwrap();
        ctx.save_step_metadata(StepMetadata::new(
            old_external.clone(),
            "Render",
            "ReportRequest",
            "Report",
        ))
        .await
        .unwrap();

        // Old but still in progress: kept regardless of age.
        let mut live = Metadata::new("ReportWorkflow");
        live.start_time = Utc::now() - chrono::Duration::hours(2);
        live.begin();
        let live_id = ctx.save_metadata(live).await.unwrap();

        let counts = ctx
            .purge_terminal_metadata(
                &["ReportWorkflow".to_string()],
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(counts.metadata, 1);
        assert_eq!(counts.logs, 1);
        assert_eq!(counts.step_metadata, 1);
        assert!(ctx.get_metadata(old_id).await.is_err());
        assert!(ctx.get_metadata(live_id).await.is_ok());
    }
}
