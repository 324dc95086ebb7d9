//! DataContext trait definition
//!
//! The store interface every engine component talks to. Implementations must
//! be thread-safe; components acquire their own handle (an `Arc`) and never
//! share open transactions across ticks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use trellis_core::model::{
    BackgroundJob, DeadLetter, DeadLetterStatus, LogEntry, Manifest, ManifestGroup, Metadata,
    ScheduleType, StepMetadata, WorkQueueItem,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Metadata row not found
    #[error("metadata not found: {0}")]
    MetadataNotFound(i64),

    /// Manifest not found (by id or external id)
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Manifest group not found
    #[error("manifest group not found: {0}")]
    GroupNotFound(i64),

    /// Group deletion refused while manifests reference it
    #[error("manifest group {0} still has manifests referencing it")]
    GroupInUse(String),

    /// Work-queue row not found
    #[error("work item not found: {0}")]
    WorkItemNotFound(i64),

    /// Work-queue row is not in the queued state
    #[error("work item {0} is not queued")]
    NotQueued(i64),

    /// Dead letter not found
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(i64),

    /// An awaiting-intervention letter already exists for the manifest
    #[error("an open dead letter already exists for manifest {0}")]
    OpenDeadLetterExists(i64),

    /// Dead letter is not awaiting intervention
    #[error("dead letter {0} is not awaiting intervention")]
    DeadLetterNotOpen(i64),

    /// Background job not found
    #[error("background job not found: {0}")]
    JobNotFound(i64),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Input for creating a metadata row during dispatch
#[derive(Debug, Clone)]
pub struct NewMetadata {
    pub name: String,
    pub input: Option<Value>,
    pub manifest_id: Option<i64>,
    pub parent_id: Option<i64>,
}

/// Metadata to attach to a dispatched work item: freshly created, or an
/// existing row (dead-letter retries pre-create theirs)
#[derive(Debug, Clone)]
pub enum MetadataSeed {
    New(NewMetadata),
    Existing(i64),
}

/// Input for enqueuing a work item
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub workflow_name: String,
    pub input: Value,
    pub input_type_name: String,
    pub priority: u8,
    pub manifest_id: Option<i64>,
    pub metadata_id: Option<i64>,
}

/// Input for inserting a dead letter
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub manifest_id: i64,
    pub reason: String,
    pub retry_count_at_dead_letter: i32,
}

/// Operator resolution of an awaiting-intervention letter
#[derive(Debug, Clone)]
pub enum DeadLetterResolution {
    Acknowledge { note: String },
    Retry { retry_metadata_id: i64 },
}

/// Input for inserting a claimable background job
#[derive(Debug, Clone)]
pub struct NewBackgroundJob {
    pub metadata_id: i64,
    pub input: Option<Value>,
    pub input_type: Option<String>,
}

/// One enabled manifest with everything a manager tick needs, loaded in a
/// single query
#[derive(Debug, Clone)]
pub struct ManifestState {
    pub manifest: Manifest,
    pub group: ManifestGroup,
    /// Count of failed metadata rows across all of the manifest's runs
    pub failed_runs: i64,
    pub has_open_dead_letter: bool,
    /// Work items still holding the manifest's dispatch slot: queued, or
    /// dispatched with a non-terminal run
    pub live_queue_count: i64,
    /// Parent manifest's last success, when this manifest is dependent
    pub parent_last_successful_run: Option<DateTime<Utc>>,
}

/// A queued work item joined with its manifest/group dispatch envelope
#[derive(Debug, Clone)]
pub struct QueuedWork {
    pub item: WorkQueueItem,
    pub schedule_type: Option<ScheduleType>,
    pub group_id: Option<i64>,
    /// Manifest-less items dispatch unconditionally
    pub group_enabled: bool,
    pub group_max_active: Option<i32>,
}

/// Result of the atomic dispatch triple
#[derive(Debug, Clone)]
pub struct DispatchedWork {
    pub work: WorkQueueItem,
    pub metadata: Metadata,
    pub job: BackgroundJob,
}

/// Row counts removed by a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub metadata: u64,
    pub step_metadata: u64,
    pub logs: u64,
    pub work_items: u64,
}

/// Transactional store over the engine's entities
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait DataContext: Send + Sync + 'static {
    // =========================================================================
    // Metadata
    // =========================================================================

    /// Insert (id = 0) or update a metadata row; returns the row id.
    async fn save_metadata(&self, metadata: Metadata) -> Result<i64, StoreError>;

    async fn get_metadata(&self, id: i64) -> Result<Metadata, StoreError>;

    async fn get_metadata_by_external_id(&self, external_id: &str)
        -> Result<Metadata, StoreError>;

    async fn list_metadata_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<Metadata>, StoreError>;

    // =========================================================================
    // Step metadata
    // =========================================================================

    /// Insert (id = 0) or update a step record; returns the row id.
    async fn save_step_metadata(&self, step: StepMetadata) -> Result<i64, StoreError>;

    async fn list_step_metadata(
        &self,
        workflow_external_id: &str,
    ) -> Result<Vec<StepMetadata>, StoreError>;

    // =========================================================================
    // Logs
    // =========================================================================

    /// Insert a log line; returns the row id.
    async fn append_log(&self, entry: LogEntry) -> Result<i64, StoreError>;

    async fn list_logs(&self, metadata_id: i64) -> Result<Vec<LogEntry>, StoreError>;

    // =========================================================================
    // Manifests
    // =========================================================================

    /// Insert or update by the user-supplied external id (the natural key).
    /// `last_successful_run` is preserved on update.
    async fn upsert_manifest(&self, manifest: Manifest) -> Result<Manifest, StoreError>;

    async fn get_manifest(&self, id: i64) -> Result<Manifest, StoreError>;

    async fn get_manifest_by_external_id(&self, external_id: &str)
        -> Result<Manifest, StoreError>;

    async fn set_last_successful_run(
        &self,
        manifest_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Single-query tick input: every enabled manifest with failure counts,
    /// open-letter flags, live queue presence and the parent's last success.
    async fn load_manifest_states(&self) -> Result<Vec<ManifestState>, StoreError>;

    // =========================================================================
    // Manifest groups
    // =========================================================================

    /// Groups auto-materialize on first reference.
    async fn get_or_create_group(&self, name: &str) -> Result<ManifestGroup, StoreError>;

    /// Insert (id = 0) or update a group's envelope settings.
    async fn save_group(&self, group: ManifestGroup) -> Result<ManifestGroup, StoreError>;

    async fn get_group(&self, id: i64) -> Result<ManifestGroup, StoreError>;

    /// Refused with [`StoreError::GroupInUse`] while manifests reference it.
    async fn delete_group(&self, id: i64) -> Result<(), StoreError>;

    // =========================================================================
    // Work queue
    // =========================================================================

    async fn enqueue_work(&self, item: NewWorkItem) -> Result<WorkQueueItem, StoreError>;

    /// All queued items joined with manifest/group dispatch information.
    async fn load_queued(&self) -> Result<Vec<QueuedWork>, StoreError>;

    async fn get_work_item(&self, id: i64) -> Result<WorkQueueItem, StoreError>;

    async fn list_work_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<WorkQueueItem>, StoreError>;

    async fn cancel_work_item(&self, id: i64) -> Result<(), StoreError>;

    /// Active (`pending` or `in_progress`) run counts per manifest group.
    async fn count_active_jobs_per_group(&self) -> Result<HashMap<i64, i64>, StoreError>;

    /// The atomic dispatch triple: create (or load) the metadata row, flip
    /// the work item to dispatched, insert the claimable background job.
    /// On failure the work item stays queued so the next tick retries.
    async fn dispatch_work_item(
        &self,
        work_id: i64,
        seed: MetadataSeed,
    ) -> Result<DispatchedWork, StoreError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    /// Rejected with [`StoreError::OpenDeadLetterExists`] while an
    /// awaiting-intervention letter exists for the manifest.
    async fn insert_dead_letter(&self, letter: NewDeadLetter) -> Result<DeadLetter, StoreError>;

    async fn get_dead_letter(&self, id: i64) -> Result<DeadLetter, StoreError>;

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// Transition an awaiting-intervention letter to acknowledged/retried.
    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: DeadLetterResolution,
    ) -> Result<DeadLetter, StoreError>;

    // =========================================================================
    // Background jobs
    // =========================================================================

    async fn insert_background_job(
        &self,
        job: NewBackgroundJob,
    ) -> Result<BackgroundJob, StoreError>;

    /// Claim the oldest claimable job: `fetched_at` null, or older than the
    /// visibility timeout (a crashed worker's lease ages out). Stamps
    /// `fetched_at`; concurrent workers never claim the same row.
    async fn claim_background_job(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<BackgroundJob>, StoreError>;

    /// Jobs are deleted after execution whether the workflow succeeded or
    /// failed; outcome state lives on metadata.
    async fn delete_background_job(&self, id: i64) -> Result<(), StoreError>;

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Bulk-delete terminal metadata older than the cutoff for the given
    /// workflow names, with child work items, logs and step records.
    async fn purge_terminal_metadata(
        &self,
        workflow_names: &[String],
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, StoreError>;
}
