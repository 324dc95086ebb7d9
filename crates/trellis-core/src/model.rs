//! Domain entities persisted by the engine
//!
//! Every row carries an integer surrogate key (`0` until first persisted) and,
//! where noted, a 32-hex-char external id that is the only identifier crossing
//! the API boundary. Enum columns are stored as snake_case strings; all
//! timestamps are UTC.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::track::FaultData;

/// Generate a fresh 32-hex-char external id.
pub fn new_external_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Clamp a priority into the authoritative `[0, 31]` range.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.min(31)
}

// =============================================================================
// Workflow execution records
// =============================================================================

/// State of a workflow execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowState {
    /// Terminal states are eligible for retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown workflow state: {other}")),
        }
    }
}

/// One row per workflow execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: i64,
    pub external_id: String,
    /// Workflow name as registered on the bus
    pub name: String,
    /// Nesting: set when this run was started by another workflow
    pub parent_id: Option<i64>,
    pub state: WorkflowState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_step: Option<String>,
    pub failure_exception: Option<String>,
    pub failure_reason: Option<String>,
    pub stack_trace: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub manifest_id: Option<i64>,
    /// Typed run input awaiting parameter serialization; not a column
    #[serde(skip)]
    pub pending_input: Option<Value>,
    /// Typed run output awaiting parameter serialization; not a column
    #[serde(skip)]
    pub pending_output: Option<Value>,
}

impl Metadata {
    /// Fresh `Pending` record for a new execution attempt.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            external_id: new_external_id(),
            name: name.into(),
            parent_id: None,
            state: WorkflowState::Pending,
            start_time: Utc::now(),
            end_time: None,
            failure_step: None,
            failure_exception: None,
            failure_reason: None,
            stack_trace: None,
            input: None,
            output: None,
            manifest_id: None,
            pending_input: None,
            pending_output: None,
        }
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_manifest(mut self, manifest_id: i64) -> Self {
        self.manifest_id = Some(manifest_id);
        self
    }

    /// Flip to `InProgress` at workflow start.
    pub fn begin(&mut self) {
        self.state = WorkflowState::InProgress;
    }

    /// Terminal success transition.
    pub fn complete(&mut self) {
        self.state = WorkflowState::Completed;
        self.end_time = Some(Utc::now());
    }

    /// Terminal failure transition with structured failure fields.
    pub fn fail(&mut self, fault: &FaultData) {
        self.state = WorkflowState::Failed;
        self.end_time = Some(Utc::now());
        self.failure_step = Some(fault.step.clone());
        self.failure_exception = Some(fault.error_type.clone());
        self.failure_reason = Some(fault.message.clone());
        self.stack_trace = serde_json::to_string(fault).ok();
    }
}

/// Shared, mutable handle to a tracked [`Metadata`] row
///
/// Effect providers and the harness observe the same record; the handle
/// serializes as a summary so it can travel through step logging.
#[derive(Clone)]
pub struct MetadataHandle(Arc<RwLock<Metadata>>);

impl MetadataHandle {
    pub fn new(metadata: Metadata) -> Self {
        Self(Arc::new(RwLock::new(metadata)))
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Metadata> {
        self.0.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Metadata> {
        self.0.write()
    }

    pub fn id(&self) -> i64 {
        self.0.read().id
    }

    pub fn external_id(&self) -> String {
        self.0.read().external_id.clone()
    }

    /// Detached copy of the current record state.
    pub fn snapshot(&self) -> Metadata {
        self.0.read().clone()
    }
}

impl std::fmt::Debug for MetadataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.0.read();
        f.debug_struct("MetadataHandle")
            .field("external_id", &guard.external_id)
            .field("name", &guard.name)
            .field("state", &guard.state)
            .finish()
    }
}

// Steps can pull the run's own metadata handle out of memory (the manifest
// executor does, to pass itself as the parent of the scheduled run).
crate::memory_value!(MetadataHandle);

impl Serialize for MetadataHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let guard = self.0.read();
        let mut state = serializer.serialize_struct("MetadataHandle", 3)?;
        state.serialize_field("external_id", &guard.external_id)?;
        state.serialize_field("name", &guard.name)?;
        state.serialize_field("state", &guard.state)?;
        state.end()
    }
}

/// State of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Step ran and produced its output
    Ok,
    /// Step ran and faulted
    Fault,
    /// Step never ran because the chain had already faulted
    Skipped,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Fault => write!(f, "fault"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "fault" => Ok(Self::Fault),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step state: {other}")),
        }
    }
}

/// One row per step execution inside a workflow run
///
/// Constructed before the step executes, finalized once after, never mutated
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetadata {
    pub id: i64,
    pub external_id: String,
    /// External id of the owning workflow run
    pub workflow_external_id: String,
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub state: StepState,
    pub has_ran: bool,
    pub start_time_utc: Option<DateTime<Utc>>,
    pub end_time_utc: Option<DateTime<Utc>>,
    pub output_json: Option<Value>,
}

impl StepMetadata {
    pub fn new(
        workflow_external_id: impl Into<String>,
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            external_id: new_external_id(),
            workflow_external_id: workflow_external_id.into(),
            name: name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
            state: StepState::Skipped,
            has_ran: false,
            start_time_utc: None,
            end_time_utc: None,
            output_json: None,
        }
    }
}

/// Structured log line owned by a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    /// Filled in by the persistence effect once the owning metadata has an id
    pub metadata_id: i64,
    pub level: String,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            metadata_id: 0,
            level: level.into(),
            message: message.into(),
            logged_at: Utc::now(),
        }
    }
}

// =============================================================================
// Scheduling records
// =============================================================================

/// Cadence of a scheduled workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    None,
    Cron,
    Interval,
    OnDemand,
    Dependent,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Cron => write!(f, "cron"),
            Self::Interval => write!(f, "interval"),
            Self::OnDemand => write!(f, "on_demand"),
            Self::Dependent => write!(f, "dependent"),
        }
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "on_demand" => Ok(Self::OnDemand),
            "dependent" => Ok(Self::Dependent),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// Declarative scheduled workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: i64,
    /// User-supplied natural key
    pub external_id: String,
    /// Workflow name as registered on the bus
    pub name: String,
    /// Fully qualified workflow type path
    pub full_name: String,
    /// Input type name the bus routes on
    pub property_type: String,
    /// Serialized workflow input
    pub properties: Value,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub max_retries: i32,
    pub is_enabled: bool,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub depends_on_manifest_id: Option<i64>,
    pub manifest_group_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Shared dispatch envelope for manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub id: i64,
    pub name: String,
    /// Per-group cap on `Pending`/`InProgress` runs; `None` means unlimited
    pub max_active_jobs: Option<i32>,
    pub priority: u8,
    pub is_enabled: bool,
}

impl ManifestGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            max_active_jobs: None,
            priority: 0,
            is_enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_max_active_jobs(mut self, max: i32) -> Self {
        self.max_active_jobs = Some(max);
        self
    }
}

/// Status of a work-queue intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkQueueStatus {
    Queued,
    Dispatched,
    Cancelled,
}

impl std::fmt::Display for WorkQueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkQueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown work queue status: {other}")),
        }
    }
}

/// Persisted "intent to run", decoupling scheduling from dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueItem {
    pub id: i64,
    pub external_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub input_type_name: String,
    pub status: WorkQueueStatus,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub priority: u8,
    pub manifest_id: Option<i64>,
    pub metadata_id: Option<i64>,
}

/// Status of a dead letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    AwaitingIntervention,
    Retried,
    Acknowledged,
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingIntervention => write!(f, "awaiting_intervention"),
            Self::Retried => write!(f, "retried"),
            Self::Acknowledged => write!(f, "acknowledged"),
        }
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_intervention" => Ok(Self::AwaitingIntervention),
            "retried" => Ok(Self::Retried),
            "acknowledged" => Ok(Self::Acknowledged),
            other => Err(format!("unknown dead letter status: {other}")),
        }
    }
}

/// Terminal manifest-level failure record requiring operator action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub manifest_id: i64,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
    pub retry_count_at_dead_letter: i32,
    pub status: DeadLetterStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub retry_metadata_id: Option<i64>,
}

/// Claimable row leased by task-server workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: i64,
    pub metadata_id: i64,
    pub input: Option<Value>,
    pub input_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_ids_are_32_hex_chars() {
        let id = new_external_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_external_id());
    }

    #[test]
    fn priority_is_clamped_to_the_envelope() {
        assert_eq!(clamp_priority(0), 0);
        assert_eq!(clamp_priority(31), 31);
        assert_eq!(clamp_priority(200), 31);
        assert_eq!(ManifestGroup::new("g").with_priority(99).priority, 31);
    }

    #[test]
    fn metadata_failure_fields_are_set_on_fail() {
        let mut metadata = Metadata::new("OrderWorkflow");
        metadata.begin();
        assert_eq!(metadata.state, WorkflowState::InProgress);

        let fault = FaultData {
            error_type: "unhandled".into(),
            step: "ChargeCard".into(),
            message: "declined".into(),
            workflow_name: "OrderWorkflow".into(),
            workflow_external_id: metadata.external_id.clone(),
        };
        metadata.fail(&fault);

        assert_eq!(metadata.state, WorkflowState::Failed);
        assert_eq!(metadata.failure_step.as_deref(), Some("ChargeCard"));
        assert_eq!(metadata.failure_exception.as_deref(), Some("unhandled"));
        assert!(metadata.end_time.unwrap() >= metadata.start_time);
    }

    #[test]
    fn enum_round_trips() {
        for state in ["pending", "in_progress", "completed", "failed"] {
            assert_eq!(state.parse::<WorkflowState>().unwrap().to_string(), state);
        }
        for state in ["ok", "fault", "skipped"] {
            assert_eq!(state.parse::<StepState>().unwrap().to_string(), state);
        }
        for kind in ["none", "cron", "interval", "on_demand", "dependent"] {
            assert_eq!(kind.parse::<ScheduleType>().unwrap().to_string(), kind);
        }
        assert!("bogus".parse::<WorkflowState>().is_err());
    }
}
