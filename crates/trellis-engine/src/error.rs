//! Engine error taxonomy

use trellis_core::error::CoreError;
use trellis_storage::StoreError;

/// Errors from scheduler and engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Workflow-core error
    #[error("workflow error: {0}")]
    Core(#[from] CoreError),

    /// Cron expression failed to parse
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Interval schedules require a positive period
    #[error("interval schedules require a positive period")]
    InvalidInterval,

    /// Dependent manifest chain loops back on itself
    #[error("dependent manifest cycle detected at {0}")]
    DependencyCycle(String),

    /// Schedule names an input type no workflow is registered for
    #[error("no workflow registered for input type {0}")]
    UnknownInput(String),

    /// Background job carries no routable input type
    #[error("background job {0} has no input type and no manifest")]
    UnroutableJob(i64),

    /// Engine lifecycle misuse
    #[error("engine is already running")]
    AlreadyRunning,
}
