//! Error taxonomy for the workflow core
//!
//! Structural violations surface immediately as [`CoreError`]; step user-code
//! failures travel down the chain as [`crate::track::FaultData`] values.
//! Cancellation is its own variant and is always re-propagated, never wrapped
//! into fault data.

use crate::track::FaultData;

/// Error type for workflow-structural failures
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The run's cancellation handle fired
    #[error("workflow run was cancelled")]
    Cancelled,

    /// A step asked the run memory for a type nothing has produced
    #[error("no value of type {type_name} in workflow memory")]
    MissingMemory { type_name: &'static str },

    /// A step asked the service container for an unattached capability
    #[error("no service of type {type_name} attached to the workflow")]
    MissingService { type_name: &'static str },

    /// Two workflows declared the same input type
    #[error("input type {input_type} is already mapped to workflow {workflow}")]
    DuplicateInput {
        input_type: String,
        workflow: String,
    },

    /// No workflow registered for the given input type
    #[error("no workflow registered for input type {0}")]
    UnmappedInput(String),

    /// The chain resolved without producing the requested output type
    #[error("workflow resolved without a value of type {type_name}")]
    Unresolved { type_name: &'static str },

    /// A step faulted and the failure was surfaced through `run`
    #[error("workflow {} failed at step {}: {}", .0.workflow_name, .0.step, .0.message)]
    Fault(FaultData),

    /// JSON (de)serialization failure at a workflow boundary
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Effect runner failure while flushing tracked models
    #[error("effect error: {0}")]
    Effect(#[from] crate::effect::EffectError),
}

impl CoreError {
    /// Stable label used when capturing this error into fault data.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::MissingMemory { .. } => "missing_memory",
            Self::MissingService { .. } => "missing_service",
            Self::DuplicateInput { .. } => "duplicate_input",
            Self::UnmappedInput(_) => "unmapped_input",
            Self::Unresolved { .. } => "unresolved",
            Self::Fault(_) => "fault",
            Self::Serialization(_) => "serialization",
            Self::Effect(_) => "effect",
        }
    }

    /// Whether the error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn missing_memory<T: ?Sized>() -> Self {
        Self::MissingMemory {
            type_name: crate::short_type_name::<T>(),
        }
    }

    pub(crate) fn missing_service<T: ?Sized>() -> Self {
        Self::MissingService {
            type_name: crate::short_type_name::<T>(),
        }
    }
}
