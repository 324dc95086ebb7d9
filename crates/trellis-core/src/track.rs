//! Two-track carrier for step results
//!
//! A step's outcome is a value, not a panic: `Ok` carries the output, `Fault`
//! carries structured failure data, and `Skipped` tags steps that never ran
//! because an earlier step faulted. Cancellation is deliberately outside the
//! sum; it propagates through `Result` as [`crate::CoreError::Cancelled`].

use serde::{Deserialize, Serialize};

/// Structured capture of a step failure
///
/// Persisted into `Metadata.failure_*` columns and surfaced unchanged to
/// callers of `run_either`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultData {
    /// Stable classification of the error (library error kinds keep their
    /// names, anything else is `unhandled`)
    pub error_type: String,

    /// Name of the step whose `run` raised the error
    pub step: String,

    /// Rendered error chain
    pub message: String,

    /// Workflow the step belongs to
    pub workflow_name: String,

    /// External id of the failing run
    pub workflow_external_id: String,
}

impl FaultData {
    /// Capture an arbitrary step error into fault data.
    pub fn capture(
        err: &anyhow::Error,
        step: &str,
        workflow_name: &str,
        workflow_external_id: &str,
    ) -> Self {
        let error_type = match err.downcast_ref::<crate::CoreError>() {
            Some(core) => core.kind().to_string(),
            None => "unhandled".to_string(),
        };
        Self {
            error_type,
            step: step.to_string(),
            // {:#} renders the whole context chain on one line
            message: format!("{err:#}"),
            workflow_name: workflow_name.to_string(),
            workflow_external_id: workflow_external_id.to_string(),
        }
    }
}

impl std::fmt::Display for FaultData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.error_type, self.step, self.message)
    }
}

/// Result of running one step down the chain
#[derive(Debug, Clone, PartialEq)]
pub enum Track<T> {
    /// The step produced its output
    Ok(T),

    /// The step (or an earlier one) faulted; the chain is done executing
    Fault(FaultData),

    /// The step was never invoked because the chain had already faulted
    Skipped,
}

impl<T> Track<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// The output value, if the track is on the success rail.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            _ => None,
        }
    }

    /// The fault, if one was captured.
    pub fn fault(&self) -> Option<&FaultData> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Map the success rail, preserving the state tag otherwise.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Track<U> {
        match self {
            Self::Ok(value) => Track::Ok(f(value)),
            Self::Fault(fault) => Track::Fault(fault),
            Self::Skipped => Track::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn capture_renders_the_context_chain() {
        let err = anyhow!("connection refused").context("loading manifest");
        let fault = FaultData::capture(&err, "LoadManifest", "Executor", "ff00");
        assert_eq!(fault.error_type, "unhandled");
        assert_eq!(fault.step, "LoadManifest");
        assert!(fault.message.contains("loading manifest"));
        assert!(fault.message.contains("connection refused"));
    }

    #[test]
    fn core_errors_keep_their_kind() {
        let err = anyhow::Error::from(crate::CoreError::UnmappedInput("Order".into()));
        let fault = FaultData::capture(&err, "Dispatch", "Executor", "ff00");
        assert_eq!(fault.error_type, "unmapped_input");
    }

    #[test]
    fn map_preserves_the_state_tag() {
        let fault = FaultData::capture(&anyhow!("boom"), "S", "W", "id");
        let track: Track<i32> = Track::Fault(fault.clone());
        assert_eq!(track.map(|v| v * 2), Track::Fault(fault));
        assert_eq!(Track::Ok(2).map(|v| v * 2), Track::Ok(4));
        assert_eq!(Track::<i32>::Skipped.map(|v| v * 2), Track::Skipped);
    }
}
