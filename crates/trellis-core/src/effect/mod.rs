//! Effect system: pluggable tracking fan-out
//!
//! An effect provider observes models tracked during a workflow run and
//! persists or forwards them on demand. Providers are created per run from
//! registered factories, flushed together on `save_changes`, and disposed on
//! every exit path.

mod json;
mod parameter;
mod runner;

pub use json::JsonSnapshotEffect;
pub use parameter::ParameterEffect;
pub use runner::EffectRunner;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::JsonOptions;
use crate::model::{LogEntry, MetadataHandle, StepMetadata};

/// Error type for effect operations
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    /// A provider failed to flush or initialize
    #[error("effect provider error: {0}")]
    Provider(String),

    /// One or more providers failed during runner disposal
    #[error("effect runner disposed with {} failure(s): {}", .0.len(), .0.join("; "))]
    PartialDispose(Vec<String>),
}

/// Shared handle to a tracked step record
pub type StepHandle = Arc<RwLock<StepMetadata>>;

/// Shared handle to a tracked log line
pub type LogHandle = Arc<RwLock<LogEntry>>;

/// A model tracked into the effect fan-out
///
/// Handles are shared: the harness keeps mutating the underlying record and
/// every provider observes the same state at flush time.
#[derive(Clone)]
pub enum Tracked {
    Metadata(MetadataHandle),
    Step(StepHandle),
    Log(LogHandle),
}

impl Tracked {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Step(_) => "step_metadata",
            Self::Log(_) => "log",
        }
    }

    /// Serialize the current state of the tracked model.
    pub fn to_json(&self, options: &JsonOptions) -> serde_json::Value {
        let result = match self {
            Self::Metadata(handle) => options.to_value(&handle.snapshot()),
            Self::Step(handle) => options.to_value(&*handle.read()),
            Self::Log(handle) => options.to_value(&*handle.read()),
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

/// Observer of models tracked during a single workflow run
#[async_trait]
pub trait EffectProvider: Send + Sync {
    /// Display name used in disposal diagnostics.
    fn name(&self) -> &'static str;

    /// Register a model with this provider.
    fn track(&mut self, model: Tracked);

    /// Sequential pre-flush phase; runs before any provider's `save_changes`.
    fn prepare(&mut self) -> Result<(), EffectError> {
        Ok(())
    }

    /// Flush everything tracked so far.
    async fn save_changes(&mut self) -> Result<(), EffectError>;

    /// Release resources; called exactly once at the end of the run.
    async fn dispose(&mut self) -> Result<(), EffectError> {
        Ok(())
    }
}

/// Creates one provider per workflow run
pub trait EffectProviderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn EffectProvider>, EffectError>;
}

/// Factory from a plain closure, for tests and simple providers.
pub struct FnEffectFactory<F>(pub F);

impl<F> EffectProviderFactory for FnEffectFactory<F>
where
    F: Fn() -> Result<Box<dyn EffectProvider>, EffectError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn EffectProvider>, EffectError> {
        (self.0)()
    }
}
