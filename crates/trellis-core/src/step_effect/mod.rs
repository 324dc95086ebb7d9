//! Step effects: before/after hooks around every chained step
//!
//! Symmetric to the workflow-scope effect system but hooked at step
//! boundaries. Hooks fire for every chained step, including steps that were
//! skipped because the chain had already faulted; their records carry the
//! skipped tag and `has_ran = false`.

mod logging;
mod metadata;

pub use logging::StepLoggingEffect;
pub use metadata::StepMetadataEffect;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::effect::{EffectError, EffectRunner, StepHandle};
use crate::track::FaultData;

/// View of one step execution handed to the hooks
pub struct StepExecution {
    /// The step record; created before execution, finalized after
    pub record: StepHandle,

    /// Serialized step input, when the step actually ran
    pub input_json: Option<Value>,

    /// Serialized step output, when the step succeeded
    pub output_json: Option<Value>,

    /// The fault captured by this step, if it failed
    pub fault: Option<FaultData>,

    pub workflow_name: String,
    pub workflow_external_id: String,
}

/// Observer hooked around step execution
#[async_trait]
pub trait StepEffectProvider: Send + Sync {
    /// Display name used in diagnostics.
    fn name(&self) -> &'static str;

    async fn before_step(
        &mut self,
        step: &StepExecution,
        effects: &EffectRunner,
    ) -> Result<(), EffectError>;

    async fn after_step(
        &mut self,
        step: &StepExecution,
        effects: &EffectRunner,
    ) -> Result<(), EffectError>;
}

/// Creates one step-effect provider per workflow run
pub trait StepEffectProviderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn StepEffectProvider>, EffectError>;
}

/// Fan-out over the step-effect providers active for one run
///
/// Hook failures are observation failures: they are logged and never break
/// the step pipeline.
pub struct StepEffectRunner {
    providers: Mutex<Vec<Box<dyn StepEffectProvider>>>,
}

impl StepEffectRunner {
    pub fn from_factories(
        factories: &[Arc<dyn StepEffectProviderFactory>],
    ) -> Result<Self, EffectError> {
        let providers = factories
            .iter()
            .map(|factory| factory.create())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            providers: Mutex::new(providers),
        })
    }

    pub fn empty() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
        }
    }

    pub async fn before_step(&self, step: &StepExecution, effects: &EffectRunner) {
        let mut providers = self.providers.lock().await;
        for provider in providers.iter_mut() {
            if let Err(e) = provider.before_step(step, effects).await {
                warn!(provider = provider.name(), error = %e, "before-step hook failed");
            }
        }
    }

    pub async fn after_step(&self, step: &StepExecution, effects: &EffectRunner) {
        let mut providers = self.providers.lock().await;
        for provider in providers.iter_mut() {
            if let Err(e) = provider.after_step(step, effects).await {
                warn!(provider = provider.name(), error = %e, "after-step hook failed");
            }
        }
    }

    pub async fn provider_count(&self) -> usize {
        self.providers.lock().await.len()
    }
}
