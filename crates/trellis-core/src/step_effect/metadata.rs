//! Step metadata effect: persists one record per chained step
//!
//! Registers the step record with the run's effect runner before execution so
//! the store provider flushes it alongside the workflow metadata. After
//! execution it snapshots the step output into the record when output
//! serialization is enabled.

use async_trait::async_trait;

use super::{StepEffectProvider, StepEffectProviderFactory, StepExecution};
use crate::effect::{EffectError, EffectRunner, Tracked};

/// Tracks step records into the workflow's effect fan-out
pub struct StepMetadataEffect {
    serialize_step_data: bool,
}

impl StepMetadataEffect {
    pub fn new(serialize_step_data: bool) -> Self {
        Self {
            serialize_step_data,
        }
    }

    pub fn factory(serialize_step_data: bool) -> std::sync::Arc<dyn StepEffectProviderFactory> {
        std::sync::Arc::new(StepMetadataFactory {
            serialize_step_data,
        })
    }
}

struct StepMetadataFactory {
    serialize_step_data: bool,
}

impl StepEffectProviderFactory for StepMetadataFactory {
    fn create(&self) -> Result<Box<dyn StepEffectProvider>, EffectError> {
        Ok(Box::new(StepMetadataEffect::new(self.serialize_step_data)))
    }
}

#[async_trait]
impl StepEffectProvider for StepMetadataEffect {
    fn name(&self) -> &'static str {
        "step_metadata"
    }

    async fn before_step(
        &mut self,
        step: &StepExecution,
        effects: &EffectRunner,
    ) -> Result<(), EffectError> {
        effects.track(Tracked::Step(step.record.clone())).await;
        Ok(())
    }

    async fn after_step(
        &mut self,
        step: &StepExecution,
        _effects: &EffectRunner,
    ) -> Result<(), EffectError> {
        if self.serialize_step_data {
            if let Some(output) = &step.output_json {
                step.record.write().output_json = Some(output.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepMetadata;
    use parking_lot::RwLock;
    use serde_json::json;
    use std::sync::Arc;

    fn execution(output: Option<serde_json::Value>) -> StepExecution {
        StepExecution {
            record: Arc::new(RwLock::new(StepMetadata::new(
                "ff00", "DoubleIt", "Seed", "Doubled",
            ))),
            input_json: Some(json!(1)),
            output_json: output,
            fault: None,
            workflow_name: "W".into(),
            workflow_external_id: "ff00".into(),
        }
    }

    #[tokio::test]
    async fn before_tracks_the_record() {
        let mut effect = StepMetadataEffect::new(true);
        let effects = EffectRunner::empty();
        let exec = execution(None);
        effect.before_step(&exec, &effects).await.unwrap();
        // No providers attached; tracking is still a no-op fan-out.
        assert_eq!(effects.provider_count().await, 0);
    }

    #[tokio::test]
    async fn output_snapshot_respects_the_toggle() {
        let effects = EffectRunner::empty();

        let mut on = StepMetadataEffect::new(true);
        let exec = execution(Some(json!({"n": 2})));
        on.after_step(&exec, &effects).await.unwrap();
        assert_eq!(exec.record.read().output_json, Some(json!({"n": 2})));

        let mut off = StepMetadataEffect::new(false);
        let exec = execution(Some(json!({"n": 2})));
        off.after_step(&exec, &effects).await.unwrap();
        assert!(exec.record.read().output_json.is_none());
    }
}
