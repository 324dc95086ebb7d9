//! Step logging effect
//!
//! Logs serialized step input/output at the configured level and tracks a
//! structured log line for each boundary so the store provider persists it
//! with the owning metadata.

use async_trait::async_trait;
use tracing::Level;

use super::{StepEffectProvider, StepEffectProviderFactory, StepExecution};
use crate::config::JsonOptions;
use crate::effect::{EffectError, EffectRunner, Tracked};
use crate::model::LogEntry;

/// Logs step boundaries with serialized payloads
pub struct StepLoggingEffect {
    options: JsonOptions,
    level: Level,
}

impl StepLoggingEffect {
    pub fn new(options: JsonOptions, level: Level) -> Self {
        Self { options, level }
    }

    pub fn factory(
        options: JsonOptions,
        level: Level,
    ) -> std::sync::Arc<dyn StepEffectProviderFactory> {
        std::sync::Arc::new(StepLoggingFactory { options, level })
    }

    fn emit(&self, message: &str) {
        if self.level == Level::ERROR {
            tracing::error!(target: "trellis::step", "{message}");
        } else if self.level == Level::WARN {
            tracing::warn!(target: "trellis::step", "{message}");
        } else if self.level == Level::INFO {
            tracing::info!(target: "trellis::step", "{message}");
        } else if self.level == Level::DEBUG {
            tracing::debug!(target: "trellis::step", "{message}");
        } else {
            tracing::trace!(target: "trellis::step", "{message}");
        }
    }
}

struct StepLoggingFactory {
    options: JsonOptions,
    level: Level,
}

impl StepEffectProviderFactory for StepLoggingFactory {
    fn create(&self) -> Result<Box<dyn StepEffectProvider>, EffectError> {
        Ok(Box::new(StepLoggingEffect::new(self.options, self.level)))
    }
}

#[async_trait]
impl StepEffectProvider for StepLoggingEffect {
    fn name(&self) -> &'static str {
        "step_logging"
    }

    async fn before_step(
        &mut self,
        step: &StepExecution,
        effects: &EffectRunner,
    ) -> Result<(), EffectError> {
        let name = step.record.read().name.clone();
        let message = match &step.input_json {
            Some(input) => format!(
                "step {} ({}) starting, input: {}",
                name,
                step.workflow_name,
                self.options.render(input)
            ),
            None => format!(
                "step {} ({}) skipped, chain already faulted",
                name, step.workflow_name
            ),
        };

        self.emit(&message);
        effects
            .track(Tracked::Log(std::sync::Arc::new(parking_lot::RwLock::new(
                LogEntry::new(self.level.to_string(), message),
            ))))
            .await;
        Ok(())
    }

    async fn after_step(
        &mut self,
        step: &StepExecution,
        effects: &EffectRunner,
    ) -> Result<(), EffectError> {
        let (name, state) = {
            let record = step.record.read();
            (record.name.clone(), record.state)
        };
        let message = match (&step.fault, &step.output_json) {
            (Some(fault), _) => format!(
                "step {} ({}) faulted: {}",
                name, step.workflow_name, fault.message
            ),
            (None, Some(output)) => format!(
                "step {} ({}) finished, output: {}",
                name,
                step.workflow_name,
                self.options.render(output)
            ),
            (None, None) => format!(
                "step {} ({}) finished in state {}",
                name, step.workflow_name, state
            ),
        };

        self.emit(&message);
        effects
            .track(Tracked::Log(std::sync::Arc::new(parking_lot::RwLock::new(
                LogEntry::new(self.level.to_string(), message),
            ))))
            .await;
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

    struct Collector {
        logs: Arc<RwLock<Vec<String>>>,
    }

    #[async_trait]
    impl crate::effect::EffectProvider for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        fn track(&mut self, model: Tracked) {
            if let Tracked::Log(entry) = model {
                self.logs.write().push(entry.read().message.clone());
            }
        }

        async fn save_changes(&mut self) -> Result<(), EffectError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn both_boundaries_produce_log_lines() {
        let logs: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        let collected = logs.clone();
        let factory: Arc<dyn crate::effect::EffectProviderFactory> =
            Arc::new(crate::effect::FnEffectFactory(move || {
                Ok(Box::new(Collector {
                    logs: collected.clone(),
                }) as Box<dyn crate::effect::EffectProvider>)
            }));
        let runner = EffectRunner::from_factories(&[factory]).unwrap();

        let mut effect = StepLoggingEffect::new(JsonOptions::default(), Level::INFO);
        let exec = StepExecution {
            record: Arc::new(RwLock::new(StepMetadata::new(
                "ff00", "DoubleIt", "Seed", "Doubled",
            ))),
            input_json: Some(json!(7)),
            output_json: Some(json!(14)),
            fault: None,
            workflow_name: "W".into(),
            workflow_external_id: "ff00".into(),
        };

        effect.before_step(&exec, &runner).await.unwrap();
        effect.after_step(&exec, &runner).await.unwrap();

        let lines = logs.read();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("starting"));
        assert!(lines[0].contains('7'));
        assert!(lines[1].contains("finished"));
        assert!(lines[1].contains("14"));
    }
}
