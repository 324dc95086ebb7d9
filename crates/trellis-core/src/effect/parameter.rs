//! Parameter effect: serializes workflow input/output into metadata columns
//!
//! The harness stashes the run's typed payloads on the metadata record as
//! pending values; this provider is what moves them into the persisted
//! `input`/`output` columns under the configured JSON options. Without it,
//! parameters are not persisted.

use async_trait::async_trait;

use super::{EffectError, EffectProvider, EffectProviderFactory, Tracked};
use crate::config::JsonOptions;
use crate::model::MetadataHandle;

/// Moves pending run parameters into the metadata JSON columns
pub struct ParameterEffect {
    options: JsonOptions,
    metadata: Vec<MetadataHandle>,
}

impl ParameterEffect {
    pub fn new(options: JsonOptions) -> Self {
        Self {
            options,
            metadata: Vec::new(),
        }
    }

    /// Factory handing one parameter provider to each workflow run.
    pub fn factory(options: JsonOptions) -> std::sync::Arc<dyn EffectProviderFactory> {
        std::sync::Arc::new(ParameterFactory { options })
    }
}

struct ParameterFactory {
    options: JsonOptions,
}

impl EffectProviderFactory for ParameterFactory {
    fn create(&self) -> Result<Box<dyn EffectProvider>, EffectError> {
        Ok(Box::new(ParameterEffect::new(self.options)))
    }
}

#[async_trait]
impl EffectProvider for ParameterEffect {
    fn name(&self) -> &'static str {
        "parameter"
    }

    fn track(&mut self, model: Tracked) {
        if let Tracked::Metadata(handle) = model {
            self.metadata.push(handle);
        }
    }

    // Runs in the sequential phase so the columns are populated before any
    // store provider flushes the row. Columns already written (adopted
    // dispatcher-created rows carry their input) are left alone.
    fn prepare(&mut self) -> Result<(), EffectError> {
        for handle in &self.metadata {
            let mut metadata = handle.write();
            match metadata.pending_input.take() {
                Some(pending) if metadata.input.is_none() => {
                    let value = self
                        .options
                        .to_value(&pending)
                        .map_err(|e| EffectError::Provider(e.to_string()))?;
                    metadata.input = Some(value);
                }
                _ => {}
            }
            match metadata.pending_output.take() {
                Some(pending) if metadata.output.is_none() => {
                    let value = self
                        .options
                        .to_value(&pending)
                        .map_err(|e| EffectError::Provider(e.to_string()))?;
                    metadata.output = Some(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn save_changes(&mut self) -> Result<(), EffectError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, MetadataHandle};
    use serde_json::json;

    #[tokio::test]
    async fn pending_parameters_land_in_the_columns() {
        let mut effect = ParameterEffect::new(JsonOptions::default());
        let handle = MetadataHandle::new(Metadata::new("W"));
        handle.write().pending_input = Some(json!({"n": 1}));
        effect.track(Tracked::Metadata(handle.clone()));

        effect.prepare().unwrap();
        effect.save_changes().await.unwrap();

        let metadata = handle.snapshot();
        assert_eq!(metadata.input, Some(json!({"n": 1})));
        assert!(metadata.pending_input.is_none());
        assert!(metadata.output.is_none());
    }

    #[tokio::test]
    async fn output_is_moved_once_pending() {
        let mut effect = ParameterEffect::new(JsonOptions::default());
        let handle = MetadataHandle::new(Metadata::new("W"));
        effect.track(Tracked::Metadata(handle.clone()));

        effect.prepare().unwrap();
        assert!(handle.snapshot().output.is_none());

        handle.write().pending_output = Some(json!([1, 2]));
        effect.prepare().unwrap();
        assert_eq!(handle.snapshot().output, Some(json!([1, 2])));
    }
}
