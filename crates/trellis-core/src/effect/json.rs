//! JSON snapshot effect: diff-on-save observer
//!
//! Serializes every tracked model on flush and logs a snapshot only for
//! models whose serialized form changed since the previous flush.

use async_trait::async_trait;
use tracing::debug;

use super::{EffectError, EffectProvider, EffectProviderFactory, Tracked};
use crate::config::JsonOptions;

/// Diff-on-save snapshot provider
pub struct JsonSnapshotEffect {
    options: JsonOptions,
    models: Vec<Tracked>,
    snapshots: Vec<Option<String>>,
}

impl JsonSnapshotEffect {
    pub fn new(options: JsonOptions) -> Self {
        Self {
            options,
            models: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Factory handing one snapshot provider to each workflow run.
    pub fn factory(options: JsonOptions) -> std::sync::Arc<dyn EffectProviderFactory> {
        std::sync::Arc::new(JsonSnapshotFactory { options })
    }
}

struct JsonSnapshotFactory {
    options: JsonOptions,
}

impl EffectProviderFactory for JsonSnapshotFactory {
    fn create(&self) -> Result<Box<dyn EffectProvider>, EffectError> {
        Ok(Box::new(JsonSnapshotEffect::new(self.options)))
    }
}

#[async_trait]
impl EffectProvider for JsonSnapshotEffect {
    fn name(&self) -> &'static str {
        "json_snapshot"
    }

    fn track(&mut self, model: Tracked) {
        self.models.push(model);
        self.snapshots.push(None);
    }

    async fn save_changes(&mut self) -> Result<(), EffectError> {
        for (model, last) in self.models.iter().zip(self.snapshots.iter_mut()) {
            let rendered = self.options.render(&model.to_json(&self.options));
            if last.as_deref() != Some(rendered.as_str()) {
                debug!(
                    target: "trellis::effect::json",
                    kind = model.kind(),
                    snapshot = %rendered,
                    "model changed"
                );
                *last = Some(rendered);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, MetadataHandle};

    #[tokio::test]
    async fn snapshots_settle_after_first_flush() {
        let mut effect = JsonSnapshotEffect::new(JsonOptions::default());
        let handle = MetadataHandle::new(Metadata::new("W"));
        effect.track(Tracked::Metadata(handle.clone()));

        effect.save_changes().await.unwrap();
        let first = effect.snapshots[0].clone().unwrap();

        // Unchanged model keeps the same snapshot.
        effect.save_changes().await.unwrap();
        assert_eq!(effect.snapshots[0].as_deref(), Some(first.as_str()));

        // A state change produces a new one.
        handle.write().begin();
        effect.save_changes().await.unwrap();
        assert_ne!(effect.snapshots[0].as_deref(), Some(first.as_str()));
    }
}
