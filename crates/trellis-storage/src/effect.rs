//! Data-context effect provider
//!
//! Bridges the core effect system into the store: every tracked model is
//! upserted on flush, and newly inserted rows get their ids written back into
//! the shared handles so later flushes become updates.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_core::effect::{
    EffectError, EffectProvider, EffectProviderFactory, LogHandle, StepHandle, Tracked,
};
use trellis_core::model::MetadataHandle;

use crate::context::DataContext;

fn store_error(e: crate::context::StoreError) -> EffectError {
    EffectError::Provider(e.to_string())
}

/// Persists tracked models through a [`DataContext`]
pub struct DataContextEffect {
    ctx: Arc<dyn DataContext>,
    metadata: Vec<MetadataHandle>,
    steps: Vec<StepHandle>,
    logs: Vec<LogHandle>,
}

impl DataContextEffect {
    pub fn new(ctx: Arc<dyn DataContext>) -> Self {
        Self {
            ctx,
            metadata: Vec::new(),
            steps: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Factory handing one store provider to each workflow run.
    pub fn factory(ctx: Arc<dyn DataContext>) -> Arc<dyn EffectProviderFactory> {
        Arc::new(DataContextEffectFactory { ctx })
    }
}

struct DataContextEffectFactory {
    ctx: Arc<dyn DataContext>,
}

impl EffectProviderFactory for DataContextEffectFactory {
    fn create(&self) -> Result<Box<dyn EffectProvider>, EffectError> {
        Ok(Box::new(DataContextEffect::new(self.ctx.clone())))
    }
}

#[async_trait]
impl EffectProvider for DataContextEffect {
    fn name(&self) -> &'static str {
        "data_context"
    }

    fn track(&mut self, model: Tracked) {
        match model {
            Tracked::Metadata(handle) => self.metadata.push(handle),
            Tracked::Step(handle) => self.steps.push(handle),
            Tracked::Log(handle) => self.logs.push(handle),
        }
    }

    async fn save_changes(&mut self) -> Result<(), EffectError> {
        // Metadata first: logs need the owning row's id.
        for handle in &self.metadata {
            let snapshot = handle.snapshot();
            let id = self
                .ctx
                .save_metadata(snapshot)
                .await
                .map_err(store_error)?;
            handle.write().id = id;
        }

        for handle in &self.steps {
            let snapshot = handle.read().clone();
            let id = self
                .ctx
                .save_step_metadata(snapshot)
                .await
                .map_err(store_error)?;
            handle.write().id = id;
        }

        let owner_id = self.metadata.first().map(|m| m.id()).unwrap_or(0);
        for handle in &self.logs {
            // Log lines are immutable; one insert each.
            if handle.read().id != 0 {
                continue;
            }
            handle.write().metadata_id = owner_id;
            let snapshot = handle.read().clone();
            let id = self.ctx.append_log(snapshot).await.map_err(store_error)?;
            handle.write().id = id;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDataContext;
    use parking_lot::RwLock;
    use trellis_core::model::{LogEntry, Metadata, StepMetadata, WorkflowState};

    #[tokio::test]
    async fn flush_inserts_then_updates() {
        let ctx = Arc::new(InMemoryDataContext::new());
        let mut effect = DataContextEffect::new(ctx.clone());

        let handle = MetadataHandle::new(Metadata::new("OrderWorkflow"));
        effect.track(Tracked::Metadata(handle.clone()));

        effect.save_changes().await.unwrap();
        let id = handle.id();
        assert!(id > 0);

        handle.write().begin();
        effect.save_changes().await.unwrap();

        let persisted = ctx.get_metadata(id).await.unwrap();
        assert_eq!(persisted.state, WorkflowState::InProgress);
        assert_eq!(ctx.metadata_count(), 1);
    }

    #[tokio::test]
    async fn logs_are_linked_to_the_tracked_metadata() {
        let ctx = Arc::new(InMemoryDataContext::new());
        let mut effect = DataContextEffect::new(ctx.clone());

        let handle = MetadataHandle::new(Metadata::new("OrderWorkflow"));
        effect.track(Tracked::Metadata(handle.clone()));
        effect.track(Tracked::Log(Arc::new(RwLock::new(LogEntry::new(
            "INFO",
            "step starting",
        )))));

        effect.save_changes().await.unwrap();
        // A second flush does not duplicate the immutable log line.
        effect.save_changes().await.unwrap();

        let logs = ctx.list_logs(handle.id()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "step starting");
    }

    #[tokio::test]
    async fn step_records_flush_alongside_metadata() {
        let ctx = Arc::new(InMemoryDataContext::new());
        let mut effect = DataContextEffect::new(ctx.clone());

        let handle = MetadataHandle::new(Metadata::new("OrderWorkflow"));
        let external_id = handle.external_id();
        effect.track(Tracked::Metadata(handle));
        effect.track(Tracked::Step(Arc::new(RwLock::new(StepMetadata::new(
            external_id.clone(),
            "ChargeCard",
            "Order",
            "Receipt",
        )))));

        effect.save_changes().await.unwrap();

        let steps = ctx.list_step_metadata(&external_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "ChargeCard");
    }
}
