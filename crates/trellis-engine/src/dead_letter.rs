//! Dead-letter lifecycle operations
//!
//! A dead letter parks a manifest until an operator acts: acknowledge closes
//! it with a note, retry re-arms the manifest with a fresh metadata row and
//! a queued work item. If the retry exhausts the budget again, the next
//! manager tick opens a new letter; the original stays retried.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use trellis_core::model::{DeadLetter, DeadLetterStatus, Metadata};
use trellis_storage::{DataContext, DeadLetterResolution, NewWorkItem, StoreError};

use crate::error::EngineError;

/// Operator-facing dead-letter operations
#[derive(Clone)]
pub struct DeadLetterService {
    ctx: Arc<dyn DataContext>,
}

impl DeadLetterService {
    pub fn new(ctx: Arc<dyn DataContext>) -> Self {
        Self { ctx }
    }

    /// Close an awaiting-intervention letter with a resolution note.
    pub async fn acknowledge(
        &self,
        dead_letter_id: i64,
        note: impl Into<String>,
    ) -> Result<DeadLetter, EngineError> {
        let letter = self
            .ctx
            .resolve_dead_letter(
                dead_letter_id,
                DeadLetterResolution::Acknowledge { note: note.into() },
            )
            .await?;
        info!(dead_letter_id, manifest_id = letter.manifest_id, "dead letter acknowledged");
        Ok(letter)
    }

    /// Re-arm the manifest: fresh metadata, queued work item, letter marked
    /// retried with the new run recorded on it.
    pub async fn retry(
        &self,
        dead_letter_id: i64,
        new_input: Option<Value>,
    ) -> Result<DeadLetter, EngineError> {
        let letter = self.ctx.get_dead_letter(dead_letter_id).await?;
        if letter.status != DeadLetterStatus::AwaitingIntervention {
            return Err(EngineError::Store(StoreError::DeadLetterNotOpen(
                dead_letter_id,
            )));
        }

        let manifest = self.ctx.get_manifest(letter.manifest_id).await?;
        let group = self.ctx.get_group(manifest.manifest_group_id).await?;
        let input = new_input.unwrap_or_else(|| manifest.properties.clone());

        let mut metadata = Metadata::new(&manifest.name);
        metadata.manifest_id = Some(manifest.id);
        metadata.input = Some(input.clone());
        let retry_metadata_id = self.ctx.save_metadata(metadata).await?;

        self.ctx
            .enqueue_work(NewWorkItem {
                workflow_name: manifest.name.clone(),
                input,
                input_type_name: manifest.property_type.clone(),
                priority: group.priority,
                manifest_id: Some(manifest.id),
                metadata_id: Some(retry_metadata_id),
            })
            .await?;

        let resolved = self
            .ctx
            .resolve_dead_letter(
                dead_letter_id,
                DeadLetterResolution::Retry { retry_metadata_id },
            )
            .await?;

        info!(
            dead_letter_id,
            manifest_id = resolved.manifest_id,
            retry_metadata_id,
            "dead letter retried"
        );
        Ok(resolved)
    }
}
