//! Manifest executor workflow
//!
//! The job a task-server worker runs for a scheduled dispatch is itself a
//! workflow: load the metadata and its manifest, resolve the target workflow
//! through the bus and run it as a child, stamp the manifest's last success,
//! and persist. A failure in any step rolls the dispatch's metadata up to
//! failed, which is what drives the manifest's retry count and eventual
//! dead-lettering.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::bus::WorkflowBus;
use trellis_core::error::CoreError;
use trellis_core::memory_value;
use trellis_core::model::{Manifest, MetadataHandle};
use trellis_core::step::Step;
use trellis_core::workflow::{RunContext, Workflow, WorkflowRun};
use trellis_storage::DataContext;

/// Input handed to the executor for one dispatched job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteManifestRequest {
    pub metadata_id: i64,
    /// Input override; the manifest's properties run otherwise
    pub input: Option<Value>,
}

/// Manifest plus the properties the scheduled run will receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub properties: Value,
}

/// Output of the scheduled child run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOutcome {
    pub output: Value,
}

memory_value!(ExecuteManifestRequest, LoadedManifest, ScheduledOutcome);

struct LoadManifest {
    ctx: Arc<dyn DataContext>,
}

#[async_trait]
impl Step for LoadManifest {
    type Input = ExecuteManifestRequest;
    type Output = LoadedManifest;

    fn name(&self) -> &'static str {
        "LoadManifest"
    }

    async fn run(&self, request: ExecuteManifestRequest) -> anyhow::Result<LoadedManifest> {
        let metadata = self
            .ctx
            .get_metadata(request.metadata_id)
            .await
            .context("loading dispatch metadata")?;
        let manifest_id = metadata
            .manifest_id
            .ok_or_else(|| anyhow!("metadata {} has no manifest", metadata.id))?;
        let manifest = self
            .ctx
            .get_manifest(manifest_id)
            .await
            .context("loading manifest")?;

        let properties = request
            .input
            .unwrap_or_else(|| manifest.properties.clone());
        Ok(LoadedManifest {
            manifest,
            properties,
        })
    }
}

struct ExecuteScheduled {
    bus: Arc<WorkflowBus>,
}

#[async_trait]
impl Step for ExecuteScheduled {
    // The run's own metadata handle comes out of memory so the scheduled
    // child is created with this dispatch as its parent.
    type Input = (LoadedManifest, MetadataHandle);
    type Output = ScheduledOutcome;

    fn name(&self) -> &'static str {
        "ExecuteScheduled"
    }

    async fn run(
        &self,
        (loaded, parent): (LoadedManifest, MetadataHandle),
    ) -> anyhow::Result<ScheduledOutcome> {
        let ctx = RunContext::default().with_parent(parent.id());
        let output = self
            .bus
            .run_value(&loaded.manifest.property_type, loaded.properties, ctx)
            .await?;
        Ok(ScheduledOutcome { output })
    }
}

struct UpdateManifest {
    ctx: Arc<dyn DataContext>,
}

#[async_trait]
impl Step for UpdateManifest {
    type Input = LoadedManifest;
    type Output = ();

    fn name(&self) -> &'static str {
        "UpdateManifest"
    }

    async fn run(&self, loaded: LoadedManifest) -> anyhow::Result<()> {
        self.ctx
            .set_last_successful_run(loaded.manifest.id, Utc::now())
            .await
            .context("stamping last successful run")?;
        Ok(())
    }
}

struct SaveDatabaseChanges {
    ctx: Arc<dyn DataContext>,
}

#[async_trait]
impl Step for SaveDatabaseChanges {
    type Input = MetadataHandle;
    type Output = ();

    fn name(&self) -> &'static str {
        "SaveDatabaseChanges"
    }

    // Explicit commit point: the dispatch row's current state is persisted
    // before the harness finalizes it.
    async fn run(&self, metadata: MetadataHandle) -> anyhow::Result<()> {
        let snapshot = metadata.snapshot();
        let id = self.ctx.save_metadata(snapshot).await?;
        metadata.write().id = id;
        Ok(())
    }
}

/// The workflow a task-server worker drives for each scheduled dispatch
pub struct ManifestExecutor {
    ctx: Arc<dyn DataContext>,
    bus: Arc<WorkflowBus>,
}

impl ManifestExecutor {
    pub fn new(ctx: Arc<dyn DataContext>, bus: Arc<WorkflowBus>) -> Self {
        Self { ctx, bus }
    }
}

#[async_trait]
impl Workflow for ManifestExecutor {
    type Input = ExecuteManifestRequest;
    type Output = ScheduledOutcome;

    fn name(&self) -> &'static str {
        "ManifestExecutor"
    }

    async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
        run.chain_with(LoadManifest {
            ctx: self.ctx.clone(),
        })
        .await?;
        run.chain_with(ExecuteScheduled {
            bus: self.bus.clone(),
        })
        .await?;
        run.chain_with(UpdateManifest {
            ctx: self.ctx.clone(),
        })
        .await?;
        run.chain_with(SaveDatabaseChanges {
            ctx: self.ctx.clone(),
        })
        .await?;
        Ok(())
    }
}
