//! Background task server
//!
//! A durable leased queue over `background_job` rows. Workers claim the
//! oldest visible row (SKIP LOCKED; a crashed worker's lease ages out after
//! the visibility timeout), execute the workflow behind it, and delete the
//! row whether the run succeeded or failed. Outcome state and retries live
//! on metadata and the manifest, never on the job row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use trellis_core::bus::WorkflowBus;
use trellis_core::error::CoreError;
use trellis_core::model::{BackgroundJob, MetadataHandle};
use trellis_core::workflow::RunContext;
use trellis_storage::{DataContext, NewBackgroundJob};

use crate::config::TaskServerConfig;
use crate::error::EngineError;
use crate::executor::{ExecuteManifestRequest, ManifestExecutor};

/// Durable queue of dispatched jobs
#[async_trait]
pub trait TaskServer: Send + Sync + 'static {
    /// Durably enqueue a job for the metadata; returns the job id.
    async fn enqueue(
        &self,
        metadata_id: i64,
        input: Option<Value>,
        input_type: Option<String>,
    ) -> Result<i64, EngineError>;

    /// Observe a job row the dispatcher already persisted.
    async fn notify(&self, job: &BackgroundJob) -> Result<(), EngineError>;

    /// Start worker tasks, if the implementation has any.
    async fn start(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Stop worker tasks, draining in-flight executions.
    async fn shutdown(&self) {}
}

/// Shared claim-execute-finalize path for both task servers
pub(crate) struct JobExecutor {
    ctx: Arc<dyn DataContext>,
    bus: Arc<WorkflowBus>,
}

impl JobExecutor {
    pub(crate) fn new(ctx: Arc<dyn DataContext>, bus: Arc<WorkflowBus>) -> Self {
        Self { ctx, bus }
    }

    /// Execute one claimed job. The row is deleted on every outcome; a
    /// failed workflow is a failed metadata row, not a failed job.
    pub(crate) async fn execute(&self, job: &BackgroundJob) {
        match self.execute_inner(job).await {
            Ok(()) => debug!(job_id = job.id, "job finished"),
            Err(e) => warn!(job_id = job.id, "job execution failed: {e}"),
        }
        if let Err(e) = self.ctx.delete_background_job(job.id).await {
            error!(job_id = job.id, "failed to delete background job: {e}");
        }
    }

    async fn execute_inner(&self, job: &BackgroundJob) -> Result<(), EngineError> {
        let metadata = self.ctx.get_metadata(job.metadata_id).await?;
        let handle = MetadataHandle::new(metadata.clone());
        let ctx = RunContext::default().adopting(handle);

        if metadata.manifest_id.is_some() {
            // Scheduled dispatch: drive the manifest executor over the row.
            let executor = ManifestExecutor::new(self.ctx.clone(), self.bus.clone());
            let request = ExecuteManifestRequest {
                metadata_id: metadata.id,
                input: job.input.clone(),
            };
            // A fault is already recorded on the adopted metadata.
            let _ = self.bus.harness().run_either(&executor, request, ctx).await?;
            Ok(())
        } else {
            // Direct dispatch: route by the job's input type.
            let input_type = job
                .input_type
                .clone()
                .ok_or(EngineError::UnroutableJob(job.id))?;
            let input = job.input.clone().unwrap_or(Value::Null);
            match self.bus.run_value(&input_type, input, ctx).await {
                Ok(_) => Ok(()),
                // The fault was captured on metadata; the job itself is done.
                Err(CoreError::Fault(_)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// SQL-backed task server: a pool of leasing worker tasks
///
/// # Example
///
/// ```ignore
/// let server = Arc::new(SqlTaskServer::new(ctx, bus, TaskServerConfig::default()));
/// server.start().await?;
/// // ... later
/// server.shutdown().await;
/// ```
pub struct SqlTaskServer {
    ctx: Arc<dyn DataContext>,
    executor: Arc<JobExecutor>,
    config: TaskServerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SqlTaskServer {
    pub fn new(ctx: Arc<dyn DataContext>, bus: Arc<WorkflowBus>, config: TaskServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            executor: Arc::new(JobExecutor::new(ctx.clone(), bus)),
            ctx,
            config,
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let executor = self.executor.clone();
        let poll_interval = self.config.poll_interval;
        let visibility_timeout = self.config.visibility_timeout;
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            debug!(worker = index, "task-server worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match ctx.claim_background_job(visibility_timeout).await {
                    Ok(Some(job)) => {
                        executor.execute(&job).await;
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    Err(e) => {
                        error!(worker = index, "claim failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
            debug!(worker = index, "task-server worker exited");
        })
    }
}

#[async_trait]
impl TaskServer for SqlTaskServer {
    async fn enqueue(
        &self,
        metadata_id: i64,
        input: Option<Value>,
        input_type: Option<String>,
    ) -> Result<i64, EngineError> {
        let job = self
            .ctx
            .insert_background_job(NewBackgroundJob {
                metadata_id,
                input,
                input_type,
            })
            .await?;
        Ok(job.id)
    }

    // Workers poll the table; a persisted row needs no further signal.
    async fn notify(&self, _job: &BackgroundJob) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(EngineError::AlreadyRunning);
        }
        info!(
            workers = self.config.worker_count,
            "starting sql task server"
        );
        for index in 0..self.config.worker_count {
            handles.push(self.spawn_worker(index));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("task-server worker join failed: {e}");
            }
        }
        info!("sql task server stopped");
    }
}

/// In-process task server: executes jobs inline in the calling context
pub struct InProcessTaskServer {
    ctx: Arc<dyn DataContext>,
    executor: JobExecutor,
}

impl InProcessTaskServer {
    pub fn new(ctx: Arc<dyn DataContext>, bus: Arc<WorkflowBus>) -> Self {
        Self {
            executor: JobExecutor::new(ctx.clone(), bus),
            ctx,
        }
    }
}

#[async_trait]
impl TaskServer for InProcessTaskServer {
    async fn enqueue(
        &self,
        metadata_id: i64,
        input: Option<Value>,
        input_type: Option<String>,
    ) -> Result<i64, EngineError> {
        let job = self
            .ctx
            .insert_background_job(NewBackgroundJob {
                metadata_id,
                input,
                input_type,
            })
            .await?;
        self.executor.execute(&job).await;
        Ok(job.id)
    }

    async fn notify(&self, job: &BackgroundJob) -> Result<(), EngineError> {
        self.executor.execute(job).await;
        Ok(())
    }
}
