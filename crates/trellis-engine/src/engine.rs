//! Engine runtime assembly
//!
//! Wires the store, the workflow bus (with the built-in effect stack), the
//! scheduler and the long-running loops into one lifecycle: `start` spawns
//! the manager, dispatcher, cleanup and task-server tasks; `shutdown`
//! signals them and joins.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use trellis_core::bus::{BusBuilder, WorkflowBus};
use trellis_core::effect::{JsonSnapshotEffect, ParameterEffect};
use trellis_core::step_effect::{StepLoggingEffect, StepMetadataEffect};
use trellis_core::workflow::Workflow;
use trellis_storage::{DataContext, DataContextEffect};

use crate::cleanup::MetadataCleanup;
use crate::config::{EngineConfig, TaskServerKind};
use crate::dead_letter::DeadLetterService;
use crate::dispatcher::JobDispatcher;
use crate::error::EngineError;
use crate::manager::ManifestManager;
use crate::schedule::Scheduler;
use crate::task_server::{InProcessTaskServer, SqlTaskServer, TaskServer};

/// A fully wired engine instance
pub struct Engine {
    config: EngineConfig,
    ctx: Arc<dyn DataContext>,
    bus: Arc<WorkflowBus>,
    scheduler: Scheduler,
    dead_letters: DeadLetterService,
    manager: Arc<ManifestManager>,
    dispatcher: Arc<JobDispatcher>,
    cleanup: Arc<MetadataCleanup>,
    task_server: Arc<dyn TaskServer>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(ctx: Arc<dyn DataContext>) -> EngineBuilder {
        EngineBuilder::new(ctx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DataContext> {
        &self.ctx
    }

    pub fn bus(&self) -> &Arc<WorkflowBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dead_letters(&self) -> &DeadLetterService {
        &self.dead_letters
    }

    pub fn manager(&self) -> &Arc<ManifestManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn cleanup(&self) -> &Arc<MetadataCleanup> {
        &self.cleanup
    }

    pub fn task_server(&self) -> &Arc<dyn TaskServer> {
        &self.task_server
    }

    /// Spawn every long-running component.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let handles = self.handles.lock();
            if !handles.is_empty() {
                return Err(EngineError::AlreadyRunning);
            }
        }

        info!("starting trellis engine");
        self.task_server.start().await?;

        let mut handles = self.handles.lock();
        handles.push(self.manager.spawn(self.shutdown_rx.clone()));
        handles.push(self.dispatcher.spawn(self.shutdown_rx.clone()));
        handles.push(self.cleanup.spawn(self.shutdown_rx.clone()));
        Ok(())
    }

    /// Signal every loop and join; in-flight work drains.
    pub async fn shutdown(&self) {
        info!("stopping trellis engine");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("engine loop join failed: {e}");
            }
        }
        self.task_server.shutdown().await;
        info!("trellis engine stopped");
    }
}

/// Builds an engine: workflow registrations plus configuration
pub struct EngineBuilder {
    ctx: Arc<dyn DataContext>,
    config: EngineConfig,
    bus_builder: BusBuilder,
}

impl EngineBuilder {
    pub fn new(ctx: Arc<dyn DataContext>) -> Self {
        Self {
            ctx,
            config: EngineConfig::default(),
            bus_builder: BusBuilder::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a workflow under its input type.
    pub fn register<W, F>(mut self, factory: F) -> Result<Self, EngineError>
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.bus_builder = self.bus_builder.register(factory)?;
        Ok(self)
    }

    /// Attach a capability resolvable from every workflow run.
    pub fn with_service<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.bus_builder = self.bus_builder.with_service(service);
        self
    }

    /// Attach an additional effect provider factory.
    pub fn with_effect(
        mut self,
        factory: Arc<dyn trellis_core::effect::EffectProviderFactory>,
    ) -> Self {
        self.bus_builder = self.bus_builder.with_effect(factory);
        self
    }

    /// Attach an additional step-effect provider factory.
    pub fn with_step_effect(
        mut self,
        factory: Arc<dyn trellis_core::step_effect::StepEffectProviderFactory>,
    ) -> Self {
        self.bus_builder = self.bus_builder.with_step_effect(factory);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let ctx = self.ctx;

        let bus = Arc::new(
            self.bus_builder
                .with_json(config.json)
                .with_effect(DataContextEffect::factory(ctx.clone()))
                .with_effect(JsonSnapshotEffect::factory(config.json))
                .with_effect(ParameterEffect::factory(config.json))
                .with_step_effect(StepMetadataEffect::factory(config.serialize_step_data))
                .with_step_effect(StepLoggingEffect::factory(
                    config.json,
                    config.step_log_level,
                ))
                .build(),
        );

        let task_server: Arc<dyn TaskServer> = match config.task_server.kind {
            TaskServerKind::InProcess => {
                Arc::new(InProcessTaskServer::new(ctx.clone(), bus.clone()))
            }
            TaskServerKind::DurableSql => Arc::new(SqlTaskServer::new(
                ctx.clone(),
                bus.clone(),
                config.task_server.clone(),
            )),
        };

        let manager = Arc::new(ManifestManager::new(
            ctx.clone(),
            config.manager_poll_interval,
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            ctx.clone(),
            task_server.clone(),
            config.dispatcher_poll_interval,
            config.max_active_jobs,
        ));
        let cleanup = Arc::new(MetadataCleanup::new(ctx.clone(), config.cleanup.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Engine {
            scheduler: Scheduler::new(ctx.clone(), bus.clone()),
            dead_letters: DeadLetterService::new(ctx.clone()),
            manager,
            dispatcher,
            cleanup,
            task_server,
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
            config,
            ctx,
            bus,
        }
    }
}
