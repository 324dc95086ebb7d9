//! Workflow bus and registry
//!
//! The registry maps each workflow's sole input type to the workflow,
//! enforced unique at registration. The bus routes on the input's runtime
//! type (typed path) or its type name (untyped path used by the dispatcher
//! and task server), resolves the workflow from its factory and drives it
//! through the shared harness.
//!
//! Registration is explicit; there is no assembly scanning. The invariant
//! "each input type maps to exactly one workflow" fails fast at build time.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::effect::EffectProviderFactory;
use crate::error::CoreError;
use crate::model::MetadataHandle;
use crate::step_effect::StepEffectProviderFactory;
use crate::workflow::{HarnessOptions, RunContext, Workflow, WorkflowHarness};

/// Identity of a registered workflow
#[derive(Debug, Clone)]
pub struct WorkflowDescriptor {
    /// Short name, recorded on metadata rows
    pub workflow_name: String,

    /// Fully qualified type path
    pub full_name: String,

    /// Short name of the input type the bus routes on
    pub input_type_name: String,
}

#[async_trait]
trait ErasedWorkflow: Send + Sync {
    async fn run_json(
        &self,
        harness: &WorkflowHarness,
        input: Value,
        ctx: RunContext,
    ) -> Result<Value, CoreError>;

    async fn initialize_json(
        &self,
        harness: &WorkflowHarness,
        input: Value,
        ctx: RunContext,
    ) -> Result<MetadataHandle, CoreError>;
}

struct ErasedEntry<W, F> {
    factory: F,
    _marker: PhantomData<fn() -> W>,
}

#[async_trait]
impl<W, F> ErasedWorkflow for ErasedEntry<W, F>
where
    W: Workflow,
    F: Fn() -> W + Send + Sync,
{
    async fn run_json(
        &self,
        harness: &WorkflowHarness,
        input: Value,
        ctx: RunContext,
    ) -> Result<Value, CoreError> {
        let input: W::Input = serde_json::from_value(input)?;
        let workflow = (self.factory)();
        let output = harness.run(&workflow, input, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }

    async fn initialize_json(
        &self,
        harness: &WorkflowHarness,
        input: Value,
        ctx: RunContext,
    ) -> Result<MetadataHandle, CoreError> {
        let input: W::Input = serde_json::from_value(input)?;
        let workflow = (self.factory)();
        harness.initialize(&workflow, input, ctx).await
    }
}

struct Registration {
    descriptor: WorkflowDescriptor,
    runner: Box<dyn ErasedWorkflow>,
}

/// Input-type to workflow mapping
#[derive(Default)]
pub struct WorkflowRegistry {
    by_input: HashMap<TypeId, Arc<Registration>>,
    by_input_name: HashMap<String, Arc<Registration>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its input type.
    ///
    /// Fails when another workflow already claimed the input type: a mapping
    /// has one workflow.
    pub fn register<W, F>(&mut self, factory: F) -> Result<(), CoreError>
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let probe = factory();
        let descriptor = WorkflowDescriptor {
            workflow_name: probe.name().to_string(),
            full_name: std::any::type_name::<W>().to_string(),
            input_type_name: crate::short_type_name::<W::Input>().to_string(),
        };

        let input_id = TypeId::of::<W::Input>();
        let clash = self
            .by_input
            .get(&input_id)
            .or_else(|| self.by_input_name.get(&descriptor.input_type_name));
        if let Some(existing) = clash {
            return Err(CoreError::DuplicateInput {
                input_type: descriptor.input_type_name,
                workflow: existing.descriptor.workflow_name.clone(),
            });
        }

        info!(
            workflow = %descriptor.workflow_name,
            input_type = %descriptor.input_type_name,
            "registered workflow"
        );

        let registration = Arc::new(Registration {
            descriptor: descriptor.clone(),
            runner: Box::new(ErasedEntry {
                factory,
                _marker: PhantomData,
            }),
        });
        self.by_input.insert(input_id, registration.clone());
        self.by_input_name
            .insert(descriptor.input_type_name, registration);
        Ok(())
    }

    pub fn contains_input<I: 'static>(&self) -> bool {
        self.by_input.contains_key(&TypeId::of::<I>())
    }

    pub fn descriptor_for_input<I: 'static>(&self) -> Option<&WorkflowDescriptor> {
        self.by_input
            .get(&TypeId::of::<I>())
            .map(|r| &r.descriptor)
    }

    pub fn descriptor_for_input_name(&self, input_type_name: &str) -> Option<&WorkflowDescriptor> {
        self.by_input_name
            .get(input_type_name)
            .map(|r| &r.descriptor)
    }

    pub fn len(&self) -> usize {
        self.by_input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_input.is_empty()
    }

    fn lookup<I: 'static>(&self) -> Result<&Registration, CoreError> {
        self.by_input
            .get(&TypeId::of::<I>())
            .map(|r| r.as_ref())
            .ok_or_else(|| CoreError::UnmappedInput(crate::short_type_name::<I>().to_string()))
    }

    fn lookup_name(&self, input_type_name: &str) -> Result<&Registration, CoreError> {
        self.by_input_name
            .get(input_type_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| CoreError::UnmappedInput(input_type_name.to_string()))
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field(
                "inputs",
                &self.by_input_name.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Routes inputs to workflows and drives them through the shared harness
pub struct WorkflowBus {
    registry: WorkflowRegistry,
    harness: WorkflowHarness,
}

impl WorkflowBus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn harness(&self) -> &WorkflowHarness {
        &self.harness
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Typed dispatch by the input's runtime type.
    pub async fn run_as<I, O>(&self, input: I) -> Result<O, CoreError>
    where
        I: Serialize + 'static,
        O: DeserializeOwned,
    {
        self.run_with(input, RunContext::default()).await
    }

    /// Typed dispatch creating the new run as a child of `parent`.
    pub async fn run_child<I, O>(&self, input: I, parent: &MetadataHandle) -> Result<O, CoreError>
    where
        I: Serialize + 'static,
        O: DeserializeOwned,
    {
        self.run_with(input, RunContext::default().with_parent(parent.id()))
            .await
    }

    /// Typed dispatch with an explicit run context.
    pub async fn run_with<I, O>(&self, input: I, ctx: RunContext) -> Result<O, CoreError>
    where
        I: Serialize + 'static,
        O: DeserializeOwned,
    {
        let registration = self.registry.lookup::<I>()?;
        let output = registration
            .runner
            .run_json(&self.harness, serde_json::to_value(input)?, ctx)
            .await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Untyped dispatch by input type name; the dispatcher/task-server path.
    pub async fn run_value(
        &self,
        input_type_name: &str,
        input: Value,
        ctx: RunContext,
    ) -> Result<Value, CoreError> {
        let registration = self.registry.lookup_name(input_type_name)?;
        registration.runner.run_json(&self.harness, input, ctx).await
    }

    /// Resolve and initialize (metadata created `Pending`) without executing.
    pub async fn initialize<I: Serialize + 'static>(
        &self,
        input: I,
    ) -> Result<MetadataHandle, CoreError> {
        let registration = self.registry.lookup::<I>()?;
        registration
            .runner
            .initialize_json(
                &self.harness,
                serde_json::to_value(input)?,
                RunContext::default(),
            )
            .await
    }

    pub fn descriptor_for_input<I: 'static>(&self) -> Option<&WorkflowDescriptor> {
        self.registry.descriptor_for_input::<I>()
    }

    pub fn descriptor_for_input_name(&self, input_type_name: &str) -> Option<&WorkflowDescriptor> {
        self.registry.descriptor_for_input_name(input_type_name)
    }
}

/// Builds a bus: workflow registrations plus the harness configuration
pub struct BusBuilder {
    registry: WorkflowRegistry,
    options: HarnessOptions,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBuilder {
    pub fn new() -> Self {
        Self {
            registry: WorkflowRegistry::new(),
            options: HarnessOptions::default(),
        }
    }

    pub fn register<W, F>(mut self, factory: F) -> Result<Self, CoreError>
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.registry.register::<W, F>(factory)?;
        Ok(self)
    }

    pub fn with_effect(mut self, factory: Arc<dyn EffectProviderFactory>) -> Self {
        self.options.effect_factories.push(factory);
        self
    }

    pub fn with_step_effect(mut self, factory: Arc<dyn StepEffectProviderFactory>) -> Self {
        self.options.step_effect_factories.push(factory);
        self
    }

    pub fn with_json(mut self, json: crate::config::JsonOptions) -> Self {
        self.options.json = json;
        self
    }

    pub fn with_service<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.options.services.insert(service);
        self
    }

    pub fn build(self) -> WorkflowBus {
        WorkflowBus {
            registry: self.registry,
            harness: WorkflowHarness::new(self.options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_value;
    use crate::model::WorkflowState;
    use crate::workflow::WorkflowRun;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Ping {
        n: i64,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Pong {
        n: i64,
    }

    memory_value!(Ping, Pong);

    #[derive(Default)]
    struct Bounce;

    #[async_trait]
    impl crate::step::Step for Bounce {
        type Input = Ping;
        type Output = Pong;

        async fn run(&self, ping: Ping) -> anyhow::Result<Pong> {
            Ok(Pong { n: ping.n + 1 })
        }
    }

    struct PingWorkflow;

    #[async_trait]
    impl Workflow for PingWorkflow {
        type Input = Ping;
        type Output = Pong;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.chain::<Bounce>().await?;
            Ok(())
        }
    }

    struct RivalWorkflow;

    #[async_trait]
    impl Workflow for RivalWorkflow {
        type Input = Ping;
        type Output = Pong;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.chain::<Bounce>().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_dispatch_routes_on_the_input_type() {
        let bus = WorkflowBus::builder()
            .register(|| PingWorkflow)
            .unwrap()
            .build();

        let pong: Pong = bus.run_as(Ping { n: 41 }).await.unwrap();
        assert_eq!(pong, Pong { n: 42 });
    }

    #[tokio::test]
    async fn untyped_dispatch_routes_on_the_input_type_name() {
        let bus = WorkflowBus::builder()
            .register(|| PingWorkflow)
            .unwrap()
            .build();

        let out = bus
            .run_value(
                "Ping",
                serde_json::json!({"n": 1}),
                RunContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"n": 2}));
    }

    #[tokio::test]
    async fn duplicate_input_types_fail_registration() {
        let result = WorkflowBus::builder()
            .register(|| PingWorkflow)
            .unwrap()
            .register(|| RivalWorkflow);

        match result {
            Err(CoreError::DuplicateInput {
                input_type,
                workflow,
            }) => {
                assert_eq!(input_type, "Ping");
                assert_eq!(workflow, "PingWorkflow");
            }
            other => panic!("expected duplicate-input error, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn missing_mapping_is_a_workflow_error() {
        let bus = WorkflowBus::builder().build();
        let result: Result<Pong, _> = bus.run_as(Ping { n: 0 }).await;
        assert!(matches!(result, Err(CoreError::UnmappedInput(name)) if name == "Ping"));
    }

    #[tokio::test]
    async fn initialize_creates_pending_metadata_without_executing() {
        let bus = WorkflowBus::builder()
            .register(|| PingWorkflow)
            .unwrap()
            .build();

        let handle = bus.initialize(Ping { n: 1 }).await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, WorkflowState::Pending);
        assert_eq!(snapshot.name, "PingWorkflow");
        assert!(snapshot.end_time.is_none());
    }

    #[tokio::test]
    async fn descriptors_expose_registration_identity() {
        let bus = WorkflowBus::builder()
            .register(|| PingWorkflow)
            .unwrap()
            .build();

        let descriptor = bus.descriptor_for_input::<Ping>().unwrap();
        assert_eq!(descriptor.workflow_name, "PingWorkflow");
        assert_eq!(descriptor.input_type_name, "Ping");
        assert!(descriptor.full_name.contains("PingWorkflow"));
        assert!(bus.descriptor_for_input_name("Ping").is_some());
        assert!(bus.descriptor_for_input_name("Nope").is_none());
    }
}
