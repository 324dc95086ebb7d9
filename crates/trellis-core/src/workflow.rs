//! Workflow run and harness
//!
//! A [`WorkflowRun`] drives one execution: it owns the type-keyed memory, the
//! first-fault state, the cancellation handle, the service container and the
//! effect runners. User workflows implement [`Workflow::run_internal`] and
//! compose steps with `chain`/`short_circuit`, then the harness resolves the
//! output, finalizes the metadata record on every path and disposes the
//! effect runner.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::JsonOptions;
use crate::effect::{EffectProviderFactory, EffectRunner, Tracked};
use crate::error::CoreError;
use crate::memory::{FromMemory, IntoMemory, RunMemory};
use crate::model::{Metadata, MetadataHandle, StepMetadata, StepState};
use crate::step::{run_railway, Step, StepHost};
use crate::step_effect::{StepEffectProviderFactory, StepEffectRunner, StepExecution};
use crate::track::{FaultData, Track};

/// Capabilities resolved once at workflow construction
///
/// Values are stored behind `Arc` and cloned out per lookup, so attaching a
/// service is cheap and the bag itself clones into every run.
#[derive(Clone, Default)]
pub struct ServiceBag {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A typed, multi-step workflow
///
/// # Example
///
/// ```ignore
/// struct OrderWorkflow;
///
/// #[async_trait::async_trait]
/// impl Workflow for OrderWorkflow {
///     type Input = Order;
///     type Output = Receipt;
///
///     async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
///         run.chain::<ValidateOrder>().await?;
///         run.chain::<ChargeCard>().await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Activated into run memory before the chain starts
    type Input: IntoMemory + FromMemory + Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Resolved out of run memory once the chain finishes
    type Output: FromMemory + Serialize + DeserializeOwned + Send + Sync;

    /// Name recorded on the metadata row and used by the bus.
    fn name(&self) -> &'static str {
        crate::short_type_name::<Self>()
    }

    /// Compose the step chain for one run.
    async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError>;
}

/// State of a single in-flight workflow execution
pub struct WorkflowRun {
    workflow_name: String,
    memory: RunMemory,
    services: ServiceBag,
    fault: Option<FaultData>,
    cancellation: CancellationToken,
    effects: Arc<EffectRunner>,
    step_effects: Arc<StepEffectRunner>,
    metadata: MetadataHandle,
    json: JsonOptions,
}

impl WorkflowRun {
    pub fn metadata(&self) -> &MetadataHandle {
        &self.metadata
    }

    pub fn external_id(&self) -> String {
        self.metadata.external_id()
    }

    /// First fault captured by the chain, if any.
    pub fn fault(&self) -> Option<&FaultData> {
        self.fault.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn effects(&self) -> &EffectRunner {
        &self.effects
    }

    /// Seed memory with the run input plus extras; tuples flatten
    /// element-wise and re-adding a type overwrites its slot.
    pub fn activate(&mut self, input: impl IntoMemory, extras: impl IntoMemory) {
        input.store(&mut self.memory);
        extras.store(&mut self.memory);
    }

    /// Store a value into run memory; tuples flatten element-wise.
    pub fn put(&mut self, value: impl IntoMemory) {
        value.store(&mut self.memory);
    }

    /// Pull a value out of run memory by type.
    pub fn extract<T: FromMemory>(&self) -> Result<T, CoreError> {
        T::take(&self.memory)
    }

    /// Attach a capability for later steps to resolve.
    pub fn add_service<T: Send + Sync + 'static>(&mut self, service: T) {
        self.services.insert(service);
    }

    /// Resolve an attached capability.
    pub fn service<T: Clone + Send + Sync + 'static>(&self) -> Result<T, CoreError> {
        self.services
            .get::<T>()
            .ok_or_else(CoreError::missing_service::<T>)
    }

    /// Chain a default-constructed step.
    pub async fn chain<S: Step + Default>(&mut self) -> Result<&mut Self, CoreError> {
        let step = S::default();
        self.run_step(&step, true).await?;
        Ok(self)
    }

    /// Chain an explicitly constructed step.
    pub async fn chain_with<S: Step>(&mut self, step: S) -> Result<&mut Self, CoreError> {
        self.run_step(&step, true).await?;
        Ok(self)
    }

    /// Chain a step resolved from the service container (polymorphic
    /// dispatch: the instance attached as `Arc<S>` runs).
    pub async fn chain_service<S: Step>(&mut self) -> Result<&mut Self, CoreError> {
        let step: Arc<S> = self.service::<Arc<S>>()?;
        self.run_step(&*step, true).await?;
        Ok(self)
    }

    /// Run an alternative step: its failure faults the remainder of the
    /// chain, its success changes nothing and its output is discarded.
    pub async fn short_circuit<S: Step + Default>(&mut self) -> Result<&mut Self, CoreError> {
        let step = S::default();
        self.run_step(&step, false).await?;
        Ok(self)
    }

    /// `short_circuit` with an explicitly constructed step.
    pub async fn short_circuit_with<S: Step>(&mut self, step: S) -> Result<&mut Self, CoreError> {
        self.run_step(&step, false).await?;
        Ok(self)
    }

    /// Final-result extraction as a two-track value.
    pub fn resolve<O: FromMemory>(&self) -> Result<Track<O>, CoreError> {
        if let Some(fault) = &self.fault {
            return Ok(Track::Fault(fault.clone()));
        }
        match O::take(&self.memory) {
            Ok(value) => Ok(Track::Ok(value)),
            Err(CoreError::MissingMemory { type_name }) => Err(CoreError::Unresolved { type_name }),
            Err(e) => Err(e),
        }
    }

    async fn run_step<S: Step>(&mut self, step: &S, store_output: bool) -> Result<(), CoreError> {
        let record = Arc::new(RwLock::new(StepMetadata::new(
            self.metadata.external_id(),
            step.name(),
            <S::Input as FromMemory>::type_names().join(", "),
            <S::Output as IntoMemory>::type_names().join(", "),
        )));

        // A faulted chain still emits the record, tagged skipped.
        if self.fault.is_some() {
            let execution = self.execution(record, None);
            self.step_effects.before_step(&execution, &self.effects).await;
            self.step_effects.after_step(&execution, &self.effects).await;
            return Ok(());
        }

        // A missing input type is structural and surfaces immediately.
        let input = S::Input::take(&self.memory)?;
        let input_json = self.json.to_value(&input).ok();

        record.write().start_time_utc = Some(Utc::now());
        let mut execution = self.execution(record.clone(), input_json);
        self.step_effects.before_step(&execution, &self.effects).await;

        let host = StepHost {
            workflow_name: self.workflow_name.clone(),
            workflow_external_id: self.metadata.external_id(),
        };
        let outcome = run_railway(step, Track::Ok(input), &self.cancellation, &host).await?;

        {
            let mut rec = record.write();
            rec.has_ran = true;
            rec.end_time_utc = Some(Utc::now());
        }

        match outcome {
            Track::Ok(output) => {
                record.write().state = StepState::Ok;
                execution.output_json = self.json.to_value(&output).ok();
                if store_output {
                    output.store(&mut self.memory);
                }
            }
            Track::Fault(fault) => {
                record.write().state = StepState::Fault;
                execution.fault = Some(fault.clone());
                self.fault = Some(fault);
            }
            // run_railway only returns Skipped for an already-faulted
            // track, which was handled above.
            Track::Skipped => {}
        }

        self.step_effects.after_step(&execution, &self.effects).await;
        Ok(())
    }

    fn execution(
        &self,
        record: Arc<RwLock<StepMetadata>>,
        input_json: Option<serde_json::Value>,
    ) -> StepExecution {
        StepExecution {
            record,
            input_json,
            output_json: None,
            fault: None,
            workflow_name: self.workflow_name.clone(),
            workflow_external_id: self.metadata.external_id(),
        }
    }
}

/// Everything a harness needs to drive runs: effect factories, step-effect
/// factories, serialization policy and the baseline service container.
#[derive(Clone, Default)]
pub struct HarnessOptions {
    pub effect_factories: Vec<Arc<dyn EffectProviderFactory>>,
    pub step_effect_factories: Vec<Arc<dyn StepEffectProviderFactory>>,
    pub json: JsonOptions,
    pub services: ServiceBag,
}

/// Per-run context: nesting, schedule linkage, adoption and cancellation
pub struct RunContext {
    /// Metadata id of the workflow that started this run
    pub parent_id: Option<i64>,

    /// Manifest this run was scheduled from
    pub manifest_id: Option<i64>,

    /// Existing metadata row to drive instead of creating a fresh one
    /// (dispatcher-created rows are adopted by the task server)
    pub adopt: Option<MetadataHandle>,

    pub cancellation: CancellationToken,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            parent_id: None,
            manifest_id: None,
            adopt: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl RunContext {
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn adopting(mut self, metadata: MetadataHandle) -> Self {
        self.adopt = Some(metadata);
        self
    }
}

/// Drives workflows end to end: metadata lifecycle, memory activation, the
/// step chain, effect flushes and disposal on every exit path.
#[derive(Clone)]
pub struct WorkflowHarness {
    options: HarnessOptions,
}

impl WorkflowHarness {
    pub fn new(options: HarnessOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Run a workflow; a fault surfaces as an error.
    pub async fn run<W: Workflow>(
        &self,
        workflow: &W,
        input: W::Input,
        ctx: RunContext,
    ) -> Result<W::Output, CoreError> {
        match self.run_either(workflow, input, ctx).await? {
            Track::Ok(output) => Ok(output),
            Track::Fault(fault) => Err(CoreError::Fault(fault)),
            Track::Skipped => Err(CoreError::Unresolved {
                type_name: crate::short_type_name::<W::Output>(),
            }),
        }
    }

    /// Run a workflow, returning the result as a two-track value.
    pub async fn run_either<W: Workflow>(
        &self,
        workflow: &W,
        input: W::Input,
        ctx: RunContext,
    ) -> Result<Track<W::Output>, CoreError> {
        let metadata = self.metadata_for(workflow.name(), &ctx);
        metadata.write().pending_input = self.options.json.to_value(&input).ok();

        let effects = Arc::new(EffectRunner::from_factories(&self.options.effect_factories)?);
        let step_effects = Arc::new(StepEffectRunner::from_factories(
            &self.options.step_effect_factories,
        )?);

        let result = self
            .drive(workflow, input, &metadata, &effects, &step_effects, ctx)
            .await;

        // Terminal state persists even when the run errored; disposal always
        // happens and its failures never fail the workflow.
        let flush = effects.save_changes().await;
        if let Err(e) = effects.dispose().await {
            warn!(workflow = workflow.name(), error = %e, "effect disposal reported failures");
        }

        match result {
            Ok(track) => {
                flush?;
                Ok(track)
            }
            Err(e) => Err(e),
        }
    }

    /// Create and persist the `Pending` metadata row without executing.
    pub async fn initialize<W: Workflow>(
        &self,
        workflow: &W,
        input: W::Input,
        ctx: RunContext,
    ) -> Result<MetadataHandle, CoreError> {
        let metadata = self.metadata_for(workflow.name(), &ctx);
        metadata.write().pending_input = self.options.json.to_value(&input).ok();

        let effects = EffectRunner::from_factories(&self.options.effect_factories)?;
        effects.track(Tracked::Metadata(metadata.clone())).await;
        let flush = effects.save_changes().await;
        if let Err(e) = effects.dispose().await {
            warn!(workflow = workflow.name(), error = %e, "effect disposal reported failures");
        }
        flush?;

        debug!(
            workflow = workflow.name(),
            external_id = %metadata.external_id(),
            "initialized workflow"
        );
        Ok(metadata)
    }

    fn metadata_for(&self, name: &str, ctx: &RunContext) -> MetadataHandle {
        match &ctx.adopt {
            Some(handle) => handle.clone(),
            None => {
                let mut metadata = Metadata::new(name);
                metadata.parent_id = ctx.parent_id;
                metadata.manifest_id = ctx.manifest_id;
                MetadataHandle::new(metadata)
            }
        }
    }

    async fn drive<W: Workflow>(
        &self,
        workflow: &W,
        input: W::Input,
        metadata: &MetadataHandle,
        effects: &Arc<EffectRunner>,
        step_effects: &Arc<StepEffectRunner>,
        ctx: RunContext,
    ) -> Result<Track<W::Output>, CoreError> {
        effects.track(Tracked::Metadata(metadata.clone())).await;
        effects.save_changes().await?;

        metadata.write().begin();
        effects.save_changes().await?;

        debug!(
            workflow = workflow.name(),
            external_id = %metadata.external_id(),
            "workflow starting"
        );

        let mut run = WorkflowRun {
            workflow_name: workflow.name().to_string(),
            memory: RunMemory::new(),
            services: self.options.services.clone(),
            fault: None,
            cancellation: ctx.cancellation,
            effects: effects.clone(),
            step_effects: step_effects.clone(),
            metadata: metadata.clone(),
            json: self.options.json,
        };
        run.activate(input, metadata.clone());

        let track = match workflow.run_internal(&mut run).await {
            Ok(()) => run.resolve::<W::Output>(),
            Err(e) => Err(e),
        };

        match track {
            Ok(Track::Ok(output)) => {
                let mut guard = metadata.write();
                guard.pending_output = self.options.json.to_value(&output).ok();
                guard.complete();
                drop(guard);
                debug!(workflow = workflow.name(), "workflow completed");
                Ok(Track::Ok(output))
            }
            Ok(Track::Fault(fault)) => {
                metadata.write().fail(&fault);
                debug!(workflow = workflow.name(), step = %fault.step, "workflow faulted");
                Ok(Track::Fault(fault))
            }
            Ok(Track::Skipped) => Ok(Track::Skipped),
            Err(err) => {
                // Structural errors and cancellation both leave a failed
                // record behind, then re-raise unchanged.
                let fault = FaultData {
                    error_type: err.kind().to_string(),
                    step: workflow.name().to_string(),
                    message: err.to_string(),
                    workflow_name: workflow.name().to_string(),
                    workflow_external_id: metadata.external_id(),
                };
                metadata.write().fail(&fault);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_value;
    use anyhow::bail;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Order {
        total: u64,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Validated {
        total: u64,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Receipt {
        charged: u64,
    }

    memory_value!(Order, Validated, Receipt);

    #[derive(Default)]
    struct Validate;

    #[async_trait]
    impl Step for Validate {
        type Input = Order;
        type Output = Validated;

        async fn run(&self, order: Order) -> anyhow::Result<Validated> {
            if order.total == 0 {
                bail!("empty order");
            }
            Ok(Validated { total: order.total })
        }
    }

    #[derive(Default)]
    struct Charge;

    #[async_trait]
    impl Step for Charge {
        type Input = Validated;
        type Output = Receipt;

        async fn run(&self, validated: Validated) -> anyhow::Result<Receipt> {
            Ok(Receipt {
                charged: validated.total,
            })
        }
    }

    struct OrderWorkflow;

    #[async_trait]
    impl Workflow for OrderWorkflow {
        type Input = Order;
        type Output = Receipt;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.chain::<Validate>().await?;
            run.chain::<Charge>().await?;
            Ok(())
        }
    }

    fn harness() -> WorkflowHarness {
        WorkflowHarness::new(HarnessOptions::default())
    }

    #[tokio::test]
    async fn happy_path_resolves_the_output() {
        let receipt = harness()
            .run(&OrderWorkflow, Order { total: 40 }, RunContext::default())
            .await
            .unwrap();
        assert_eq!(receipt, Receipt { charged: 40 });
    }

    #[tokio::test]
    async fn first_fault_short_circuits_and_surfaces() {
        let result = harness()
            .run(&OrderWorkflow, Order { total: 0 }, RunContext::default())
            .await;
        match result {
            Err(CoreError::Fault(fault)) => {
                assert_eq!(fault.step, "Validate");
                assert!(fault.message.contains("empty order"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_either_returns_the_fault_as_a_value() {
        let track = harness()
            .run_either(&OrderWorkflow, Order { total: 0 }, RunContext::default())
            .await
            .unwrap();
        assert!(track.is_fault());
        assert_eq!(track.fault().unwrap().workflow_name, "OrderWorkflow");
    }

    #[tokio::test]
    async fn metadata_reaches_a_terminal_state_on_both_rails() {
        let h = harness();

        let metadata = MetadataHandle::new(Metadata::new("OrderWorkflow"));
        let ctx = RunContext::default().adopting(metadata.clone());
        h.run(&OrderWorkflow, Order { total: 40 }, ctx).await.unwrap();
        let snapshot = metadata.snapshot();
        assert_eq!(snapshot.state, crate::model::WorkflowState::Completed);
        assert!(snapshot.end_time.unwrap() >= snapshot.start_time);

        let metadata = MetadataHandle::new(Metadata::new("OrderWorkflow"));
        let ctx = RunContext::default().adopting(metadata.clone());
        let _ = h.run(&OrderWorkflow, Order { total: 0 }, ctx).await;
        let snapshot = metadata.snapshot();
        assert_eq!(snapshot.state, crate::model::WorkflowState::Failed);
        assert_eq!(snapshot.failure_step.as_deref(), Some("Validate"));
        assert!(snapshot.failure_exception.is_some());
    }

    #[tokio::test]
    async fn cancellation_propagates_unwrapped() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RunContext {
            cancellation: token,
            ..Default::default()
        };
        let result = harness().run(&OrderWorkflow, Order { total: 40 }, ctx).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    struct TupleWorkflow;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Summary {
        text: String,
    }

    memory_value!(Summary);

    #[derive(Default)]
    struct Summarize;

    #[async_trait]
    impl Step for Summarize {
        type Input = (Order, Receipt);
        type Output = Summary;

        async fn run(&self, (order, receipt): (Order, Receipt)) -> anyhow::Result<Summary> {
            Ok(Summary {
                text: format!("{} of {}", receipt.charged, order.total),
            })
        }
    }

    #[async_trait]
    impl Workflow for TupleWorkflow {
        type Input = Order;
        type Output = Summary;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.chain::<Validate>().await?;
            run.chain::<Charge>().await?;
            run.chain::<Summarize>().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn tuple_inputs_synthesize_from_memory() {
        let summary = harness()
            .run(&TupleWorkflow, Order { total: 9 }, RunContext::default())
            .await
            .unwrap();
        assert_eq!(summary.text, "9 of 9");
    }

    struct NeedsMissing;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct NeverProduced;

    memory_value!(NeverProduced);

    #[derive(Default)]
    struct WantsMissing;

    #[async_trait]
    impl Step for WantsMissing {
        type Input = NeverProduced;
        type Output = Summary;

        async fn run(&self, _input: NeverProduced) -> anyhow::Result<Summary> {
            Ok(Summary { text: "?".into() })
        }
    }

    #[async_trait]
    impl Workflow for NeedsMissing {
        type Input = Order;
        type Output = Summary;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.chain::<WantsMissing>().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_memory_is_a_structural_error() {
        let result = harness()
            .run(&NeedsMissing, Order { total: 1 }, RunContext::default())
            .await;
        assert!(matches!(
            result,
            Err(CoreError::MissingMemory {
                type_name: "NeverProduced"
            })
        ));
    }

    struct GuardedWorkflow;

    #[derive(Default)]
    struct Guard;

    #[async_trait]
    impl Step for Guard {
        type Input = Order;
        type Output = Validated;

        async fn run(&self, order: Order) -> anyhow::Result<Validated> {
            if order.total > 100 {
                bail!("over limit");
            }
            // Deliberately different from what Validate would produce.
            Ok(Validated { total: 0 })
        }
    }

    #[async_trait]
    impl Workflow for GuardedWorkflow {
        type Input = Order;
        type Output = Receipt;

        async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
            run.short_circuit::<Guard>().await?;
            run.chain::<Validate>().await?;
            run.chain::<Charge>().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn short_circuit_success_discards_its_output() {
        let receipt = harness()
            .run(&GuardedWorkflow, Order { total: 40 }, RunContext::default())
            .await
            .unwrap();
        // Guard's Validated{0} was not stored; Validate's value flowed on.
        assert_eq!(receipt.charged, 40);
    }

    #[tokio::test]
    async fn short_circuit_failure_faults_the_chain() {
        let result = harness()
            .run(&GuardedWorkflow, Order { total: 400 }, RunContext::default())
            .await;
        match result {
            Err(CoreError::Fault(fault)) => assert_eq!(fault.step, "Guard"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn services_resolve_for_chained_steps() {
        #[derive(Clone)]
        struct Rate(u64);

        #[derive(Default)]
        struct Convert;

        #[async_trait]
        impl Step for Convert {
            type Input = Order;
            type Output = Receipt;

            async fn run(&self, order: Order) -> anyhow::Result<Receipt> {
                Ok(Receipt {
                    charged: order.total,
                })
            }
        }

        struct ServiceWorkflow;

        #[async_trait]
        impl Workflow for ServiceWorkflow {
            type Input = Order;
            type Output = Receipt;

            async fn run_internal(&self, run: &mut WorkflowRun) -> Result<(), CoreError> {
                // The capability is visible to the workflow body.
                let rate = run.service::<Rate>()?;
                assert_eq!(rate.0, 3);
                run.chain_service::<Convert>().await?;
                Ok(())
            }
        }

        let mut options = HarnessOptions::default();
        options.services.insert(Rate(3));
        options.services.insert(Arc::new(Convert));

        let harness = WorkflowHarness::new(options);
        let receipt = harness
            .run(&ServiceWorkflow, Order { total: 5 }, RunContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.charged, 5);
    }
}
