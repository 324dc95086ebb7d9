//! # Trellis workflow core
//!
//! The execution core of the trellis orchestration engine:
//!
//! - **Two-track steps**: each step is a typed transformation whose failures
//!   travel down the chain as values instead of unwinding it
//! - **Run memory**: a per-run, type-keyed store that steps read their inputs
//!   from and write their outputs into
//! - **Effect system**: pluggable observers that receive tracked models
//!   (metadata, step metadata, logs) and persist them on demand
//! - **Workflow bus**: input-type to workflow routing for dynamic dispatch
//!   and dependent-workflow invocation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowBus                            │
//! │   (input type → workflow routing, harness construction)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRun                             │
//! │  (activate → chain → resolve over the type-keyed memory)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               EffectRunner / StepEffectRunner                │
//! │  (track models, flush in parallel, dispose on all paths)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod config;
pub mod effect;
pub mod error;
pub mod memory;
pub mod model;
pub mod step;
pub mod step_effect;
pub mod track;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{BusBuilder, WorkflowBus, WorkflowRegistry};
    pub use crate::config::JsonOptions;
    pub use crate::effect::{EffectProvider, EffectProviderFactory, EffectRunner, Tracked};
    pub use crate::error::CoreError;
    pub use crate::memory::{FromMemory, IntoMemory, MemoryValue, RunMemory};
    pub use crate::model::{Metadata, MetadataHandle, StepState, WorkflowState};
    pub use crate::step::Step;
    pub use crate::step_effect::{StepEffectProvider, StepEffectProviderFactory, StepExecution};
    pub use crate::track::{FaultData, Track};
    pub use crate::workflow::{
        HarnessOptions, RunContext, ServiceBag, Workflow, WorkflowHarness, WorkflowRun,
    };
}

pub use bus::{BusBuilder, WorkflowBus, WorkflowRegistry};
pub use config::JsonOptions;
pub use effect::{EffectProvider, EffectProviderFactory, EffectRunner, Tracked};
pub use error::CoreError;
pub use memory::{FromMemory, IntoMemory, MemoryValue, RunMemory};
pub use model::{Metadata, MetadataHandle, StepState, WorkflowState};
pub use step::Step;
pub use track::{FaultData, Track};
pub use workflow::{HarnessOptions, RunContext, ServiceBag, Workflow, WorkflowHarness, WorkflowRun};

/// Last path segment of a type name, keeping any generic arguments readable.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
