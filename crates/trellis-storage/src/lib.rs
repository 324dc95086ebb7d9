//! # Trellis storage
//!
//! Transactional store abstraction over the engine's entities, with two
//! implementations sharing one set of observable semantics:
//!
//! - [`PostgresDataContext`]: production persistence on sqlx/PostgreSQL,
//!   SKIP LOCKED job claiming, transactional dispatch
//! - [`InMemoryDataContext`]: lock-guarded maps for tests and the in-process
//!   task server
//!
//! The [`DataContextEffect`] bridges the store into the core effect system:
//! tracked models are upserted on every flush.

pub mod context;
pub mod effect;
pub mod memory;
pub mod postgres;

pub use context::{
    DataContext, DeadLetterResolution, DispatchedWork, ManifestState, MetadataSeed,
    NewBackgroundJob, NewDeadLetter, NewMetadata, NewWorkItem, PurgeCounts, QueuedWork, StoreError,
};
pub use effect::DataContextEffect;
pub use memory::InMemoryDataContext;
pub use postgres::PostgresDataContext;
