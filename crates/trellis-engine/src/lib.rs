//! # Trellis engine
//!
//! The manifest-driven scheduler around the workflow core:
//!
//! ```text
//! Declarative schedule ──► manifest row
//! Manifest manager (tick) ──► work-queue row (queued)
//! Job dispatcher   (tick) ──► metadata row + background job (claimable)
//! Task-server worker      ──► executes the workflow, updates metadata,
//!                             retries exhausted ──► dead letter
//! ```
//!
//! Long-running components each run as their own task on a cooperative
//! periodic timer; all mutual exclusion is backed by the store (row locks
//! for job claiming, status columns for dispatch), never by application
//! locks held across I/O.

pub mod cleanup;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod manager;
pub mod schedule;
pub mod task_server;

pub use cleanup::MetadataCleanup;
pub use config::{CleanupConfig, EngineConfig, TaskServerConfig, TaskServerKind};
pub use dead_letter::DeadLetterService;
pub use dispatcher::JobDispatcher;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use executor::{ExecuteManifestRequest, ManifestExecutor};
pub use manager::ManifestManager;
pub use schedule::{Cadence, ScheduleRequest, Scheduler};
pub use task_server::{InProcessTaskServer, SqlTaskServer, TaskServer};

use rand::Rng;
use std::time::Duration;

/// Random fraction of a loop's poll interval, slept before its first tick so
/// concurrent engine instances do not hit the store on a shared beat.
pub(crate) fn jittered_start(poll_interval: Duration) -> Duration {
    poll_interval.mul_f64(rand::thread_rng().gen_range(0.0..0.5))
}
