//! Engine configuration
//!
//! One options value per engine instance, threaded explicitly into every
//! component. Durations default to seconds-scale polling; the visibility
//! timeout defaults to several multiples of an expected run time.

use std::time::Duration;

use tracing::Level;
use trellis_core::config::JsonOptions;

/// Which background task server the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskServerKind {
    /// Execute jobs inline in the dispatcher's context; the test substrate
    InProcess,
    /// Durable SQL-backed queue with leased worker threads
    DurableSql,
}

/// Task-server tuning
#[derive(Debug, Clone)]
pub struct TaskServerConfig {
    pub kind: TaskServerKind,

    /// Number of worker tasks leasing jobs
    pub worker_count: usize,

    /// Sleep between empty polls
    pub poll_interval: Duration,

    /// A crashed worker's claim ages out after this long and is re-leased
    pub visibility_timeout: Duration,
}

impl Default for TaskServerConfig {
    fn default() -> Self {
        Self {
            kind: TaskServerKind::DurableSql,
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Retention-driven metadata cleanup
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Workflow names eligible for cleanup; empty disables the loop
    pub workflow_whitelist: Vec<String>,

    /// Terminal runs older than this are purged with their children
    pub retention: Duration,

    pub poll_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            workflow_whitelist: Vec::new(),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            poll_interval: Duration::from_secs(3600),
        }
    }
}

/// Configuration surface for a whole engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub manager_poll_interval: Duration,
    pub dispatcher_poll_interval: Duration,
    pub task_server: TaskServerConfig,

    /// Global ceiling on active jobs per group; `None` disables
    pub max_active_jobs: Option<i64>,

    pub json: JsonOptions,

    /// Minimum level for step-boundary logging
    pub step_log_level: Level,

    /// Whether step output is snapshotted onto step records
    pub serialize_step_data: bool,

    pub cleanup: CleanupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manager_poll_interval: Duration::from_secs(1),
            dispatcher_poll_interval: Duration::from_secs(2),
            task_server: TaskServerConfig::default(),
            max_active_jobs: None,
            json: JsonOptions::default(),
            step_log_level: Level::INFO,
            serialize_step_data: true,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_manager_poll_interval(mut self, interval: Duration) -> Self {
        self.manager_poll_interval = interval;
        self
    }

    pub fn with_dispatcher_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatcher_poll_interval = interval;
        self
    }

    pub fn with_task_server_kind(mut self, kind: TaskServerKind) -> Self {
        self.task_server.kind = kind;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.task_server.worker_count = count.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.task_server.visibility_timeout = timeout;
        self
    }

    pub fn with_max_active_jobs(mut self, max: i64) -> Self {
        self.max_active_jobs = Some(max);
        self
    }

    pub fn with_json(mut self, json: JsonOptions) -> Self {
        self.json = json;
        self
    }

    pub fn with_step_log_level(mut self, level: Level) -> Self {
        self.step_log_level = level;
        self
    }

    pub fn with_serialize_step_data(mut self, enabled: bool) -> Self {
        self.serialize_step_data = enabled;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seconds_scale() {
        let config = EngineConfig::default();
        assert_eq!(config.manager_poll_interval, Duration::from_secs(1));
        assert_eq!(config.dispatcher_poll_interval, Duration::from_secs(2));
        assert_eq!(config.task_server.kind, TaskServerKind::DurableSql);
        assert!(config.max_active_jobs.is_none());
        assert!(config.serialize_step_data);
    }

    #[test]
    fn builders_compose() {
        let config = EngineConfig::default()
            .with_task_server_kind(TaskServerKind::InProcess)
            .with_worker_count(0)
            .with_max_active_jobs(8)
            .with_step_log_level(Level::DEBUG);

        assert_eq!(config.task_server.kind, TaskServerKind::InProcess);
        // Worker count never drops below one.
        assert_eq!(config.task_server.worker_count, 1);
        assert_eq!(config.max_active_jobs, Some(8));
        assert_eq!(config.step_log_level, Level::DEBUG);
    }
}
