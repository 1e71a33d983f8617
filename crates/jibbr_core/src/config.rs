//! Runtime configuration.
//!
//! Every field has a default, so a configuration document only names what it
//! changes:
//!
//! ```
//! use jibbr_core::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json_str(
//!     r#"{ "worker_threads": 2, "load_timeout_ms": 1500, "tracing": { "level": "debug" } }"#,
//! )
//! .unwrap();
//! assert_eq!(config.worker_threads, 2);
//! assert_eq!(config.io_threads, 8);
//! ```

use core::time::Duration;
use std::path::Path;

use jibbr_execution::{PoolName, SchedulerConfig};
use jibbr_resource::ResourceSettings;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::tracing_setup::TracingConfig;

/// Settings for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads of the runtime's own tokio runtime.
    pub worker_threads: usize,
    /// Blocking I/O tasks allowed at once.
    pub io_threads: usize,
    /// Concurrency of the control pool.
    pub control_threads: usize,
    /// Queue wait, in milliseconds, after which a warning is logged.
    pub max_queued_time_ms: u64,
    /// Module loads slower than this many milliseconds fail.
    pub load_timeout_ms: Option<u64>,
    /// Watch the resource directories for changes.
    pub watch_files: bool,
    /// Sweep interval in milliseconds, used when native file notifications
    /// are unavailable.
    pub poll_interval_ms: u64,
    /// File locations and limits.
    pub resources: ResourceSettings,
    /// Logging.
    pub tracing: TracingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            io_threads: 8,
            control_threads: 1,
            max_queued_time_ms: 20_000,
            load_timeout_ms: None,
            watch_files: false,
            poll_interval_ms: 1_000,
            resources: ResourceSettings::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects thread counts and poll intervals of zero.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        for (name, value) in [
            ("worker_threads", self.worker_threads),
            ("io_threads", self.io_threads),
            ("control_threads", self.control_threads),
        ] {
            if value == 0 {
                return Err(RuntimeError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(RuntimeError::Invalid(
                "poll_interval_ms must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Sets the worker thread count.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the blocking I/O concurrency.
    #[must_use]
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Sets the control pool concurrency.
    #[must_use]
    pub fn with_control_threads(mut self, threads: usize) -> Self {
        self.control_threads = threads;
        self
    }

    /// Sets the queue wait after which a warning is logged.
    #[must_use]
    pub fn with_max_queued_time(mut self, max: Duration) -> Self {
        self.max_queued_time_ms = millis(max);
        self
    }

    /// Fails module loads slower than `timeout`.
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = Some(millis(timeout));
        self
    }

    /// Enables or disables file watching.
    #[must_use]
    pub fn with_watch_files(mut self, enabled: bool) -> Self {
        self.watch_files = enabled;
        self
    }

    /// Sets the sweep interval used when native notifications are
    /// unavailable.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    /// Sets the resource locations.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceSettings) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Queue wait after which a warning is logged.
    #[must_use]
    pub fn max_queued_time(&self) -> Duration {
        Duration::from_millis(self.max_queued_time_ms)
    }

    /// Module load timeout, if any.
    #[must_use]
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    /// Fallback sweep interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Scheduler limits derived from this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_io_threads(self.io_threads)
            .with_max_queued_time(self.max_queued_time())
            .with_pool(PoolName::control(), self.control_threads)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
