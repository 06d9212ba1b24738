//! Pool configuration and its serialized form.

use serde::{Deserialize, Serialize};

use crate::driver::ConnectArgs;
use crate::error::{PoolError, PoolResult};

/// Default lower bound on worker threads.
pub const DEFAULT_MIN_WORKERS: usize = 3;

/// Default upper bound on worker threads.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Settings of a [`ConnectionPool`](crate::ConnectionPool).
///
/// Call [`reconcile`](Self::reconcile) (the pool constructor does) to validate
/// and normalize the worker bounds.
///
/// # Examples
///
/// ```
/// use affinity_pool::PoolConfig;
///
/// let config = PoolConfig::new()
///     .connect_arg("app.db")
///     .min_workers(2)
///     .max_workers(4)
///     .verbose(false);
///
/// assert_eq!(config.min_workers, 2);
/// assert_eq!(config.connect_args.positional.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Arguments forwarded verbatim to the driver's `connect`.
    pub connect_args: ConnectArgs,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Log connection open/close events at `info` level.
    pub verbose: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_args: ConnectArgs::default(),
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            verbose: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_args(mut self, args: ConnectArgs) -> Self {
        self.connect_args = args;
        self
    }

    /// Appends a positional connect argument.
    pub fn connect_arg(mut self, value: impl Into<crate::driver::Value>) -> Self {
        self.connect_args = self.connect_args.arg(value);
        self
    }

    /// Sets a named connect argument.
    pub fn named_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::driver::Value>,
    ) -> Self {
        self.connect_args = self.connect_args.named(key, value);
        self
    }

    pub fn min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validates the worker bounds and lowers `min_workers` to `max_workers`
    /// when they are reversed.
    ///
    /// # Errors
    ///
    /// [`PoolError::Configuration`] if either bound is zero.
    pub fn reconcile(mut self) -> PoolResult<Self> {
        if self.min_workers == 0 || self.max_workers == 0 {
            return Err(PoolError::Configuration(format!(
                "worker bounds must be positive (min={}, max={})",
                self.min_workers, self.max_workers
            )));
        }
        self.min_workers = self.min_workers.min(self.max_workers);
        Ok(self)
    }
}

/// Everything needed to rebuild an equivalent, disconnected pool.
///
/// Produced by [`ConnectionPool::snapshot`](crate::ConnectionPool::snapshot) and
/// consumed by [`ConnectionPool::from_snapshot`](crate::ConnectionPool::from_snapshot).
/// Live connections and the on-connect hook are not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Identifier of the driver, as reported by `Driver::name`.
    pub driver: String,
    pub verbose: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub connect_args: ConnectArgs,
}

impl PoolSnapshot {
    pub(crate) fn new(driver: impl Into<String>, config: &PoolConfig) -> Self {
        Self {
            driver: driver.into(),
            verbose: config.verbose,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            connect_args: config.connect_args.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The pool configuration described by this snapshot.
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            connect_args: self.connect_args.clone(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            verbose: self.verbose,
        }
    }
}
