//! Engine configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default idle time after which a batch key's worker is retired.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);

/// Default capacity of the error channel.
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Default time to wait for in-flight work during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of events kept parked across all webhooks.
pub const DEFAULT_MAX_PARKED: usize = 10_000;

/// Global batching policy for webhooks in [`BatchedAtMostOnce`] mode.
///
/// [`BatchedAtMostOnce`]: crate::DeliveryMode::BatchedAtMostOnce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchingConfig {
    /// Every event is sent on its own, whatever the webhook's mode.
    #[default]
    Disabled,
    /// Events are grouped until either threshold is reached.
    Enabled {
        /// Number of events that triggers a flush.
        max_batch_size: NonZeroUsize,
        /// Time after a batch opens that triggers a flush.
        max_wait_time: Duration,
    },
}

impl BatchingConfig {
    /// Creates an enabled configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the size or the wait time is zero.
    pub fn enabled(max_batch_size: usize, max_wait_time: Duration) -> Result<Self> {
        let max_batch_size = NonZeroUsize::new(max_batch_size)
            .ok_or_else(|| Error::invalid_config("max batch size must be positive"))?;
        if max_wait_time.is_zero() {
            return Err(Error::invalid_config("max wait time must be positive"));
        }

        Ok(Self::Enabled {
            max_batch_size,
            max_wait_time,
        })
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// Returns the wait time when batching is enabled.
    pub const fn max_wait_time(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Enabled { max_wait_time, .. } => Some(*max_wait_time),
        }
    }
}

/// Configuration supplied once when the engine is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "config does nothing unless you use it"]
pub struct DispatchConfig {
    pub batching: BatchingConfig,
    /// Idle time after which a batch key's worker is retired.
    pub idle_ttl: Duration,
    /// Number of unread errors kept per error channel subscriber.
    pub error_channel_capacity: usize,
    /// Maximum time [`DispatchHandle::shutdown`] waits for in-flight work.
    ///
    /// [`DispatchHandle::shutdown`]: crate::DispatchHandle::shutdown
    pub shutdown_timeout: Duration,
    /// Events kept parked across all webhooks; further ones stay `New` in
    /// the store and are not held by the engine.
    pub max_parked: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batching: BatchingConfig::Disabled,
            idle_ttl: DEFAULT_IDLE_TTL,
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_parked: DEFAULT_MAX_PARKED,
        }
    }
}

impl DispatchConfig {
    pub fn new(batching: BatchingConfig) -> Self {
        Self {
            batching,
            ..Self::default()
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_parked(mut self, max_parked: usize) -> Self {
        self.max_parked = max_parked;
        self
    }

    /// Returns the idle time used for retiring batch workers.
    ///
    /// Never shorter than twice the batching wait time, so a key is only
    /// retired once its last batch had time to flush on its own.
    pub fn effective_idle_ttl(&self) -> Duration {
        match self.batching.max_wait_time() {
            Some(wait) => self.idle_ttl.max(wait.saturating_mul(2)),
            None => self.idle_ttl,
        }
    }

    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero batching wait time, idle
    /// TTL, error channel capacity or parked limit.
    pub fn validate(&self) -> Result<()> {
        if self.batching.max_wait_time().is_some_and(|wait| wait.is_zero()) {
            return Err(Error::invalid_config("max wait time must be positive"));
        }
        if self.idle_ttl.is_zero() {
            return Err(Error::invalid_config("idle TTL must be positive"));
        }
        if self.error_channel_capacity == 0 {
            return Err(Error::invalid_config(
                "error channel capacity must be positive",
            ));
        }
        if self.max_parked == 0 {
            return Err(Error::invalid_config("max parked events must be positive"));
        }
        Ok(())
    }
}

/// Command-line and environment representation of [`DispatchConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct DispatchArgs {
    /// Enable batching for webhooks in batched delivery mode
    #[cfg_attr(feature = "config", arg(long = "batching", env = "BATCHING_ENABLED"))]
    #[serde(default)]
    pub batching: bool,

    /// Number of events that flushes a batch
    #[cfg_attr(
        feature = "config",
        arg(long = "batch-max-size", env = "BATCH_MAX_SIZE", default_value = "100")
    )]
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Milliseconds after a batch opens that flush it
    #[cfg_attr(
        feature = "config",
        arg(
            long = "batch-max-wait-ms",
            env = "BATCH_MAX_WAIT_MS",
            default_value = "1000"
        )
    )]
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,

    /// Seconds of inactivity after which a batch worker is retired
    #[cfg_attr(
        feature = "config",
        arg(long = "batch-idle-ttl", env = "BATCH_IDLE_TTL", default_value = "60")
    )]
    #[serde(default = "default_idle_ttl_secs")]
    pub batch_idle_ttl: u64,

    /// Seconds to wait for in-flight deliveries during shutdown
    #[cfg_attr(
        feature = "config",
        arg(long = "shutdown-timeout", env = "SHUTDOWN_TIMEOUT", default_value = "30")
    )]
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout: u64,

    /// Events kept parked for unknown or non-enabled webhooks
    #[cfg_attr(
        feature = "config",
        arg(long = "max-parked", env = "MAX_PARKED", default_value = "10000")
    )]
    #[serde(default = "default_max_parked")]
    pub max_parked: usize,
}

fn default_batch_max_size() -> usize {
    100
}

fn default_batch_max_wait_ms() -> u64 {
    1000
}

fn default_idle_ttl_secs() -> u64 {
    DEFAULT_IDLE_TTL.as_secs()
}

fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_secs()
}

fn default_max_parked() -> usize {
    DEFAULT_MAX_PARKED
}

impl Default for DispatchArgs {
    fn default() -> Self {
        Self {
            batching: false,
            batch_max_size: default_batch_max_size(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            batch_idle_ttl: default_idle_ttl_secs(),
            shutdown_timeout: default_shutdown_timeout_secs(),
            max_parked: default_max_parked(),
        }
    }
}

impl TryFrom<&DispatchArgs> for DispatchConfig {
    type Error = Error;

    fn try_from(args: &DispatchArgs) -> Result<Self> {
        let batching = if args.batching {
            BatchingConfig::enabled(
                args.batch_max_size,
                Duration::from_millis(args.batch_max_wait_ms),
            )?
        } else {
            BatchingConfig::Disabled
        };

        let config = DispatchConfig::new(batching)
            .with_idle_ttl(Duration::from_secs(args.batch_idle_ttl))
            .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout))
            .with_max_parked(args.max_parked);
        config.validate()?;
        Ok(config)
    }
}
