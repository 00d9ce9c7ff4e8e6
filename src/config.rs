//! Broker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BufferPoolError, Result};

/// Default time a transfer may stay pending before the broker expires it
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default cap on live buffers per pool
pub const DEFAULT_MAX_BUFFERS: usize = 1024;

/// Default number of closed transactions remembered per pool
pub const DEFAULT_RETIRED_HISTORY: usize = 1024;

/// Configuration for a pool broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Name of the pool
    pub name: String,
    /// Pending transactions older than this are expired
    pub transaction_timeout: Duration,
    /// Maximum number of live buffers in the pool
    pub max_buffers: usize,
    /// Closed transactions kept for receive validation
    pub retired_history: usize,
    /// Idle buffers kept by a non-clearing cleanup
    pub min_idle_buffers: usize,
    /// Interval of the optional background sweep
    pub sweep_interval: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            max_buffers: DEFAULT_MAX_BUFFERS,
            retired_history: DEFAULT_RETIRED_HISTORY,
            min_idle_buffers: 0,
            sweep_interval: None,
        }
    }
}

impl BrokerConfig {
    /// Create a new configuration with custom name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set transaction timeout
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Set maximum live buffer count
    pub fn with_max_buffers(mut self, count: usize) -> Self {
        self.max_buffers = count;
        self
    }

    /// Set retired transaction history length
    pub fn with_retired_history(mut self, count: usize) -> Self {
        self.retired_history = count;
        self
    }

    /// Set idle buffers kept on cleanup
    pub fn with_min_idle_buffers(mut self, count: usize) -> Self {
        self.min_idle_buffers = count;
        self
    }

    /// Set background sweep interval
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.transaction_timeout.is_zero() {
            return Err(BufferPoolError::invalid_config(
                "transaction_timeout",
                "Transaction timeout must be greater than zero",
            ));
        }

        if self.max_buffers == 0 {
            return Err(BufferPoolError::invalid_config(
                "max_buffers",
                "Max buffers cannot be zero",
            ));
        }

        if self.min_idle_buffers > self.max_buffers {
            return Err(BufferPoolError::invalid_config(
                "min_idle_buffers",
                "Idle buffers kept cannot exceed max buffers",
            ));
        }

        if matches!(self.sweep_interval, Some(interval) if interval.is_zero()) {
            return Err(BufferPoolError::invalid_config(
                "sweep_interval",
                "Sweep interval must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Builder pattern for broker configuration
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: BrokerConfig::new(name),
        }
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    pub fn max_buffers(mut self, count: usize) -> Self {
        self.config.max_buffers = count;
        self
    }

    pub fn retired_history(mut self, count: usize) -> Self {
        self.config.retired_history = count;
        self
    }

    pub fn min_idle_buffers(mut self, count: usize) -> Self {
        self.config.min_idle_buffers = count;
        self
    }

    /// Enable periodic sweeping
    pub fn sweep_every(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = Some(interval);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<BrokerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
