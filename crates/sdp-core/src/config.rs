//! Node configuration.
//!
//! Serializable with serde so front-ends can load it from TOML; every section
//! falls back to defaults when absent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use sdp_transport::{MacAddress, QueueConfig};

use crate::dispatcher::DispatcherConfig;
use crate::error::{Result, SdpError};
use crate::orchestration::OrchestrationConfig;
use crate::peer::{MAX_NAME_LEN, ProtocolVersion};

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and pool sizing
    pub node: NodeSection,
    /// Work queue behavior
    pub queue: QueueSection,
    /// Outbound messaging
    pub messaging: MessagingSection,
    /// Wake/sleep timings
    pub orchestration: OrchestrationSection,
    /// Log output
    pub logging: LoggingSection,
}

/// Identity and pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSection {
    /// Name announced in handshakes
    pub name: String,
    /// Local hardware address
    pub address: String,
    /// Peer pool capacity
    pub peer_capacity: usize,
}

/// Work queue behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    /// Run application work on separate tasks
    pub multitask: bool,
    /// Concurrent task bound (0 = unlimited)
    pub max_tasks: usize,
    /// Queue depth bound
    pub capacity: usize,
    /// Lock acquisition bound (ms)
    pub lock_timeout_ms: u64,
    /// Idle wait / poll cadence (ms)
    pub idle_wait_ms: u64,
}

/// Outbound messaging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagingSection {
    /// Send attempts per message
    pub send_attempts: u32,
}

/// Wake/sleep timings, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestrationSection {
    /// Nominal awake window
    pub awake_ms: u64,
    /// Sleep window
    pub sleep_ms: u64,
    /// Margin after a controller's window opens
    pub wake_margin_ms: u64,
    /// WHEN attempts
    pub when_retries: u32,
    /// Wait for NEXT per attempt
    pub when_timeout_ms: u64,
    /// Sleep when the controller is silent
    pub retry_sleep_ms: u64,
    /// Extension asked for on a sleep veto
    pub veto_slice_ms: u64,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "sdp-node".to_string(),
            address: "02:00:00:00:00:01".to_string(),
            peer_capacity: 16,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            multitask: true,
            max_tasks: 4,
            capacity: 64,
            lock_timeout_ms: 5_000,
            idle_wait_ms: 10,
        }
    }
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self { send_attempts: 4 }
    }
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            awake_ms: 5_000,
            sleep_ms: 30_000,
            wake_margin_ms: 50,
            when_retries: 3,
            when_timeout_ms: 500,
            retry_sleep_ms: 10_000,
            veto_slice_ms: 500,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Check every section.
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() || self.node.name.len() > MAX_NAME_LEN {
            return Err(SdpError::InvalidConfig(
                format!("node.name must be 1..={MAX_NAME_LEN} bytes").into(),
            ));
        }
        self.address()?;
        if self.node.peer_capacity == 0 {
            return Err(SdpError::invalid_config("node.peer_capacity must be non-zero"));
        }

        if self.queue.capacity == 0 {
            return Err(SdpError::invalid_config("queue.capacity must be non-zero"));
        }
        if self.queue.lock_timeout_ms == 0 {
            return Err(SdpError::invalid_config("queue.lock_timeout_ms must be non-zero"));
        }
        if self.queue.idle_wait_ms == 0 {
            return Err(SdpError::invalid_config("queue.idle_wait_ms must be non-zero"));
        }

        if self.messaging.send_attempts == 0 {
            return Err(SdpError::invalid_config("messaging.send_attempts must be non-zero"));
        }

        let o = &self.orchestration;
        if o.awake_ms == 0 {
            return Err(SdpError::invalid_config("orchestration.awake_ms must be non-zero"));
        }
        if o.when_retries == 0 {
            return Err(SdpError::invalid_config("orchestration.when_retries must be non-zero"));
        }
        if o.veto_slice_ms >= o.awake_ms {
            return Err(SdpError::invalid_config(
                "orchestration.veto_slice_ms must be shorter than awake_ms",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(SdpError::InvalidConfig(
                format!(
                    "logging.level '{}' must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                )
                .into(),
            ));
        }
        Ok(())
    }

    /// Parsed local address
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidConfig`] for a malformed address.
    pub fn address(&self) -> Result<MacAddress> {
        self.node
            .address
            .parse()
            .map_err(|e: String| SdpError::InvalidConfig(e.into()))
    }

    /// Queue settings for a queue called `name`
    pub fn queue_config(&self, name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            multitask: self.queue.multitask,
            max_tasks: self.queue.max_tasks,
            capacity: self.queue.capacity,
            lock_timeout: Duration::from_millis(self.queue.lock_timeout_ms),
            idle_wait: Duration::from_millis(self.queue.idle_wait_ms),
        }
    }

    /// Dispatcher settings
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            name: self.node.name.clone(),
            send_attempts: self.messaging.send_attempts,
            version: ProtocolVersion::CURRENT,
            lock_timeout: Duration::from_millis(self.queue.lock_timeout_ms),
        }
    }

    /// Orchestration settings
    pub fn orchestration_config(&self) -> OrchestrationConfig {
        let o = &self.orchestration;
        OrchestrationConfig {
            awake: Duration::from_millis(o.awake_ms),
            sleep: Duration::from_millis(o.sleep_ms),
            wake_margin: Duration::from_millis(o.wake_margin_ms),
            when_retries: o.when_retries,
            when_timeout: Duration::from_millis(o.when_timeout_ms),
            retry_sleep: Duration::from_millis(o.retry_sleep_ms),
            veto_slice: Duration::from_millis(o.veto_slice_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address().unwrap(), MacAddress([2, 0, 0, 0, 0, 1]));
        assert_eq!(config.messaging.send_attempts, 4);
    }

    #[test]
    fn test_rejects_bad_address() {
        let mut config = NodeConfig::default();
        config.node.address = "02:00:00".to_string();
        assert!(matches!(config.validate(), Err(SdpError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = NodeConfig::default();
        config.node.peer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.messaging.send_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut config = NodeConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.level"));

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_veto_slice_must_fit() {
        let mut config = NodeConfig::default();
        config.orchestration.veto_slice_ms = config.orchestration.awake_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = NodeConfig::default();
        let queue = config.queue_config("radio-short");
        assert_eq!(queue.name, "radio-short");
        assert_eq!(queue.max_tasks, 4);
        assert_eq!(queue.idle_wait, Duration::from_millis(10));

        let orch = config.orchestration_config();
        assert_eq!(orch.awake, Duration::from_secs(5));
        assert_eq!(orch.sleep, Duration::from_secs(30));

        assert_eq!(config.dispatcher_config().name, "sdp-node");
    }
}
