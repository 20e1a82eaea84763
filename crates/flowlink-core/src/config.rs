//! Centralized Configuration Management
//!
//! This module consolidates the configuration structures used by flows, links and
//! strategies so that applications can load one `RuntimeConfig` and hand the
//! relevant sections to each component.

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Default frame-based flow resolution (1/64 s)
pub const DEFAULT_FRAME_RESOLUTION: Duration = Duration::from_micros(15_625);

/// Default maximum wire frame payload length (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Duration Serialization
// ----------------------------------------------------------------------------

/// Serialize `Duration` fields as integer milliseconds
pub mod duration_ms {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serialize `Duration` fields as integer microseconds
pub mod duration_us {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(deserializer)?))
    }
}

// ----------------------------------------------------------------------------
// Flow Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by every flow variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Queue depth at which a warning is logged
    pub queue_warn_threshold: usize,
    /// Tick length of frame-based flows
    #[serde(with = "duration_us")]
    pub frame_resolution: Duration,
    /// Worker count for multi-thread flows
    pub multi_thread_workers: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            queue_warn_threshold: 10_000,
            frame_resolution: DEFAULT_FRAME_RESOLUTION,
            multi_thread_workers: 4,
        }
    }
}

impl FlowConfig {
    /// Small thresholds so tests can observe queue warnings
    pub fn testing() -> Self {
        Self {
            queue_warn_threshold: 64,
            frame_resolution: Duration::from_millis(5),
            multi_thread_workers: 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Strategy Configuration
// ----------------------------------------------------------------------------

/// Keepalive configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Send a heartbeat when nothing else was sent since the previous tick
    pub outgoing: bool,
    /// Track inbound traffic and fail the session after silent ticks
    pub incoming: bool,
    /// Consecutive silent ticks tolerated before the session is closed
    pub threshold_failure_count: u32,
    /// Interval of the hub heartbeat tick
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: true,
            incoming: true,
            threshold_failure_count: 3,
            interval: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    /// Tight timing for tests and local links
    pub fn aggressive() -> Self {
        Self {
            outgoing: true,
            incoming: true,
            threshold_failure_count: 2,
            interval: Duration::from_millis(200),
        }
    }
}

/// Encryption handshake configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound on the Req/Resp/Ack round
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Session recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long a server keeps a dropped session recoverable
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// Maximum number of sent frames retained for retransmission
    pub retransmission_window: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_timeout: Duration::from_secs(10),
            retransmission_window: 256,
        }
    }
}

impl RecoveryConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            recovery_timeout: Duration::from_millis(500),
            retransmission_window: 32,
        }
    }
}

// ----------------------------------------------------------------------------
// Link Configuration
// ----------------------------------------------------------------------------

/// Configuration for a client or server link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link name, carried in connect/disconnect notifications
    pub name: String,
    /// Largest accepted frame payload
    pub max_frame_len: usize,
    /// How long `connect_and_wait` blocks
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub channel: ChannelConfig,
    pub recovery: RecoveryConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "link".to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
            channel: ChannelConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Create a default configuration with the given link name
    pub fn named<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Configuration optimized for testing
    pub fn testing<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            max_frame_len: 64 * 1024,
            connect_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::aggressive(),
            channel: ChannelConfig {
                handshake_timeout: Duration::from_secs(5),
            },
            recovery: RecoveryConfig::testing(),
        }
    }

    /// Validate link configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("link name must not be empty".to_string());
        }
        if self.max_frame_len == 0 {
            return Err("max_frame_len must be positive".to_string());
        }
        if self.heartbeat.incoming && self.heartbeat.threshold_failure_count == 0 {
            return Err("heartbeat threshold_failure_count must be positive".to_string());
        }
        if self.recovery.retransmission_window == 0 {
            return Err("retransmission_window must be positive".to_string());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Runtime Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration loaded by applications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub flow: FlowConfig,
    pub link: LinkConfig,
}

impl RuntimeConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.flow.frame_resolution.is_zero() {
            return Err("frame_resolution must be positive".to_string());
        }
        if self.flow.multi_thread_workers == 0 {
            return Err("multi_thread_workers must be positive".to_string());
        }
        self.link.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert_eq!(LinkConfig::default().heartbeat.threshold_failure_count, 3);
        assert_eq!(
            LinkConfig::default().recovery.recovery_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(FlowConfig::default().frame_resolution.as_micros(), 15_625);
    }

    #[test]
    fn test_invalid_link_config() {
        let mut config = LinkConfig::testing("t");
        config.heartbeat.threshold_failure_count = 0;
        assert!(config.validate().is_err());

        let config = LinkConfig::named("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_serialize_as_integers() {
        let config = ChannelConfig {
            handshake_timeout: Duration::from_millis(1500),
        };
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: ChannelConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
