//! Relay configuration
//!
//! Values only, no behavior: timeouts, retry bounds, unit sizes and cache
//! lifetimes for every component. Loaded from JSON by hosts and validated
//! before any component is built from it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::TAG_LEN;
use crate::transport::ble::wire::DATA_FRAME_OVERHEAD;

/// Largest MTU the relay will ever negotiate
pub const MAX_MTU: usize = 512;

/// Smallest MTU a BLE link is guaranteed to support
pub const MIN_MTU: usize = 23;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Invalid timeout {name}: must be > 0")]
    InvalidTimeout { name: String },

    #[error("Invalid retry bound {name}: must be 1-10, got {value}")]
    InvalidRetryBound { name: String, value: u32 },

    #[error("Invalid MTU: must be {MIN_MTU}-{MAX_MTU}, got {0}")]
    InvalidMtu(usize),

    #[error("Frame payload size {payload} plus {overhead} bytes of overhead exceeds MTU {mtu}")]
    FrameTooLarge {
        payload: usize,
        overhead: usize,
        mtu: usize,
    },

    #[error("Invalid chunk size {name}: must be > 0")]
    InvalidChunkSize { name: String },

    #[error("Sweep interval must not exceed the staleness threshold")]
    SweepSlowerThanStaleness,

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables for discovery, connection, transfer and key caching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a peer scan runs before stopping on its own
    pub discovery_timeout_ms: u64,
    /// Per-attempt connection timeout
    pub connection_timeout_ms: u64,
    /// Connection attempts before giving up
    pub connection_max_attempts: u32,
    /// Fixed delay between connection attempts
    pub connection_retry_delay_ms: u64,
    /// How long to wait for the ACK of a single frame
    pub ack_timeout_ms: u64,
    /// Send attempts per frame before the transfer fails
    pub frame_max_attempts: u32,
    /// How long the sender waits for the peer's receipt after the last ACK
    pub receipt_timeout_ms: u64,
    /// Idle time after which a session is swept
    pub session_stale_after_ms: u64,
    /// Period of the background sweep
    pub sweep_interval_ms: u64,
    /// MTU cap requested during connection
    pub mtu: usize,
    /// Plaintext bytes per BLE frame
    pub frame_payload_size: usize,
    /// Plaintext bytes per QR page
    pub qr_page_payload_size: usize,
    /// Progress sampling period while a transfer runs
    pub progress_interval_ms: u64,
    /// Lifetime of a cached peer key exchange
    pub key_cache_ttl_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            connection_max_attempts: 3,
            connection_retry_delay_ms: 1_000,
            ack_timeout_ms: 5_000,
            frame_max_attempts: 3,
            receipt_timeout_ms: 3_000,
            session_stale_after_ms: 10 * 60 * 1_000,
            sweep_interval_ms: 5 * 60 * 1_000,
            mtu: MAX_MTU,
            frame_payload_size: 256,
            qr_page_payload_size: 180,
            progress_interval_ms: 250,
            key_cache_ttl_ms: 5 * 60 * 1_000,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig =
            serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every field and the cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("receipt_timeout_ms", self.receipt_timeout_ms),
            ("session_stale_after_ms", self.session_stale_after_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("progress_interval_ms", self.progress_interval_ms),
            ("key_cache_ttl_ms", self.key_cache_ttl_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout {
                    name: name.to_string(),
                });
            }
        }

        let bounds = [
            ("connection_max_attempts", self.connection_max_attempts),
            ("frame_max_attempts", self.frame_max_attempts),
        ];
        for (name, value) in bounds {
            if !(1..=10).contains(&value) {
                return Err(ConfigError::InvalidRetryBound {
                    name: name.to_string(),
                    value,
                });
            }
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }

        if self.frame_payload_size == 0 {
            return Err(ConfigError::InvalidChunkSize {
                name: "frame_payload_size".to_string(),
            });
        }
        if self.qr_page_payload_size == 0 {
            return Err(ConfigError::InvalidChunkSize {
                name: "qr_page_payload_size".to_string(),
            });
        }

        let overhead = DATA_FRAME_OVERHEAD + TAG_LEN;
        if self.frame_payload_size + overhead > self.mtu {
            return Err(ConfigError::FrameTooLarge {
                payload: self.frame_payload_size,
                overhead,
                mtu: self.mtu,
            });
        }

        if self.sweep_interval_ms > self.session_stale_after_ms {
            return Err(ConfigError::SweepSlowerThanStaleness);
        }

        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn connection_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connection_retry_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RelayConfig {
            ack_timeout_ms: 0,
            ..RelayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                name: "ack_timeout_ms".to_string()
            })
        );
    }

    #[test]
    fn test_retry_bound_range() {
        let config = RelayConfig {
            frame_max_attempts: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryBound { value: 0, .. })
        ));

        let config = RelayConfig {
            connection_max_attempts: 11,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_must_fit_mtu() {
        let config = RelayConfig {
            mtu: 128,
            frame_payload_size: 100,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FrameTooLarge { mtu: 128, .. })
        ));

        let config = RelayConfig {
            mtu: 128,
            frame_payload_size: 128 - DATA_FRAME_OVERHEAD - TAG_LEN,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mtu_range() {
        let config = RelayConfig {
            mtu: 1024,
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu(1024)));
    }

    #[test]
    fn test_sweep_interval_bounded_by_staleness() {
        let config = RelayConfig {
            sweep_interval_ms: 20 * 60 * 1_000,
            ..RelayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SweepSlowerThanStaleness)
        );
    }

    #[test]
    fn test_json_partial_document_uses_defaults() {
        let config = RelayConfig::from_json(r#"{ "ack_timeout_ms": 750 }"#)
            .expect("Valid partial config");
        assert_eq!(config.ack_timeout_ms, 750);
        assert_eq!(config.frame_payload_size, 256);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RelayConfig::default();
        let json = config.to_json().expect("Serialize");
        let parsed = RelayConfig::from_json(&json).expect("Parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_invalid_rejected() {
        assert!(matches!(
            RelayConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
