//! Signaling server configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; every value can also be injected from a `HashMap` for tests.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use media_engine::{MediaKind, RtpCodecCapability};
use thiserror::Error;

/// Default TCP bind address for the signaling listener.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default deadline for a freshly connected peer to initialize its device.
pub const DEFAULT_DEVICE_READY_TIMEOUT_SECONDS: u64 = 30;

/// Default per-attempt timeout for the engine-side transport connect.
pub const DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Default member capacity per room.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 64;

/// Default server instance ID prefix.
pub const DEFAULT_SERVER_ID_PREFIX: &str = "signal";

/// Signaling server configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling listener bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Seconds a connected peer may take to initialize its device before
    /// the connection is failed (default: 30).
    pub device_ready_timeout_seconds: u64,

    /// Seconds one engine-side transport connect attempt may take before
    /// the peer is failed (default: 10).
    pub transport_connect_timeout_seconds: u64,

    /// Maximum members per room (default: 64).
    pub max_peers_per_room: usize,

    /// Unique identifier for this server instance.
    pub server_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SIGNAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let device_ready_timeout_seconds = parse_var(
            vars,
            "SIGNAL_DEVICE_READY_TIMEOUT_SECONDS",
            DEFAULT_DEVICE_READY_TIMEOUT_SECONDS,
        )?;

        let transport_connect_timeout_seconds = parse_var(
            vars,
            "SIGNAL_TRANSPORT_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS,
        )?;

        let max_peers_per_room =
            parse_var(vars, "SIGNAL_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;

        // Generate server instance ID
        let server_id = vars.get("SIGNAL_SERVER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            device_ready_timeout_seconds,
            transport_connect_timeout_seconds,
            max_peers_per_room,
            server_id,
        })
    }

    /// Device-ready deadline as a [`Duration`].
    #[must_use]
    pub fn device_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.device_ready_timeout_seconds)
    }

    /// Transport-connect timeout as a [`Duration`].
    #[must_use]
    pub fn transport_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_connect_timeout_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.clone(),
        }),
    }
}

/// Media codecs the global router is created with: Opus audio and VP8 video,
/// matching the reference deployment.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
        },
    ]
}
