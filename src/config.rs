//! Runtime configuration for every component of the sync core.
//!
//! All sub-configs implement [`Default`] with the product policy values, so a
//! caller only needs to override what differs. Configuration can also be read
//! from TOML where durations are written in milliseconds:
//!
//! ```toml
//! [connection]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_attempts = 5
//!
//! [reactions]
//! confirm_window_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Serde adapter: `Duration` stored as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Handshake, heartbeat, backoff and duplicate-session policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport handshake timeout for one attempt.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// First reconnection delay; doubles per attempt.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Ceiling for the reconnection delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Consecutive failures tolerated before the manager goes `Fatal`.
    pub max_attempts: u32,
    /// Extra random delay as a fraction of the computed delay (0.0 disables).
    pub jitter_ratio: f64,
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// A probe slower than this counts as a failure.
    #[serde(rename = "heartbeat_timeout_ms", with = "millis")]
    pub heartbeat_timeout: Duration,
    /// Grace period after a duplicate-login notice before logout is forced.
    #[serde(rename = "duplicate_session_countdown_ms", with = "millis")]
    pub duplicate_session_countdown: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter_ratio: 0.0,
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(5),
            duplicate_session_countdown: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Room setup
// ---------------------------------------------------------------------------

/// Per-step timeouts for `setup_room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    #[serde(rename = "connection_timeout_ms", with = "millis")]
    pub connection_timeout: Duration,
    #[serde(rename = "metadata_timeout_ms", with = "millis")]
    pub metadata_timeout: Duration,
    #[serde(rename = "join_timeout_ms", with = "millis")]
    pub join_timeout: Duration,
    #[serde(rename = "history_timeout_ms", with = "millis")]
    pub history_timeout: Duration,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(15),
            metadata_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(15),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Messages requested per history page.
    pub page_size: usize,
    /// Distance from the bottom edge (px) still treated as "at the bottom".
    pub bottom_threshold_px: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self { page_size: 50, bottom_threshold_px: 100.0 }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// A working entry idle for longer than this is discarded as failed.
    #[serde(rename = "stale_after_ms", with = "millis")]
    pub stale_after: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { stale_after: Duration::from_secs(120) }
    }
}

// ---------------------------------------------------------------------------
// Reactions / read receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionConfig {
    /// How long an optimistic change waits for server confirmation.
    #[serde(rename = "confirm_window_ms", with = "millis")]
    pub confirm_window: Duration,
    /// Minimum continuous visibility before a message is marked read.
    #[serde(rename = "read_dwell_ms", with = "millis")]
    pub read_dwell: Duration,
    /// Period of the room sweep that expires reactions, streams and emits reads.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            confirm_window: Duration::from_secs(5),
            read_dwell: Duration::from_millis(1_000),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Sessions idle for longer than this are expired.
    #[serde(rename = "inactivity_window_ms", with = "millis")]
    pub inactivity_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { inactivity_window: Duration::from_secs(30 * 60) }
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Top-level configuration handed to [`RoomSession`](crate::session::RoomSession).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub setup: SetupConfig,
    pub timeline: TimelineConfig,
    pub streaming: StreamingConfig,
    pub reactions: ReactionConfig,
    pub auth: AuthConfig,
}

impl SyncConfig {
    /// Parse a TOML document. Missing tables and keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: SyncConfig =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make a timer spin or a policy meaningless.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        let zero_checks = [
            ("connection.connect_timeout_ms", c.connect_timeout),
            ("connection.base_delay_ms", c.base_delay),
            ("connection.heartbeat_interval_ms", c.heartbeat_interval),
            ("connection.heartbeat_timeout_ms", c.heartbeat_timeout),
            ("reactions.sweep_interval_ms", self.reactions.sweep_interval),
        ];
        for (name, value) in zero_checks {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{name} must be greater than zero")));
            }
        }
        if c.max_delay < c.base_delay {
            return Err(SyncError::Config(
                "connection.max_delay_ms must be >= connection.base_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.jitter_ratio) {
            return Err(SyncError::Config("connection.jitter_ratio must be within 0.0..=1.0".into()));
        }
        if self.timeline.page_size == 0 {
            return Err(SyncError::Config("timeline.page_size must be greater than zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
