//! Configuration system.
//!
//! Loads session configuration from JSON strings (file IO left to app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::TransportMode;

/// Root configuration for one heartbeat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transport used by both roles.
    #[serde(default)]
    pub mode: TransportMode,
    /// Listening role address, e.g. `127.0.0.1:4950`. `None` disables the role.
    #[serde(default = "default_addr")]
    pub listen_addr: Option<String>,
    /// Initiating role target address. `None` disables the role.
    #[serde(default = "default_addr")]
    pub peer_addr: Option<String>,
    /// Heartbeat period in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Host frame rate.
    #[serde(default = "default_frame_hz")]
    pub frame_hz: u32,
}

fn default_addr() -> Option<String> {
    Some("127.0.0.1:4950".to_string())
}

fn default_period_ms() -> u64 {
    1000
}

fn default_frame_hz() -> u32 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            listen_addr: default_addr(),
            peer_addr: default_addr(),
            period_ms: default_period_ms(),
            frame_hz: default_frame_hz(),
        }
    }
}

impl SessionConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Duration of one host frame. Falls back to 60 Hz when `frame_hz` is zero.
    pub fn frame_interval(&self) -> Duration {
        let hz = if self.frame_hz == 0 { 60 } else { self.frame_hz };
        Duration::from_secs_f64(1.0 / hz as f64)
    }
}
