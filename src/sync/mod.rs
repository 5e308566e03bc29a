//! Opt-in synchronization core.
//!
//! This module gates an always-on room transport behind an explicit user toggle.
//! It provides:
//! - Room event vocabulary and JSON envelope codec
//! - The sync state machine and the shared policy consulted by every sender
//! - A decorator for transport factories that intercepts outbound traffic
//! - The same gate applied to in-process cross-tab broadcast channels
//! - Presence tracking and a WebSocket transport

pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod ws;

pub use state::{StatusSurface, SyncPolicy, SyncState};
pub use transport::{GatedFactory, GatedSink};

use std::time::Duration;

/// Server-side grouping key for participants sharing one buffer
pub type RoomId = String;

/// Session id assigned by the room server on connect
pub type SessionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while setting up or running the sync layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration for {key}: {message}")]
    Config { key: &'static str, message: String },
}

/// Configuration for the collaboration layer
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Room server base URL (ws:// or wss://)
    pub server_url: String,
    /// Logical channel grouping on the room server
    pub namespace: String,
    /// Idle time after the last local change before an update is sent
    pub debounce_ms: u64,
    /// URL query key carrying the room id
    pub room_param: String,
    /// Id/class namespace for status UI
    pub css_prefix: String,
    /// Skip the explicit opt-in and enable sync as soon as the transport connects
    pub auto_join: bool,
    /// Consecutive failed connection attempts before the transport gives up
    pub reconnection_attempts: u32,
    /// Fixed delay between connection attempts
    pub reconnection_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:5001".to_string(),
            namespace: "/plantuml-sync".to_string(),
            debounce_ms: 300,
            room_param: "collab".to_string(),
            css_prefix: "sync-control".to_string(),
            auto_join: false,
            reconnection_attempts: 10,
            reconnection_delay_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `COLLAB_*` environment variables
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            server_url: lookup("COLLAB_SERVER_URL").unwrap_or(defaults.server_url),
            namespace: lookup("COLLAB_NAMESPACE").unwrap_or(defaults.namespace),
            debounce_ms: parse_var(&lookup, "COLLAB_DEBOUNCE_MS", defaults.debounce_ms)?,
            room_param: lookup("COLLAB_ROOM_PARAM").unwrap_or(defaults.room_param),
            css_prefix: lookup("COLLAB_CSS_PREFIX").unwrap_or(defaults.css_prefix),
            auto_join: parse_var(&lookup, "COLLAB_AUTO_JOIN", defaults.auto_join)?,
            reconnection_attempts: parse_var(
                &lookup,
                "COLLAB_RECONNECT_ATTEMPTS",
                defaults.reconnection_attempts,
            )?,
            reconnection_delay_ms: parse_var(
                &lookup,
                "COLLAB_RECONNECT_DELAY_MS",
                defaults.reconnection_delay_ms,
            )?,
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_room_param(mut self, param: impl Into<String>) -> Self {
        self.room_param = param.into();
        self
    }

    pub fn with_auto_join(mut self, auto_join: bool) -> Self {
        self.auto_join = auto_join;
        self
    }

    pub fn with_reconnection(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.reconnection_attempts = attempts;
        self.reconnection_delay_ms = delay_ms;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> SyncResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| SyncError::Config {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
