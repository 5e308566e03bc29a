//! Sync state machine and the shared opt-in policy.
//!
//! `SyncPolicy` is the single source of truth consulted by the transport gate,
//! the local broadcast gate and the room session. States move as follows:
//!
//! ```text
//! connecting --connect--> off --toggle--> on
//!     |                    ^  <--toggle--  |
//!     +--connect_error--> unavailable <----+-- terminal disconnect
//! ```
//!
//! There is no edge into `on` except from `off`, so opt-in is never implicit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::protocol::JoinRequest;
use super::RoomId;

/// Connection and opt-in lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Room server unreachable; toggle disabled
    Unavailable,
    /// Waiting for the transport to connect
    Connecting,
    /// Connected, sync traffic withheld
    Off,
    /// Connected and opted in
    On,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unavailable => "unavailable",
            SyncState::Connecting => "connecting",
            SyncState::Off => "off",
            SyncState::On => "on",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the transport dropped its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection
    ServerDisconnect,
    /// The local side closed the connection
    ClientDisconnect,
    /// The underlying connection was closed
    TransportClose,
    /// The underlying connection failed
    TransportError,
    /// The server stopped answering heartbeats
    PingTimeout,
    Other(String),
}

impl DisconnectReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "io server disconnect" => DisconnectReason::ServerDisconnect,
            "io client disconnect" => DisconnectReason::ClientDisconnect,
            "transport close" => DisconnectReason::TransportClose,
            "transport error" => DisconnectReason::TransportError,
            "ping timeout" => DisconnectReason::PingTimeout,
            other => DisconnectReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::ServerDisconnect => "io server disconnect",
            DisconnectReason::ClientDisconnect => "io client disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::Other(reason) => reason,
        }
    }

    /// Terminal reasons make the service unavailable; the rest are retried by the transport
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ServerDisconnect | DisconnectReason::TransportClose
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one operation the core calls on the status UI.
///
/// Invoked after every state transition and every participant-count change.
pub trait StatusSurface: Send + Sync {
    fn render(&self, state: SyncState, participants: Option<usize>);
}

/// Point-in-time status as published by [`StatusChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: SyncState,
    pub participants: Option<usize>,
}

/// Status surface backed by a watch channel
pub struct StatusChannel {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusChannel {
    pub fn new() -> (Self, watch::Receiver<StatusSnapshot>) {
        let (tx, rx) = watch::channel(StatusSnapshot {
            state: SyncState::Connecting,
            participants: None,
        });
        (Self { tx }, rx)
    }
}

impl StatusSurface for StatusChannel {
    fn render(&self, state: SyncState, participants: Option<usize>) {
        self.tx.send_replace(StatusSnapshot {
            state,
            participants,
        });
    }
}

/// Presentation of a state for toggle-style status widgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub label: &'static str,
    pub indicator_class: String,
    pub toggle_enabled: bool,
    pub toggle_title: &'static str,
}

impl StatusView {
    pub fn new(state: SyncState, css_prefix: &str) -> Self {
        let (label, toggle_enabled, toggle_title) = match state {
            SyncState::Unavailable => ("Sync: Unavailable", false, "Sync service not available"),
            SyncState::Connecting => (
                "Sync: Connecting...",
                false,
                "Connecting to sync service...",
            ),
            SyncState::Off => ("Sync: Off", true, "Click to enable collaboration sync"),
            SyncState::On => ("Sync: On", true, "Click to disable collaboration sync"),
        };

        Self {
            label,
            indicator_class: format!("{}-{}", css_prefix, state),
            toggle_enabled,
            toggle_title,
        }
    }
}

/// Result of a toggle request
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleOutcome {
    /// Sync turned on; the pending join (if any) must now be sent
    Enabled { pending: Option<JoinRequest> },
    /// Sync turned off; a leave for `room` (if known) must now be sent
    Disabled { room: Option<RoomId> },
    /// Toggle not allowed in this state
    Ignored(SyncState),
}

/// What the gate does with an intercepted join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Forward,
    Deferred,
    /// Already joined this room since sync was turned on
    Duplicate,
}

#[derive(Debug)]
struct PolicyInner {
    enabled: bool,
    state: SyncState,
    pending_join: Option<JoinRequest>,
    joined_room: Option<RoomId>,
    last_room: Option<RoomId>,
    participants: Option<usize>,
}

impl PolicyInner {
    /// Move to `to`, keeping `enabled` equal to `state == On`
    fn transition(&mut self, to: SyncState) -> bool {
        if self.state == to {
            return false;
        }
        debug!("Sync state {} -> {}", self.state, to);
        self.state = to;
        self.enabled = to == SyncState::On;
        if !self.enabled {
            self.joined_room = None;
        }
        true
    }

    fn snapshot(&self) -> (SyncState, Option<usize>) {
        (self.state, self.participants)
    }
}

/// Process-wide opt-in policy shared by every outbound path
pub struct SyncPolicy {
    inner: Mutex<PolicyInner>,
    status: Arc<dyn StatusSurface>,
    auto_join: bool,
}

impl SyncPolicy {
    pub fn new(status: Arc<dyn StatusSurface>) -> Self {
        let policy = Self {
            inner: Mutex::new(PolicyInner {
                enabled: false,
                state: SyncState::Connecting,
                pending_join: None,
                joined_room: None,
                last_room: None,
                participants: None,
            }),
            status,
            auto_join: false,
        };
        policy.refresh_status();
        policy
    }

    pub fn with_auto_join(mut self, auto_join: bool) -> Self {
        self.auto_join = auto_join;
        self
    }

    pub fn auto_join(&self) -> bool {
        self.auto_join
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// Whether sync traffic may currently leave this process
    pub fn is_enabled(&self) -> bool {
        let inner = self.inner.lock();
        inner.enabled && inner.state == SyncState::On
    }

    pub fn pending_join(&self) -> Option<JoinRequest> {
        self.inner.lock().pending_join.clone()
    }

    pub fn last_room(&self) -> Option<RoomId> {
        self.inner.lock().last_room.clone()
    }

    pub fn participants(&self) -> Option<usize> {
        self.inner.lock().participants
    }

    /// Flip sync on or off. The only user-driven mutation of the policy.
    pub fn toggle(&self) -> ToggleOutcome {
        let (outcome, render) = {
            let mut inner = self.inner.lock();
            match inner.state {
                SyncState::Off => {
                    inner.transition(SyncState::On);
                    inner.joined_room = inner.pending_join.as_ref().map(|j| j.room.clone());
                    let outcome = ToggleOutcome::Enabled {
                        pending: inner.pending_join.clone(),
                    };
                    (outcome, Some(inner.snapshot()))
                }
                SyncState::On => {
                    inner.transition(SyncState::Off);
                    let outcome = ToggleOutcome::Disabled {
                        room: inner.last_room.clone(),
                    };
                    (outcome, Some(inner.snapshot()))
                }
                state => (ToggleOutcome::Ignored(state), None),
            }
        };

        match &outcome {
            ToggleOutcome::Enabled { .. } => info!("Sync enabled"),
            ToggleOutcome::Disabled { .. } => info!("Sync disabled"),
            ToggleOutcome::Ignored(state) => info!("Cannot toggle sync while {}", state),
        }
        self.render(render);
        outcome
    }

    /// Re-render the current state
    pub fn refresh_status(&self) {
        let snapshot = self.inner.lock().snapshot();
        self.render(Some(snapshot));
    }

    /// Transport connected. Returns true if this moved the policy to `off`.
    pub(crate) fn on_connect(&self) -> bool {
        let render = {
            let mut inner = self.inner.lock();
            match inner.state {
                SyncState::Connecting | SyncState::Unavailable => {
                    inner.transition(SyncState::Off);
                    Some(inner.snapshot())
                }
                _ => None,
            }
        };
        let changed = render.is_some();
        self.render(render);
        changed
    }

    pub(crate) fn on_connect_error(&self, message: &str) {
        warn!("Sync transport connection error: {}", message);
        let render = {
            let mut inner = self.inner.lock();
            inner
                .transition(SyncState::Unavailable)
                .then(|| inner.snapshot())
        };
        self.render(render);
    }

    pub(crate) fn on_disconnect(&self, reason: &DisconnectReason) {
        let render = {
            let mut inner = self.inner.lock();
            let to = if reason.is_terminal() || inner.state == SyncState::Unavailable {
                SyncState::Unavailable
            } else {
                SyncState::Connecting
            };
            inner.transition(to).then(|| inner.snapshot())
        };
        if reason.is_terminal() {
            warn!("Sync transport disconnected: {}", reason);
        } else {
            info!("Sync transport disconnected: {}, waiting for reconnect", reason);
        }
        self.render(render);
    }

    /// Record an intercepted join and decide whether it may pass
    pub(crate) fn intercept_join(&self, join: JoinRequest) -> JoinDecision {
        let mut inner = self.inner.lock();
        let room = join.room.clone();
        inner.last_room = Some(room.clone());
        inner.pending_join = Some(join);

        if !(inner.enabled && inner.state == SyncState::On) {
            return JoinDecision::Deferred;
        }
        if inner.joined_room.as_deref() == Some(room.as_str()) {
            return JoinDecision::Duplicate;
        }
        inner.joined_room = Some(room);
        JoinDecision::Forward
    }

    /// Update the server-reported participant count
    pub(crate) fn set_participants(&self, count: usize) {
        let render = {
            let mut inner = self.inner.lock();
            if inner.participants == Some(count) {
                None
            } else {
                inner.participants = Some(count);
                Some(inner.snapshot())
            }
        };
        self.render(render);
    }

    fn render(&self, snapshot: Option<(SyncState, Option<usize>)>) {
        if let Some((state, participants)) = snapshot {
            self.status.render(state, participants);
        }
    }
}

impl fmt::Debug for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPolicy")
            .field("inner", &*self.inner.lock())
            .field("auto_join", &self.auto_join)
            .finish()
    }
}
