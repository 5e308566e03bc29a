//! Transport wrapper.
//!
//! The embedding editor obtains its room connection from a [`TransportFactory`].
//! [`GatedFactory`] decorates any factory without changing that surface: every
//! connection it hands out carries a [`GatedSink`] that withholds `join`,
//! `diagram_update` and `cursor_update` while sync is off, and its event stream
//! feeds connection lifecycle into the shared [`SyncPolicy`] before the editor
//! sees the events.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::protocol::{classify, events, EventClass, JoinRequest, LeaveRequest};
use super::state::{DisconnectReason, JoinDecision, SyncPolicy, SyncState, ToggleOutcome};
use super::SyncConfig;

/// Events a transport delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect,
    Disconnect(DisconnectReason),
    ConnectError(String),
    /// Any named server event
    Message { event: String, payload: Value },
}

/// Outbound half of a room connection. Sends are fire-and-forget.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &str, payload: Value);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: &str, payload: Value) {
        (**self).emit(event, payload)
    }
}

/// A live room connection
pub struct Connection<S> {
    pub sink: S,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Options handed to a transport factory
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub namespace: String,
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
}

impl ConnectOptions {
    /// Full endpoint for the configured namespace
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.namespace)
    }
}

impl From<&SyncConfig> for ConnectOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            url: config.server_url.clone(),
            namespace: config.namespace.clone(),
            reconnection_attempts: config.reconnection_attempts,
            reconnection_delay: config.reconnection_delay(),
        }
    }
}

/// Creates room connections
pub trait TransportFactory: Send + Sync {
    type Sink: EventSink;

    /// Open a connection. Must be called from within a Tokio runtime.
    fn connect(&self, options: &ConnectOptions) -> Connection<Self::Sink>;
}

/// Decorator that gates every connection created by the inner factory
pub struct GatedFactory<F> {
    inner: F,
    policy: Arc<SyncPolicy>,
}

impl<F: TransportFactory> GatedFactory<F> {
    pub fn wrap(inner: F, policy: Arc<SyncPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &Arc<SyncPolicy> {
        &self.policy
    }
}

impl<F: TransportFactory> TransportFactory for GatedFactory<F> {
    type Sink = GatedSink<F::Sink>;

    fn connect(&self, options: &ConnectOptions) -> Connection<Self::Sink> {
        info!("Opening gated connection to {}", options.endpoint());

        let Connection { sink, mut events } = self.inner.connect(options);
        let sink = GatedSink {
            inner: Arc::new(sink),
            policy: self.policy.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let observer = sink.clone();

        // Ends when either side goes away, releasing the observer's sink
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            observer.observe(&event);
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!("Gated event forwarding ended");
        });

        Connection { sink, events: rx }
    }
}

/// Outbound sink that enforces the sync policy
pub struct GatedSink<S> {
    inner: Arc<S>,
    policy: Arc<SyncPolicy>,
}

impl<S> Clone for GatedSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S: EventSink> GatedSink<S> {
    pub fn policy(&self) -> &Arc<SyncPolicy> {
        &self.policy
    }

    /// Re-emit the pending join through the real transport, bypassing the gate
    pub fn force_join(&self) -> bool {
        match self.policy.pending_join() {
            Some(join) => {
                self.send_join(&join);
                true
            }
            None => false,
        }
    }

    /// Emit a leave for the last known room, bypassing the gate
    pub fn force_leave(&self) -> bool {
        match self.policy.last_room() {
            Some(room) => {
                info!("Leaving room: {}", room);
                match serde_json::to_value(LeaveRequest { room }) {
                    Ok(payload) => self.inner.emit(events::LEAVE, payload),
                    Err(e) => warn!("Failed to serialize leave: {}", e),
                }
                true
            }
            None => false,
        }
    }

    /// Toggle sync and send the join or leave that goes with it
    pub fn toggle_sync(&self) -> SyncState {
        match self.policy.toggle() {
            ToggleOutcome::Enabled { pending } => match pending {
                Some(join) => self.send_join(&join),
                None => debug!("Sync enabled before any join was requested"),
            },
            ToggleOutcome::Disabled { .. } => {
                self.force_leave();
            }
            ToggleOutcome::Ignored(_) => {}
        }
        self.policy.state()
    }

    fn send_join(&self, join: &JoinRequest) {
        info!("Executing delayed join for room: {}", join.room);
        match serde_json::to_value(join) {
            Ok(payload) => self.inner.emit(events::JOIN, payload),
            Err(e) => warn!("Failed to serialize join: {}", e),
        }
    }

    /// Feed a lifecycle event into the policy
    pub(crate) fn observe(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connect => {
                info!("Sync transport connected");
                if self.policy.on_connect() && self.policy.auto_join() {
                    self.toggle_sync();
                }
            }
            TransportEvent::Disconnect(reason) => self.policy.on_disconnect(reason),
            TransportEvent::ConnectError(message) => self.policy.on_connect_error(message),
            TransportEvent::Message { .. } => {}
        }
    }
}

impl<S: EventSink> EventSink for GatedSink<S> {
    fn emit(&self, event: &str, payload: Value) {
        match classify(event) {
            EventClass::Join => {
                let join = JoinRequest::from_payload(&payload);
                let room = join.room.clone();
                match self.policy.intercept_join(join) {
                    JoinDecision::Forward => {
                        info!("Sync on, joining room: {}", room);
                        self.inner.emit(event, payload);
                    }
                    JoinDecision::Deferred => {
                        debug!("Sync off, join for room {} withheld", room);
                        self.policy.refresh_status();
                    }
                    JoinDecision::Duplicate => {
                        debug!("Already joined room {}", room);
                    }
                }
            }
            EventClass::Sync => {
                if self.policy.is_enabled() {
                    self.inner.emit(event, payload);
                } else {
                    trace!("Sync off, dropped {}", event);
                }
            }
            EventClass::Passthrough => self.inner.emit(event, payload),
        }
    }
}
