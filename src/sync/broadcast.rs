//! Local broadcast gate.
//!
//! Same-process mirrors of the sync traffic (one "tab" talking to another
//! through a named channel) are subject to the same policy as the room
//! transport. Only posting is gated; receiving is always open.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::SyncPolicy;

/// Messages buffered per receiver before slow receivers start lagging
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct HubMessage {
    origin: Uuid,
    payload: Value,
}

/// Receiving end of a local channel. Never sees its own channel's posts.
pub struct ChannelReceiver {
    origin: Uuid,
    rx: broadcast::Receiver<HubMessage>,
}

impl ChannelReceiver {
    /// Next message from another channel, or `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.origin == self.origin => continue,
                Ok(message) => return Some(message.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Local channel receiver lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A named same-process broadcast channel
pub trait LocalChannel: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn post(&self, message: Value);
    fn subscribe(&self) -> ChannelReceiver;
}

/// Opens named local channels
pub trait ChannelFactory: Send + Sync {
    type Channel: LocalChannel;

    fn open(&self, name: &str) -> Self::Channel;

    /// Feature detection for embedders that probe before opening channels
    fn is_supported(&self) -> bool {
        true
    }
}

/// Process-wide registry of named channels
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<DashMap<String, broadcast::Sender<HubMessage>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl ChannelFactory for BroadcastHub {
    type Channel = HubChannel;

    fn open(&self, name: &str) -> HubChannel {
        let sender = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        HubChannel {
            name: name.to_string(),
            origin: Uuid::new_v4(),
            sender,
        }
    }
}

/// One participant's handle on a named hub channel
pub struct HubChannel {
    name: String,
    origin: Uuid,
    sender: broadcast::Sender<HubMessage>,
}

impl LocalChannel for HubChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: Value) {
        // No receivers is not an error for a broadcast
        let _ = self.sender.send(HubMessage {
            origin: self.origin,
            payload: message,
        });
    }

    fn subscribe(&self) -> ChannelReceiver {
        ChannelReceiver {
            origin: self.origin,
            rx: self.sender.subscribe(),
        }
    }
}

/// Channel factory decorator applying the sync policy to every channel it opens
pub struct GatedChannelFactory<F> {
    inner: F,
    policy: Arc<SyncPolicy>,
    opened: Mutex<Vec<String>>,
}

impl<F: ChannelFactory> GatedChannelFactory<F> {
    pub fn wrap(inner: F, policy: Arc<SyncPolicy>) -> Self {
        Self {
            inner,
            policy,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Names of every channel opened through this factory
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl<F: ChannelFactory> ChannelFactory for GatedChannelFactory<F> {
    type Channel = GatedChannel<F::Channel>;

    fn open(&self, name: &str) -> Self::Channel {
        debug!("Local channel opened: {}", name);
        self.opened.lock().push(name.to_string());
        GatedChannel {
            inner: self.inner.open(name),
            policy: self.policy.clone(),
        }
    }

    fn is_supported(&self) -> bool {
        self.inner.is_supported()
    }
}

/// Local channel whose posts pass only while sync is on
pub struct GatedChannel<C> {
    inner: C,
    policy: Arc<SyncPolicy>,
}

impl<C: LocalChannel> LocalChannel for GatedChannel<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn post(&self, message: Value) {
        if self.policy.is_enabled() {
            self.inner.post(message);
        } else {
            debug!("Local channel post blocked (sync off): {}", self.inner.name());
        }
    }

    fn subscribe(&self) -> ChannelReceiver {
        self.inner.subscribe()
    }
}
