//! Page-level entry point for the collaboration layer.
//!
//! The layer is strictly opt-in twice over: a page without a room parameter
//! gets no connection at all, and a page with one still keeps its edits local
//! until the user turns sync on.

use std::sync::Arc;
use tracing::info;

use crate::room::{room_from_url, RoomSession, SessionHandle};
use crate::sync::broadcast::{BroadcastHub, ChannelFactory, GatedChannelFactory, LocalChannel};
use crate::sync::transport::{
    ConnectOptions, Connection, EventSink, GatedFactory, TransportFactory,
};
use crate::sync::{RoomId, StatusSurface, SyncConfig, SyncPolicy, SyncState};

/// Running layer for one page
pub enum CollabLayer<S> {
    /// No room in the page URL: no transport, no policy traffic
    Inert,
    Active(ActiveLayer<S>),
}

pub struct ActiveLayer<S> {
    pub room: RoomId,
    pub policy: Arc<SyncPolicy>,
    pub session: SessionHandle<S>,
    /// Name of the local mirror channel, if one was opened
    pub channel: Option<String>,
}

/// Local mirror channel name for a room
pub fn channel_name(namespace: &str, room: &str) -> String {
    format!("{}:{}", namespace.trim_start_matches('/'), room)
}

impl<S: EventSink> CollabLayer<S> {
    /// Resolve the room from `page_url` and, if there is one, connect through the gate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(
        page_url: &str,
        config: &SyncConfig,
        factory: F,
        status: Arc<dyn StatusSurface>,
        hub: Option<&BroadcastHub>,
    ) -> Self
    where
        F: TransportFactory<Sink = S>,
    {
        let Some(room) = room_from_url(page_url, &config.room_param) else {
            info!(
                "No '{}' parameter in page URL, collaboration stays inactive",
                config.room_param
            );
            return CollabLayer::Inert;
        };

        info!("Collaboration available for room {}", room);
        let policy = Arc::new(SyncPolicy::new(status).with_auto_join(config.auto_join));

        let Connection { sink, events } =
            GatedFactory::wrap(factory, policy.clone()).connect(&ConnectOptions::from(config));

        let mut session = RoomSession::new(room.clone(), sink, config);
        let mut channel = None;
        if let Some(hub) = hub {
            let channels = GatedChannelFactory::wrap(hub.clone(), policy.clone());
            let mirror = channels.open(&channel_name(&config.namespace, &room));
            channel = Some(mirror.name().to_string());
            session = session.with_mirror(Arc::new(mirror));
        }

        CollabLayer::Active(ActiveLayer {
            room,
            policy,
            session: session.spawn(events),
            channel,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CollabLayer::Active(_))
    }

    pub fn session(&self) -> Option<&SessionHandle<S>> {
        match self {
            CollabLayer::Active(layer) => Some(&layer.session),
            CollabLayer::Inert => None,
        }
    }

    /// Current sync state, `None` when inert
    pub fn state(&self) -> Option<SyncState> {
        self.session().map(|session| session.state())
    }

    pub fn toggle_sync(&self) -> Option<SyncState> {
        self.session().map(|session| session.toggle_sync())
    }

    /// Leave the room (if joined) and stop the session
    pub async fn shutdown(self) {
        if let CollabLayer::Active(layer) = self {
            info!("Shutting down collaboration for room {}", layer.room);
            layer.session.close().await;
        }
    }
}
