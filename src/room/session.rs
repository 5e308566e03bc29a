//! Room session: one editing surface bound to one room's event stream.
//!
//! The session runs as a single task. Local edits are coalesced behind one
//! debounce deadline and sent as full-buffer updates through the gated sink;
//! remote updates are written into the surface with the echo guard engaged so
//! the write is not mistaken for a local edit. Concurrent writers inside one
//! debounce window resolve as last-writer-wins.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::surface::EditingSurface;
use crate::sync::broadcast::{ChannelReceiver, LocalChannel};
use crate::sync::presence::{Presence, PresenceEvent};
use crate::sync::protocol::{
    events, CursorEvent, EditEvent, Envelope, InboundEvent, JoinRequest, RemoteUpdate,
};
use crate::sync::state::SyncState;
use crate::sync::transport::{EventSink, GatedSink, TransportEvent};
use crate::sync::{RoomId, SyncConfig};

enum SessionCommand {
    LocalChange,
    Bind(Arc<dyn EditingSurface>),
    Close,
}

/// Holds the echo flag for exactly one remote write
struct EchoGuard<'a>(&'a AtomicBool);

impl<'a> EchoGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for a room session
pub struct RoomSession<S> {
    room: RoomId,
    sink: GatedSink<S>,
    debounce: Duration,
    surface: Option<Arc<dyn EditingSurface>>,
    mirror: Option<Arc<dyn LocalChannel>>,
}

impl<S: EventSink> RoomSession<S> {
    pub fn new(room: impl Into<RoomId>, sink: GatedSink<S>, config: &SyncConfig) -> Self {
        Self {
            room: room.into(),
            sink,
            debounce: config.debounce(),
            surface: None,
            mirror: None,
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn EditingSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Mirror outbound updates to, and accept remote updates from, a local channel
    pub fn with_mirror(mut self, channel: Arc<dyn LocalChannel>) -> Self {
        self.mirror = Some(channel);
        self
    }

    /// Start the session task on the connection's event stream
    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> SessionHandle<S> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mirror_rx = self.mirror.as_ref().map(|channel| channel.subscribe());

        let mut worker = SessionWorker::new(
            self.room.clone(),
            self.sink.clone(),
            self.debounce,
            self.mirror,
            commands_tx.downgrade(),
        );
        match self.surface {
            Some(surface) => worker.bind(surface),
            None => warn!(
                "Room {} started without an editing surface, remote updates dropped until bound",
                self.room
            ),
        }

        let task = tokio::spawn(worker.run(commands_rx, events, mirror_rx));

        SessionHandle {
            room: self.room,
            sink: self.sink,
            commands: commands_tx,
            task,
        }
    }
}

/// Control handle for a running session. Dropping it ends the session.
pub struct SessionHandle<S> {
    room: RoomId,
    sink: GatedSink<S>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl<S: EventSink> SessionHandle<S> {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn state(&self) -> SyncState {
        self.sink.policy().state()
    }

    pub fn participants(&self) -> Option<usize> {
        self.sink.policy().participants()
    }

    /// The user's opt-in toggle
    pub fn toggle_sync(&self) -> SyncState {
        self.sink.toggle_sync()
    }

    /// Report a caret move to the room
    pub fn cursor_moved(&self, cursor: usize) {
        let event = CursorEvent {
            room: self.room.clone(),
            cursor,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.sink.emit(events::CURSOR_UPDATE, payload),
            Err(e) => warn!("Failed to serialize cursor update: {}", e),
        }
    }

    /// Bind (or replace) the editing surface. A replaced surface's edits are ignored.
    pub fn bind_surface(&self, surface: Arc<dyn EditingSurface>) {
        if self.commands.send(SessionCommand::Bind(surface)).is_err() {
            warn!("Session for room {} has ended, surface not bound", self.room);
        }
    }

    /// Leave the room and stop the session
    pub async fn close(self) {
        let _ = self.commands.send(SessionCommand::Close);
        if let Err(e) = self.task.await {
            warn!("Session task for room {} failed: {}", self.room, e);
        }
    }
}

struct SessionWorker<S> {
    room: RoomId,
    sink: GatedSink<S>,
    debounce: Duration,
    surface: Option<Arc<dyn EditingSurface>>,
    mirror: Option<Arc<dyn LocalChannel>>,
    echo_guard: Arc<AtomicBool>,
    /// Generation of the current surface binding
    binding: Arc<AtomicU64>,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
    presence: Presence,
    join_requested: bool,
    /// Text of the last applied remote update, consumed by the next flush
    remote_applied: Option<String>,
}

impl<S: EventSink> SessionWorker<S> {
    fn new(
        room: RoomId,
        sink: GatedSink<S>,
        debounce: Duration,
        mirror: Option<Arc<dyn LocalChannel>>,
        commands: mpsc::WeakUnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            room,
            sink,
            debounce,
            surface: None,
            mirror,
            echo_guard: Arc::new(AtomicBool::new(false)),
            binding: Arc::new(AtomicU64::new(0)),
            commands,
            presence: Presence::new(),
            join_requested: false,
            remote_applied: None,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut mirror_rx: Option<ChannelReceiver>,
    ) {
        let mut deadline: Option<Instant> = None;
        let mut events_open = true;
        let mut mirror_open = mirror_rx.is_some();

        loop {
            let at = deadline;
            let timer = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::LocalChange) => {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    Some(SessionCommand::Bind(surface)) => self.bind(surface),
                    Some(SessionCommand::Close) | None => {
                        self.leave();
                        break;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_transport(event),
                    None => {
                        info!("Transport for room {} closed", self.room);
                        events_open = false;
                    }
                },
                message = next_mirror(&mut mirror_rx), if mirror_open => match message {
                    Some(payload) => self.handle_mirror(payload),
                    None => mirror_open = false,
                },
                _ = timer => {
                    deadline = None;
                    self.flush();
                }
            }
        }

        debug!("Session for room {} ended", self.room);
    }

    fn bind(&mut self, surface: Arc<dyn EditingSurface>) {
        let generation = self.binding.fetch_add(1, Ordering::SeqCst) + 1;
        let binding = self.binding.clone();
        let guard = self.echo_guard.clone();
        let commands = self.commands.clone();
        surface.on_change(Box::new(move || {
            if guard.load(Ordering::SeqCst) || binding.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(SessionCommand::LocalChange);
            }
        }));

        if self.surface.replace(surface).is_some() {
            info!("Editing surface for room {} replaced", self.room);
        } else {
            info!("Editing surface bound to room {}", self.room);
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => self.request_join(),
            TransportEvent::Disconnect(reason) => {
                debug!("Room {} lost its connection: {}", self.room, reason);
                self.join_requested = false;
                self.remote_applied = None;
                self.presence.reset();
            }
            TransportEvent::ConnectError(_) => {}
            TransportEvent::Message { event, payload } => {
                match InboundEvent::decode(&event, payload) {
                    Ok(inbound) => self.handle_inbound(inbound),
                    Err(e) => warn!("Ignoring malformed {} in room {}: {}", event, self.room, e),
                }
            }
        }
    }

    fn handle_inbound(&mut self, inbound: InboundEvent) {
        if let Some(change) = PresenceEvent::from_inbound(&inbound) {
            debug!("Room {} now has {} participants", self.room, change.users_count());
            if self.presence.apply(change) {
                self.sink.policy().set_participants(change.users_count());
            }
            return;
        }

        match inbound {
            InboundEvent::Connected { sid } => {
                debug!("Server confirmed connection: {}", sid);
                self.presence.set_sid(sid);
            }
            InboundEvent::DiagramUpdate(update) => self.apply_remote(update),
            InboundEvent::CursorUpdate { cursor, from_sid } => {
                trace!("Remote cursor {:?} from {:?}", cursor, from_sid);
            }
            InboundEvent::Other { event, .. } => trace!("Unhandled event: {}", event),
            InboundEvent::UserJoined { .. } | InboundEvent::UserLeft { .. } => {}
        }
    }

    fn handle_mirror(&mut self, payload: Value) {
        let envelope: Envelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring malformed local channel message: {}", e);
                return;
            }
        };
        if envelope.event != events::DIAGRAM_UPDATE {
            trace!("Ignoring local channel event: {}", envelope.event);
            return;
        }
        match InboundEvent::decode(&envelope.event, envelope.data) {
            Ok(InboundEvent::DiagramUpdate(update)) => self.apply_remote(update),
            Ok(_) => {}
            Err(e) => warn!("Ignoring malformed local update: {}", e),
        }
    }

    /// Ask for the room once per connection; the gate decides whether it goes out
    fn request_join(&mut self) {
        if self.join_requested {
            debug!("Join for room {} already requested", self.room);
            return;
        }
        match serde_json::to_value(JoinRequest::new(self.room.clone())) {
            Ok(payload) => {
                self.sink.emit(events::JOIN, payload);
                self.join_requested = true;
            }
            Err(e) => warn!("Failed to serialize join: {}", e),
        }
    }

    fn apply_remote(&mut self, update: RemoteUpdate) {
        let Some(surface) = self.surface.clone() else {
            warn!("No editing surface for room {}, dropping remote update", self.room);
            return;
        };

        {
            let _guard = EchoGuard::engage(&self.echo_guard);
            surface.set_value(&update.text);
        }
        debug!("Applied remote update: {} chars", update.text.len());

        self.remote_applied = Some(update.text);
        surface.dispatch_change();
    }

    fn flush(&mut self) {
        let Some(surface) = self.surface.as_ref() else {
            return;
        };

        let text = surface.get_value();
        if self.remote_applied.take().as_deref() == Some(text.as_str()) {
            trace!("Room {} holds the last remote update, nothing to send", self.room);
            return;
        }

        let edit = EditEvent {
            room: self.room.clone(),
            text,
            cursor: surface.cursor(),
        };
        let payload = match serde_json::to_value(&edit) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize edit: {}", e);
                return;
            }
        };

        if self.sink.policy().is_enabled() {
            debug!("Update sent: {} chars", edit.text.len());
        }
        self.sink.emit(events::DIAGRAM_UPDATE, payload.clone());
        if let Some(mirror) = &self.mirror {
            mirror.post(json!({ "event": events::DIAGRAM_UPDATE, "data": payload }));
        }
    }

    fn leave(&mut self) {
        if self.sink.policy().state() == SyncState::On {
            self.sink.force_leave();
        }
    }
}

async fn next_mirror(rx: &mut Option<ChannelReceiver>) -> Option<Value> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::BufferSurface;
    use crate::sync::broadcast::{BroadcastHub, ChannelFactory, GatedChannelFactory};
    use crate::sync::state::{DisconnectReason, SyncPolicy};
    use crate::sync::transport::{ConnectOptions, Connection, GatedFactory, TransportFactory};
    use crate::testing::{settle, MockFactory, RecordingSink, RecordingStatus};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    struct Harness {
        handle: SessionHandle<RecordingSink>,
        recorded: RecordingSink,
        driver: mpsc::UnboundedSender<TransportEvent>,
        surface: Arc<BufferSurface>,
        status: Arc<RecordingStatus>,
        policy: Arc<SyncPolicy>,
    }

    fn harness_with(
        mirror: Option<Arc<dyn LocalChannel>>,
        policy: Option<Arc<SyncPolicy>>,
    ) -> Harness {
        let status = Arc::new(RecordingStatus::default());
        let policy = policy.unwrap_or_else(|| Arc::new(SyncPolicy::new(status.clone())));
        let config = SyncConfig::default();
        let (factory, driver, recorded) = MockFactory::new();
        let Connection { sink, events } =
            GatedFactory::wrap(factory, policy.clone()).connect(&ConnectOptions::from(&config));

        let surface = BufferSurface::new("");
        let mut session = RoomSession::new("abcxyz", sink, &config).with_surface(surface.clone());
        if let Some(mirror) = mirror {
            session = session.with_mirror(mirror);
        }

        Harness {
            handle: session.spawn(events),
            recorded,
            driver,
            surface,
            status,
            policy,
        }
    }

    fn harness() -> Harness {
        harness_with(None, None)
    }

    async fn connect(h: &Harness) {
        h.driver.send(TransportEvent::Connect).unwrap();
        settle().await;
    }

    async fn connect_and_enable(h: &Harness) {
        connect(h).await;
        assert_eq!(h.handle.toggle_sync(), SyncState::On);
    }

    fn remote(event: &str, payload: Value) -> TransportEvent {
        TransportEvent::Message {
            event: event.to_string(),
            payload,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_deferred_until_toggle() {
        let h = harness();
        connect(&h).await;

        assert_eq!(h.handle.state(), SyncState::Off);
        assert!(h.recorded.sent().is_empty());

        assert_eq!(h.handle.toggle_sync(), SyncState::On);
        assert_eq!(h.recorded.payloads("join"), vec![json!({"room": "abcxyz"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_edits() {
        let h = harness();
        connect_and_enable(&h).await;

        for text in ["@", "@s", "@st", "@sta", "@start"] {
            h.surface.edit(text);
            sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(h.recorded.count("diagram_update"), 0);

        sleep(Duration::from_millis(400)).await;

        let updates = h.recorded.payloads("diagram_update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["text"], json!("@start"));
        assert_eq!(updates[0]["room"], json!("abcxyz"));
        assert_eq!(updates[0]["cursor"], json!(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_send_separately() {
        let h = harness();
        connect_and_enable(&h).await;

        h.surface.edit("one");
        sleep(Duration::from_millis(500)).await;
        h.surface.edit("two");
        sleep(Duration::from_millis(500)).await;

        let texts: Vec<Value> = h
            .recorded
            .payloads("diagram_update")
            .into_iter()
            .map(|p| p["text"].clone())
            .collect();
        assert_eq!(texts, vec![json!("one"), json!("two")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_ending_on_sent_text_is_sent() {
        let h = harness();
        connect_and_enable(&h).await;

        h.surface.edit("abc");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.recorded.count("diagram_update"), 1);

        h.surface.edit("abcd");
        sleep(Duration::from_millis(50)).await;
        h.surface.edit("abc");
        sleep(Duration::from_millis(500)).await;

        let updates = h.recorded.payloads("diagram_update");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1]["text"], json!("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_text_resent_after_opting_in_again() {
        let h = harness();
        connect_and_enable(&h).await;

        h.surface.edit("abc");
        sleep(Duration::from_millis(500)).await;

        assert_eq!(h.handle.toggle_sync(), SyncState::Off);
        assert_eq!(h.handle.toggle_sync(), SyncState::On);
        h.surface.edit("abc");
        sleep(Duration::from_millis(500)).await;

        assert_eq!(h.recorded.count("diagram_update"), 2);
        assert_eq!(
            h.recorded.names(),
            vec!["join", "diagram_update", "leave", "join", "diagram_update"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_surface_is_ignored() {
        let h = harness();
        connect_and_enable(&h).await;

        let replacement = BufferSurface::new("");
        h.handle.bind_surface(replacement.clone());
        settle().await;

        h.surface.edit("stale");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.recorded.count("diagram_update"), 0);

        replacement.edit("fresh");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(
            h.recorded.payloads("diagram_update"),
            vec![json!({"room": "abcxyz", "text": "fresh", "cursor": 5})]
        );
    }

    /// Surface whose programmatic writes notify listeners, as an editor's input event would
    struct NotifyingSurface(Arc<BufferSurface>);

    impl EditingSurface for NotifyingSurface {
        fn get_value(&self) -> String {
            self.0.get_value()
        }

        fn set_value(&self, text: &str) {
            self.0.set_value(text);
            self.0.dispatch_change();
        }

        fn on_change(&self, handler: crate::room::ChangeHandler) {
            self.0.on_change(handler);
        }

        fn dispatch_change(&self) {
            self.0.dispatch_change();
        }
    }

    #[tokio::test]
    async fn test_echo_guard_suppresses_write_notification() {
        let policy = Arc::new(SyncPolicy::new(Arc::new(RecordingStatus::default())));
        let (factory, _driver, _recorded) = MockFactory::new();
        let Connection { sink, events: _events } = GatedFactory::wrap(factory, policy)
            .connect(&ConnectOptions::from(&SyncConfig::default()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = SessionWorker::new(
            "abcxyz".to_string(),
            sink,
            Duration::from_millis(300),
            None,
            tx.downgrade(),
        );
        let surface = Arc::new(NotifyingSurface(BufferSurface::new("")));
        worker.bind(surface.clone());

        // An unguarded write is an edit
        surface.set_value("typed");
        assert!(matches!(rx.try_recv(), Ok(SessionCommand::LocalChange)));
        assert!(rx.try_recv().is_err());

        worker.apply_remote(RemoteUpdate {
            text: "X".to_string(),
            cursor: None,
            from_sid: None,
        });

        assert_eq!(surface.get_value(), "X");
        assert!(!worker.echo_guard.load(Ordering::SeqCst));
        // Only the synthetic change notification gets through
        assert!(matches!(rx.try_recv(), Ok(SessionCommand::LocalChange)));
        assert!(rx.try_recv().is_err());
        assert_eq!(worker.remote_applied.as_deref(), Some("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifying_surface_remote_update_not_echoed() {
        let status = Arc::new(RecordingStatus::default());
        let policy = Arc::new(SyncPolicy::new(status));
        let config = SyncConfig::default();
        let (factory, driver, recorded) = MockFactory::new();
        let Connection { sink, events } =
            GatedFactory::wrap(factory, policy).connect(&ConnectOptions::from(&config));

        let buffer = BufferSurface::new("");
        let handle = RoomSession::new("abcxyz", sink, &config)
            .with_surface(Arc::new(NotifyingSurface(buffer.clone())))
            .spawn(events);

        driver.send(TransportEvent::Connect).unwrap();
        settle().await;
        handle.toggle_sync();

        driver
            .send(remote("diagram_update", json!({"text": "remote"})))
            .unwrap();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(buffer.get_value(), "remote");
        assert_eq!(recorded.names(), vec!["join"]);

        buffer.edit("remote, edited");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(recorded.count("diagram_update"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_update_is_not_echoed() {
        let h = harness();
        connect_and_enable(&h).await;

        let rendered = Arc::new(AtomicUsize::new(0));
        let counter = rendered.clone();
        h.surface.on_change(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        h.driver
            .send(remote("diagram_update", json!({"text": "X", "cursor": null})))
            .unwrap();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(h.surface.get_value(), "X");
        assert_eq!(rendered.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorded.count("diagram_update"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_edit_after_remote_update_is_sent() {
        let h = harness();
        connect_and_enable(&h).await;

        h.driver
            .send(remote("diagram_update", json!({"text": "X"})))
            .unwrap();
        sleep(Duration::from_secs(1)).await;

        h.surface.edit("XY");
        sleep(Duration::from_secs(1)).await;

        let updates = h.recorded.payloads("diagram_update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["text"], json!("XY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_update_is_ignored() {
        let h = harness();
        connect_and_enable(&h).await;
        h.surface.set_value("keep me");

        h.driver
            .send(remote("diagram_update", json!({"cursor": 3})))
            .unwrap();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(h.surface.get_value(), "keep me");
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_stay_local_while_off() {
        let h = harness();
        connect(&h).await;

        h.surface.edit("solo");
        sleep(Duration::from_secs(1)).await;
        assert!(h.recorded.sent().is_empty());

        // Turning sync on later still delivers the buffer on the next edit
        h.handle.toggle_sync();
        h.surface.edit("solo!");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.recorded.payloads("diagram_update")[0]["text"], json!("solo!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_counts_render() {
        let h = harness();
        connect_and_enable(&h).await;

        h.driver
            .send(remote("user_joined", json!({"sid": "s2", "users_count": 2})))
            .unwrap();
        h.driver
            .send(remote("user_left", json!({"sid": "s2"})))
            .unwrap();
        settle().await;

        assert_eq!(h.handle.participants(), Some(2));
        assert_eq!(
            h.status.renders().last(),
            Some(&(SyncState::On, Some(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_leave_when_on() {
        let h = harness();
        connect_and_enable(&h).await;

        let recorded = h.recorded.clone();
        h.handle.close().await;

        assert_eq!(recorded.names(), vec!["join", "leave"]);
        assert_eq!(recorded.payloads("leave"), vec![json!({"room": "abcxyz"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_off_sends_nothing() {
        let h = harness();
        connect(&h).await;

        let recorded = h.recorded.clone();
        h.handle.close().await;
        assert!(recorded.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_reconnect() {
        let h = harness();
        connect_and_enable(&h).await;

        h.driver
            .send(TransportEvent::Disconnect(DisconnectReason::PingTimeout))
            .unwrap();
        settle().await;
        assert_eq!(h.policy.state(), SyncState::Connecting);

        connect(&h).await;
        assert_eq!(h.policy.state(), SyncState::Off);
        assert_eq!(h.recorded.count("join"), 1);

        h.handle.toggle_sync();
        assert_eq!(h.recorded.count("join"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_updates_are_gated() {
        let h = harness();
        connect(&h).await;

        h.handle.cursor_moved(4);
        assert_eq!(h.recorded.count("cursor_update"), 0);

        h.handle.toggle_sync();
        h.handle.cursor_moved(5);
        assert_eq!(
            h.recorded.payloads("cursor_update"),
            vec![json!({"room": "abcxyz", "cursor": 5})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_surface_binding() {
        let status = Arc::new(RecordingStatus::default());
        let policy = Arc::new(SyncPolicy::new(status));
        let config = SyncConfig::default();
        let (factory, driver, _recorded) = MockFactory::new();
        let Connection { sink, events } =
            GatedFactory::wrap(factory, policy.clone()).connect(&ConnectOptions::from(&config));
        let handle = RoomSession::new("abcxyz", sink, &config).spawn(events);

        driver.send(TransportEvent::Connect).unwrap();
        driver
            .send(remote("diagram_update", json!({"text": "lost"})))
            .unwrap();
        settle().await;
        assert_eq!(handle.state(), SyncState::Off);

        let surface = BufferSurface::new("");
        handle.bind_surface(surface.clone());
        settle().await;
        driver
            .send(remote("diagram_update", json!({"text": "kept"})))
            .unwrap();
        settle().await;

        assert_eq!(surface.get_value(), "kept");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_parity_with_transport() {
        let hub = BroadcastHub::new();
        let status = Arc::new(RecordingStatus::default());
        let policy = Arc::new(SyncPolicy::new(status));
        let gated_channels = GatedChannelFactory::wrap(hub.clone(), policy.clone());

        let mirror: Arc<dyn LocalChannel> = Arc::new(gated_channels.open("plantuml-sync:abcxyz"));
        let other_tab = hub.open("plantuml-sync:abcxyz");
        let mut other_rx = other_tab.subscribe();

        let h = harness_with(Some(mirror), Some(policy));
        connect_and_enable(&h).await;

        h.surface.edit("shared");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.recorded.count("diagram_update"), 1);
        let mirrored = other_rx.recv().await.unwrap();
        assert_eq!(mirrored["event"], json!("diagram_update"));
        assert_eq!(mirrored["data"]["text"], json!("shared"));

        h.handle.toggle_sync();
        h.surface.edit("private");
        sleep(Duration::from_secs(1)).await;

        assert_eq!(h.recorded.count("diagram_update"), 1);
        let leaked = tokio::time::timeout(Duration::from_secs(1), other_rx.recv()).await;
        assert!(leaked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_inbound_applies_update() {
        let hub = BroadcastHub::new();
        let status = Arc::new(RecordingStatus::default());
        let policy = Arc::new(SyncPolicy::new(status));
        let gated_channels = GatedChannelFactory::wrap(hub.clone(), policy.clone());
        let mirror: Arc<dyn LocalChannel> = Arc::new(gated_channels.open("room"));
        let other_tab = hub.open("room");

        let h = harness_with(Some(mirror), Some(policy));
        connect(&h).await;

        other_tab.post(json!({"event": "diagram_update", "data": {"text": "from tab"}}));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(h.surface.get_value(), "from tab");
        assert!(h.recorded.sent().is_empty());
    }
}
