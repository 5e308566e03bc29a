//! Shared fakes for unit tests.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::sync::state::{StatusSurface, SyncState};
use crate::sync::transport::{
    ConnectOptions, Connection, EventSink, TransportEvent, TransportFactory,
};

/// Sink that records every emitted event
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent.lock().iter().filter(|(name, _)| name == event).count()
    }

    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.sent.lock().push((event.to_string(), payload));
    }
}

/// Factory handing out a single scripted connection
pub struct MockFactory {
    sink: RecordingSink,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockFactory {
    /// Returns the factory, the driver for inbound events and the recording sink
    pub fn new() -> (Self, mpsc::UnboundedSender<TransportEvent>, RecordingSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecordingSink::default();
        let factory = Self {
            sink: sink.clone(),
            events: Mutex::new(Some(rx)),
        };
        (factory, tx, sink)
    }
}

impl TransportFactory for MockFactory {
    type Sink = RecordingSink;

    fn connect(&self, _options: &ConnectOptions) -> Connection<RecordingSink> {
        let events = self.events.lock().take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        });
        Connection {
            sink: self.sink.clone(),
            events,
        }
    }
}

/// Status surface that records every render call
#[derive(Default)]
pub struct RecordingStatus {
    renders: Mutex<Vec<(SyncState, Option<usize>)>>,
}

impl RecordingStatus {
    pub fn renders(&self) -> Vec<(SyncState, Option<usize>)> {
        self.renders.lock().clone()
    }

    /// Rendered states with consecutive repeats collapsed
    pub fn states(&self) -> Vec<SyncState> {
        let mut states: Vec<SyncState> = self.renders.lock().iter().map(|(s, _)| *s).collect();
        states.dedup();
        states
    }
}

impl StatusSurface for RecordingStatus {
    fn render(&self, state: SyncState, participants: Option<usize>) {
        self.renders.lock().push((state, participants));
    }
}

/// Let spawned tasks drain their queues
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
