//! Presence tracking for a room session.
//!
//! The room server only reports how many participants a room holds, so presence
//! here is a count plus the session id the server assigned to this client.

use serde::{Deserialize, Serialize};

use super::protocol::InboundEvent;
use super::SessionId;

/// Presence change derived from an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Joined { users_count: usize },
    Left { users_count: usize },
}

impl PresenceEvent {
    pub fn from_inbound(event: &InboundEvent) -> Option<Self> {
        match event {
            InboundEvent::UserJoined { users_count } => Some(PresenceEvent::Joined {
                users_count: *users_count,
            }),
            InboundEvent::UserLeft { users_count } => Some(PresenceEvent::Left {
                users_count: *users_count,
            }),
            _ => None,
        }
    }

    pub fn users_count(&self) -> usize {
        match self {
            PresenceEvent::Joined { users_count } | PresenceEvent::Left { users_count } => {
                *users_count
            }
        }
    }
}

/// Presence state of the room this client is in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Presence {
    /// Session id from the server's `connected` event
    pub sid: Option<SessionId>,
    /// Server-reported participant count, unknown until the first report
    pub participants: Option<usize>,
    /// Last presence change (milliseconds since epoch)
    pub updated_at_ms: Option<i64>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sid(&mut self, sid: impl Into<SessionId>) {
        self.sid = Some(sid.into());
    }

    /// Apply a presence event. Returns true if the count changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        let count = event.users_count();
        if self.participants == Some(count) {
            return false;
        }
        self.participants = Some(count);
        self.updated_at_ms = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    /// Forget connection-scoped data after a disconnect
    pub fn reset(&mut self) {
        self.sid = None;
    }
}
