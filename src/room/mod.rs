//! Room module: binding an editing surface to one room.
//!
//! This module handles:
//! - Resolving the room id from the page URL
//! - Generating room ids and share URLs
//! - The editing-surface contract and an in-memory surface
//! - The per-room session (debounce, echo suppression, presence)

mod session;
mod surface;

pub use session::{RoomSession, SessionHandle};
pub use surface::{BufferSurface, ChangeHandler, EditingSurface};

use rand::Rng;
use reqwest::Url;

use crate::sync::{RoomId, SyncError, SyncResult};

/// Length of generated room ids
const ROOM_ID_LEN: usize = 6;

const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Read the room id from the page URL's query string.
///
/// `None` means no collaboration for this page, which is a normal mode.
pub fn room_from_url(page_url: &str, param: &str) -> Option<RoomId> {
    let url = Url::parse(page_url).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.trim().to_string())
        .filter(|room| !room.is_empty())
}

/// Short, human-readable room id
pub fn generate_room_id() -> RoomId {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

/// The page URL with `param` set to `room`, replacing any previous value
pub fn share_url(page_url: &str, param: &str, room: &str) -> SyncResult<String> {
    let mut url = Url::parse(page_url).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, room);

    Ok(url.to_string())
}
