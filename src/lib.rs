//! Collab Gate - opt-in real-time sync for single-user diagram editors
//!
//! Adds room-based collaboration to an editor page without changing how the
//! page works alone:
//! - Pages without a room parameter never open a connection
//! - Pages with one connect, but send nothing until the user toggles sync on
//! - Edits are debounced full-buffer updates; remote writes are echo-guarded
//! - Same-process broadcast mirrors obey the same toggle as the transport

pub mod health;
pub mod layer;
pub mod room;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use layer::CollabLayer;
pub use room::{BufferSurface, EditingSurface, RoomSession, SessionHandle};
pub use sync::{
    GatedFactory, GatedSink, StatusSurface, SyncConfig, SyncError, SyncPolicy, SyncState,
};
