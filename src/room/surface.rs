//! Editing-surface contract.

use parking_lot::RwLock;
use std::sync::Arc;

/// Callback fired when the surface content changes
pub type ChangeHandler = Box<dyn Fn() + Send + Sync>;

/// The text buffer a room session is bound to, supplied by the embedding page
pub trait EditingSurface: Send + Sync + 'static {
    fn get_value(&self) -> String;

    /// Programmatic write
    fn set_value(&self, text: &str);

    fn on_change(&self, handler: ChangeHandler);

    /// Caret position, if the surface exposes one
    fn cursor(&self) -> Option<usize> {
        None
    }

    /// Fire the change handlers without a user edit, so anything rendering from
    /// the change signal picks up a programmatic write
    fn dispatch_change(&self);
}

/// In-memory, thread-safe editing surface
#[derive(Default)]
pub struct BufferSurface {
    value: RwLock<String>,
    cursor: RwLock<Option<usize>>,
    handlers: RwLock<Vec<ChangeHandler>>,
}

impl BufferSurface {
    pub fn new(initial: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            value: RwLock::new(initial.into()),
            ..Default::default()
        })
    }

    /// Replace the buffer as a user edit: caret moves to the end, handlers fire
    pub fn edit(&self, text: impl Into<String>) {
        let text = text.into();
        *self.cursor.write() = Some(text.len());
        *self.value.write() = text;
        self.dispatch_change();
    }
}

impl EditingSurface for BufferSurface {
    fn get_value(&self) -> String {
        self.value.read().clone()
    }

    fn set_value(&self, text: &str) {
        *self.value.write() = text.to_string();
    }

    fn on_change(&self, handler: ChangeHandler) {
        self.handlers.write().push(handler);
    }

    fn cursor(&self) -> Option<usize> {
        *self.cursor.read()
    }

    fn dispatch_change(&self) {
        for handler in self.handlers.read().iter() {
            handler();
        }
    }
}
