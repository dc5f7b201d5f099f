use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::Result;

/// Callback invoked for every message seen on the bus, whoever posted it.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// A shared, unfiltered broadcast bus. Anyone may post; every subscriber sees everything.
pub trait MessageChannel: Send + Sync {
    fn post(&self, message: Value) -> Result<()>;
    fn on_message(&self, handler: MessageHandler);
}

/// In-process bus. Delivery is synchronous and reaches every handler, including the poster's own.
#[derive(Default, Clone)]
pub struct MemoryChannel {
    handlers: Arc<Mutex<Vec<MessageHandler>>>,
}

impl MemoryChannel {
    pub fn new() -> Self { Self::default() }

    pub fn subscriber_count(&self) -> usize { lock(&self.handlers).len() }
}

impl MessageChannel for MemoryChannel {
    fn post(&self, message: Value) -> Result<()> {
        // Snapshot the handlers so a handler can post or subscribe without deadlocking.
        let handlers: Vec<MessageHandler> = lock(&self.handlers).clone();
        for handler in handlers {
            handler(&message);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        lock(&self.handlers).push(handler);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
