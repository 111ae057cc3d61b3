//! Library change notifications.
//!
//! A [`Library`](crate::Library) owns an [`EventBus`]. Callers interested in
//! changes call [`EventBus::subscribe`] and read from the returned channel;
//! subscribers whose receiver has been dropped are pruned on the next emit.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use crate::model::Identity;

/// Something that happened to a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    /// The canonical record was written.
    EntitySaved(Identity),
    /// The entity's files were moved to the holding area.
    EntityDeleted(Identity),
    /// The index could not be updated; reads of this entity use the files.
    IndexWriteFailed { identity: Identity, reason: String },
    /// A rebuilt index replaced the live one.
    IndexRebuilt { indexed: usize, corrupt: usize },
    /// The index cannot be used until it is rebuilt.
    IndexUnavailable(String),
    CacheCleared,
}

/// Fan-out of [`LibraryEvent`]s to channel subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<LibraryEvent>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Events emitted from now on are delivered to it.
    pub fn subscribe(&self) -> Receiver<LibraryEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn emit(&self, event: LibraryEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map_or(0, |s| s.len())
    }
}
