use crate::models::{ArtifactKind, BackupState, ContentHash};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LibraryEvent {
    ListingUpdated {
        root: PathBuf,
        snapshot: Option<String>,
        entries: usize,
    },
    ScanProgress {
        discovered: usize,
        processed: usize,
    },
    ArtifactReady {
        hash: ContentHash,
        kind: ArtifactKind,
    },
    BackupStateChanged {
        path: String,
        state: BackupState,
    },
    ItemUploaded {
        path: String,
        hash: ContentHash,
        deduplicated: bool,
    },
    ItemFailed {
        path: String,
        error: String,
    },
    RemoteCatalogPublished {
        snapshot: String,
    },
    RemoteUnavailable {
        reason: String,
    },
    QuotaExceeded {
        reason: String,
    },
}

/// Fan-out of library events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<LibraryEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<LibraryEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    /// Delivers to every live subscriber, dropping those whose receiver is gone.
    pub fn emit(&self, event: LibraryEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(LibraryEvent::ScanProgress {
            discovered: 3,
            processed: 1,
        });
        assert_eq!(a.try_recv().unwrap(), b.try_recv().unwrap());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(LibraryEvent::RemoteUnavailable {
            reason: "offline".into(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
