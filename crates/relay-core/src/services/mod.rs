//! Services that feed the event queue.
//!
//! Each one owns a small piece of persisted state and is its only writer.

pub mod device_attributes;
pub mod notification_handler;
pub mod test_device;

pub use device_attributes::DeviceAttributesService;
pub use notification_handler::{Notification, NotificationHandlerService, TapBehavior};
pub use test_device::TestDeviceManagerService;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::QueueConfig;
    use crate::error::SendError;
    use crate::event::Event;
    use crate::queue::{EventQueue, EventSender};
    use crate::storage::{KeyValueStore, MemoryStore};

    /// Keeps every batch it is handed.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) batches: Mutex<Vec<Vec<Event>>>,
    }

    impl RecordingSender {
        pub(crate) fn names(&self) -> Vec<Vec<String>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.iter().map(|e| e.name.clone()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl EventSender for RecordingSender {
        async fn send(&self, batch: &[Event]) -> Result<(), SendError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    /// Queue that only flushes when asked, over a shared memory store.
    pub(crate) fn quiet_queue() -> (EventQueue, Arc<MemoryStore>, Arc<RecordingSender>) {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let queue = EventQueue::new(
            QueueConfig {
                flush_at: 1_000,
                flush_interval_secs: 0.0,
                ..QueueConfig::default()
            },
            store.clone() as Arc<dyn KeyValueStore>,
            sender.clone(),
        );
        (queue, store, sender)
    }
}
