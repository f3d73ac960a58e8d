use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::attributes::Attributes;
use crate::error::Result;
use crate::event::EventInfo;
use crate::queue::EventQueue;
use crate::storage::{get_json, set_json, KeyValueStore};

pub const DEVICE_ATTRIBUTES_KEY: &str = "io.rover.deviceAttributes";
pub const DEVICE_ATTRIBUTES_UPDATED: &str = "Device Attributes Updated";

/// Host-defined attributes describing the device or its user.
///
/// Every change is persisted and reported as a "Device Attributes Updated"
/// event carrying the complete new map under `attributes`.
pub struct DeviceAttributesService {
    store: Arc<dyn KeyValueStore>,
    queue: EventQueue,
    /// Serialises read-modify-write cycles.
    write: Mutex<()>,
}

impl DeviceAttributesService {
    pub fn new(store: Arc<dyn KeyValueStore>, queue: EventQueue) -> Self {
        Self {
            store,
            queue,
            write: Mutex::new(()),
        }
    }

    /// Current attributes. A missing or unreadable record reads as empty.
    pub fn attributes(&self) -> Attributes {
        match get_json::<Attributes>(self.store.as_ref(), DEVICE_ATTRIBUTES_KEY) {
            Ok(attributes) => attributes.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to read device attributes: treating as empty");
                Attributes::new()
            }
        }
    }

    /// Apply `update` to the stored attributes and persist the result.
    ///
    /// Emits an event only if the map actually changed. Returns the new map.
    pub fn update_attributes<F>(&self, update: F) -> Result<Attributes>
    where
        F: FnOnce(&mut Attributes),
    {
        let updated = {
            let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.attributes();
            let mut updated = current.clone();
            update(&mut updated);
            if updated == current {
                debug!("Device attributes unchanged");
                return Ok(updated);
            }
            set_json(self.store.as_ref(), DEVICE_ATTRIBUTES_KEY, &updated)?;
            updated
        };

        debug!(count = updated.len(), "Device attributes updated");
        self.queue.add_event(EventInfo::rover(
            DEVICE_ATTRIBUTES_UPDATED,
            Attributes::new().with("attributes", updated.clone()),
        ));
        Ok(updated)
    }

    /// Remove every attribute. Emits an update with an empty map if any
    /// attributes were set.
    pub fn clear_attributes(&self) -> Result<()> {
        let had_any = {
            let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
            let had_any = !self.attributes().is_empty();
            self.store.remove(DEVICE_ATTRIBUTES_KEY)?;
            had_any
        };
        if had_any {
            self.queue.add_event(EventInfo::rover(
                DEVICE_ATTRIBUTES_UPDATED,
                Attributes::new().with("attributes", Attributes::new()),
            ));
        }
        Ok(())
    }
}
