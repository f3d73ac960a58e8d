use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::attributes::Attributes;
use crate::context::{Context, ContextProvider};
use crate::error::Result;
use crate::event::EventInfo;
use crate::queue::EventQueue;
use crate::storage::{get_json, set_json, KeyValueStore};

pub const TEST_DEVICE_KEY: &str = "io.rover.RoverDebug.isTestDevice";
pub const TESTING_ENABLED: &str = "Testing Enabled";
pub const TESTING_DISABLED: &str = "Testing Disabled";

/// Persisted "this is a test device" flag.
///
/// Also a [`ContextProvider`]: register it with the queue to stamp
/// `isTestDevice` onto every event.
pub struct TestDeviceManagerService {
    store: Arc<dyn KeyValueStore>,
    queue: EventQueue,
    write: Mutex<()>,
}

impl TestDeviceManagerService {
    pub fn new(store: Arc<dyn KeyValueStore>, queue: EventQueue) -> Self {
        Self {
            store,
            queue,
            write: Mutex::new(()),
        }
    }

    pub fn is_test_device(&self) -> bool {
        match get_json::<bool>(self.store.as_ref(), TEST_DEVICE_KEY) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Failed to read test device flag: assuming false");
                false
            }
        }
    }

    /// Persist `value`. A change emits "Testing Enabled" or "Testing
    /// Disabled" and then flushes the queue so the change is reported
    /// promptly. Setting the current value does nothing.
    ///
    /// Returns whether the flag changed.
    pub async fn set_test_device(&self, value: bool) -> Result<bool> {
        {
            let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_test_device() == value {
                debug!(value, "Test device flag unchanged");
                return Ok(false);
            }
            set_json(self.store.as_ref(), TEST_DEVICE_KEY, &value)?;
            let name = if value { TESTING_ENABLED } else { TESTING_DISABLED };
            self.queue.add_event(EventInfo::rover(name, Attributes::new()));
        }

        info!(value, "Test device flag changed");
        self.queue.flush().await;
        Ok(true)
    }
}

impl ContextProvider for TestDeviceManagerService {
    fn capture_context(&self, context: Context) -> Context {
        context.with("isTestDevice", self.is_test_device())
    }
}
