//! Lifecycle listeners.
//!
//! ```text
//! Dispatcher ──► action_did_start / action_did_produce / action_did_finish
//!                     │
//!        ┌────────────┼──────────────┐
//!        ▼            ▼              ▼
//! LoggingObserver  FlushObserver  custom observers
//!   (tracing)     (EventQueue)
//! ```
//!
//! Callbacks run on the dispatcher's task and must not block. Anything slow
//! belongs in a spawned task, the way [`FlushObserver`] does it.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::action::ActionInfo;
use crate::error::ActionError;
use crate::queue::EventQueue;

/// Receives action lifecycle events. Every method defaults to a no-op.
pub trait ActionObserver: Send + Sync {
    /// Exactly once per action, right before its work begins.
    fn action_did_start(&self, _action: &ActionInfo) {}

    /// An executing action dispatched `child`.
    fn action_did_produce(&self, _parent: &ActionInfo, _child: &ActionInfo) {}

    /// Exactly once per action. `errors` is empty on a clean finish and
    /// `[Cancelled]` when the action was cancelled.
    fn action_did_finish(&self, _action: &ActionInfo, _errors: &[ActionError]) {}
}

/// Logs lifecycle events through `tracing`.
pub struct LoggingObserver;

impl ActionObserver for LoggingObserver {
    fn action_did_start(&self, action: &ActionInfo) {
        info!(action = %action, "[starting]");
    }

    fn action_did_produce(&self, parent: &ActionInfo, child: &ActionInfo) {
        info!(parent = %parent, action = %child, "[produced]");
    }

    fn action_did_finish(&self, action: &ActionInfo, errors: &[ActionError]) {
        if errors.is_empty() {
            info!(action = %action, "[finished]");
        } else if errors.contains(&ActionError::Cancelled) {
            info!(action = %action, "[cancelled]");
        } else {
            let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
            warn!(action = %action, errors = ?errors, "[failed]");
        }
    }
}

/// Flushes an [`EventQueue`] whenever an action with a tracked name
/// finishes, whatever its errors.
pub struct FlushObserver {
    queue: EventQueue,
    tracked: HashSet<String>,
}

impl FlushObserver {
    pub fn new<I, S>(queue: EventQueue, tracked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue,
            tracked: tracked.into_iter().map(Into::into).collect(),
        }
    }
}

impl ActionObserver for FlushObserver {
    fn action_did_finish(&self, action: &ActionInfo, _errors: &[ActionError]) {
        if !self.tracked.contains(&action.name) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(action = %action, "Tracked action finished: flushing event queue");
                let queue = self.queue.clone();
                runtime.spawn(async move {
                    queue.flush().await;
                });
            }
            Err(_) => debug!(action = %action, "No Tokio runtime: skipping flush"),
        }
    }
}
