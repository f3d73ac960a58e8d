//! Push notification open handling.
//!
//! A payload is ours when it carries a `rover.notification` object:
//!
//! ```json
//! {"rover": {"notification": {"id": "n1", "campaignID": "c1",
//!   "body": "...", "tapBehavior": {"type": "openURL", "url": "https://..."}}}}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attributes::Attributes;
use crate::dispatch::{ActionHandle, ActionRef, Dispatcher};
use crate::event::EventInfo;
use crate::queue::EventQueue;

pub const NOTIFICATION_OPENED: &str = "Notification Opened";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TapBehavior {
    #[default]
    #[serde(rename = "openApp")]
    OpenApp,
    #[serde(rename = "openURL")]
    OpenUrl { url: String },
    #[serde(rename = "presentWebsite")]
    PresentWebsite { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "campaignID")]
    pub campaign_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub tap_behavior: TapBehavior,
}

impl Notification {
    /// Parse a push payload. `None` when the payload is not ours.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let notification = payload.get("rover")?.get("notification")?;
        Notification::deserialize(notification).ok()
    }

    pub fn opened_event(&self, source: &str) -> EventInfo {
        EventInfo::rover(
            NOTIFICATION_OPENED,
            Attributes::new()
                .with("notificationID", self.id.as_str())
                .with("campaignID", self.campaign_id.as_str())
                .with("source", source),
        )
    }
}

/// Picks the action that carries out a notification's tap behaviour.
pub type RouteHandler = Arc<dyn Fn(&Notification) -> Option<ActionRef> + Send + Sync>;

pub struct NotificationHandlerService {
    dispatcher: Dispatcher,
    queue: EventQueue,
    route: RouteHandler,
}

impl NotificationHandlerService {
    pub const SOURCE: &'static str = "pushNotification";

    pub fn new(dispatcher: Dispatcher, queue: EventQueue, route: RouteHandler) -> Self {
        Self {
            dispatcher,
            queue,
            route,
        }
    }

    /// Handle the user opening a push notification.
    ///
    /// Returns `false` without side effects when the payload is not ours.
    /// Otherwise records "Notification Opened" and dispatches the routed
    /// action, if any.
    pub fn handle(&self, payload: &serde_json::Value) -> bool {
        self.open(payload).is_some()
    }

    /// Like [`handle`](Self::handle), returning the dispatched action.
    pub fn open(&self, payload: &serde_json::Value) -> Option<Option<ActionHandle>> {
        let Some(notification) = Notification::from_payload(payload) else {
            debug!("Ignoring push payload without a rover notification");
            return None;
        };

        info!(notification = %notification.id, campaign = %notification.campaign_id, "Notification opened");
        self.queue.add_event(notification.opened_event(Self::SOURCE));
        Some((self.route)(&notification).map(|action| self.dispatcher.dispatch(action)))
    }
}
