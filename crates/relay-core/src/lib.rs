//! Action dispatch and durable event queueing.
//!
//! ```text
//! services ──add_event──► EventQueue ──flush──► EventSender
//!                            │
//!                       KeyValueStore (EventLog)
//!
//! Dispatcher ──► Action::execute
//!     └──► ActionObserver (LoggingObserver, FlushObserver, ...)
//! ```

pub mod attributes;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod io;
pub mod queue;
pub mod services;
pub mod storage;

pub use error::{RelayError, Result};
