//! Action dispatch engine.
//!
//! An [`Action`] is an async unit of work. The [`Dispatcher`] runs actions
//! once their dependencies are terminal, reports every lifecycle transition
//! to registered [`ActionObserver`]s, and propagates cancellation to
//! dependents.
//!
//! ```text
//! ActionGraph ──dispatch_graph──► cycle check ──► arena (Vec<Node>)
//!                                                   │
//!                          dependencies settled ────┴──► tokio task ──► Action::execute
//!                                                                          │
//!                                         observers ◄── start / produce / finish
//! ```

pub mod action;
pub mod dispatcher;
pub mod graph;
pub mod observer;

pub use action::{
    Action, ActionContext, ActionFn, ActionHandle, ActionId, ActionInfo, ActionRef, ActionResult,
    ActionState, DependencyResult,
};
pub use dispatcher::Dispatcher;
pub use graph::{ActionGraph, NodeId};
pub use observer::{ActionObserver, FlushObserver, LoggingObserver};
