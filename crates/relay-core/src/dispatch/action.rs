//! The [`Action`] trait and the types that describe an action's lifecycle.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::Dispatcher;
use crate::error::ActionError;

/// Shared handle to an action object.
pub type ActionRef = Arc<dyn Action>;

/// What [`Action::execute`] returns. An empty error list is never produced
/// by the dispatcher; `Ok(())` is a clean finish.
pub type ActionResult = std::result::Result<(), Vec<ActionError>>;

impl From<ActionError> for Vec<ActionError> {
    fn from(e: ActionError) -> Self {
        vec![e]
    }
}

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Arena index assigned by the [`Dispatcher`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

impl ActionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInfo {
    pub id: ActionId,
    pub name: String,
}

impl fmt::Display for ActionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.id)
    }
}

/// `Pending -> Executing -> {Finished, Cancelled}`. Terminal states are
/// absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Executing,
    Finished { errors: Vec<ActionError> },
    Cancelled,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Cancelled)
    }

    /// Finished with no errors.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Finished { errors } if errors.is_empty())
    }

    /// Errors reported to observers for this state.
    pub fn errors(&self) -> Vec<ActionError> {
        match self {
            Self::Finished { errors } => errors.clone(),
            Self::Cancelled => vec![ActionError::Cancelled],
            Self::Pending | Self::Executing => Vec::new(),
        }
    }

    /// Terminal state for an action that returned `result`.
    pub(crate) fn from_result(result: ActionResult) -> Self {
        match result {
            Ok(()) => Self::Finished { errors: Vec::new() },
            Err(errors) if errors.contains(&ActionError::Cancelled) => Self::Cancelled,
            Err(errors) => Self::Finished { errors },
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Executing => f.write_str("executing"),
            Self::Finished { errors } if errors.is_empty() => f.write_str("finished"),
            Self::Finished { errors } => write!(f, "finished with {} error(s)", errors.len()),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Asynchronous, cancellable unit of work run by the [`Dispatcher`].
///
/// Failures are reported through the returned error list, never by
/// panicking. Long-running actions should call [`ActionContext::checkpoint`]
/// between steps so cancellation takes effect.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: ActionContext) -> ActionResult;
}

/// Closure-backed action.
pub struct ActionFn<F> {
    name: Cow<'static, str>,
    func: F,
}

impl<F, Fut> ActionFn<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }

    /// Build the action and return it as an [`ActionRef`].
    pub fn arc(name: impl Into<Cow<'static, str>>, func: F) -> ActionRef {
        Arc::new(Self::new(name, func))
    }
}

#[async_trait]
impl<F, Fut> Action for ActionFn<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: ActionContext) -> ActionResult {
        (self.func)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Terminal result of one dependency, as seen by its dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyResult {
    pub info: ActionInfo,
    pub state: ActionState,
}

/// Handed to [`Action::execute`].
pub struct ActionContext {
    pub(crate) info: ActionInfo,
    pub(crate) dependencies: Vec<DependencyResult>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) dispatcher: Dispatcher,
}

impl ActionContext {
    pub fn info(&self) -> &ActionInfo {
        &self.info
    }

    /// Terminal results of every dependency, in declaration order.
    pub fn dependencies(&self) -> &[DependencyResult] {
        &self.dependencies
    }

    /// Fail with `DependencyFailed` for each dependency that did not finish
    /// cleanly. For actions that need all of their inputs.
    pub fn require_dependencies(&self) -> ActionResult {
        let errors: Vec<ActionError> = self
            .dependencies
            .iter()
            .filter(|d| !d.state.succeeded())
            .map(|d| ActionError::DependencyFailed {
                dependency: d.info.name.clone(),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> std::result::Result<(), ActionError> {
        if self.is_cancelled() {
            Err(ActionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Dispatch a follow-up action. Observers see `action_did_produce`
    /// before the new action starts; it runs independently of this one.
    pub fn produce_action(&self, action: ActionRef) -> ActionHandle {
        self.dispatcher.produce(&self.info, action)
    }
}

// ---------------------------------------------------------------------------
// ActionHandle
// ---------------------------------------------------------------------------

/// Read-only view of a dispatched action.
#[derive(Clone)]
pub struct ActionHandle {
    pub(crate) info: ActionInfo,
    pub(crate) state: watch::Receiver<ActionState>,
}

impl ActionHandle {
    pub fn id(&self) -> ActionId {
        self.info.id
    }

    pub fn info(&self) -> &ActionInfo {
        &self.info
    }

    /// Last published state. Becomes terminal after observers have seen
    /// `action_did_finish`.
    pub fn state(&self) -> ActionState {
        self.state.borrow().clone()
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> ActionState {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(ActionState::is_terminal).await;
        let state = rx.borrow().clone();
        state
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("info", &self.info)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_in_error_list_means_cancelled_state() {
        let state = ActionState::from_result(Err(vec![
            ActionError::failed("io"),
            ActionError::Cancelled,
        ]));
        assert_eq!(state, ActionState::Cancelled);
        assert_eq!(state.errors(), vec![ActionError::Cancelled]);
    }

    #[test]
    fn clean_result_is_successful_finish() {
        let state = ActionState::from_result(Ok(()));
        assert!(state.is_terminal());
        assert!(state.succeeded());
        assert!(state.errors().is_empty());
        assert_eq!(state.to_string(), "finished");
    }

    #[test]
    fn failures_are_kept_in_order() {
        let state = ActionState::from_result(Err(vec![
            ActionError::failed("first"),
            ActionError::failed("second"),
        ]));
        assert!(!state.succeeded());
        assert_eq!(state.errors()[1], ActionError::failed("second"));
        assert_eq!(state.to_string(), "finished with 2 error(s)");
    }

    #[test]
    fn non_terminal_states() {
        assert!(!ActionState::Pending.is_terminal());
        assert!(!ActionState::Executing.is_terminal());
        assert!(ActionState::Cancelled.is_terminal());
    }
}
