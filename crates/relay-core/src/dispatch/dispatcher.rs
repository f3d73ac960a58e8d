//! Arena-backed action scheduler.
//!
//! Every dispatched action gets a [`Node`] in one `Vec`, indexed by its
//! [`ActionId`]. Edges are stored as id lists in both directions, so the
//! arena owns every node and no reference cycles exist.
//!
//! A node moves through three phases when it terminates:
//!
//! 1. its `state` becomes terminal (under the arena lock),
//! 2. observers receive `action_did_finish` (outside the lock),
//! 3. it is marked `settled`, the terminal state is published to handles,
//!    and dependents whose last dependency just settled are scheduled.
//!
//! Dependents only count unsettled dependencies, so a dependency's finish
//! notification always precedes its dependents' start notifications.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::action::{
    ActionContext, ActionHandle, ActionId, ActionInfo, ActionRef, ActionState, DependencyResult,
};
use super::graph::{ActionGraph, GraphNode};
use super::observer::ActionObserver;
use crate::config::DispatcherConfig;
use crate::error::{ActionError, RelayError, Result};

struct Node {
    info: ActionInfo,
    /// Taken when the action starts or is cancelled.
    action: Option<ActionRef>,
    state: ActionState,
    settled: bool,
    deps: Vec<ActionId>,
    dependents: Vec<ActionId>,
    /// Dependencies that have not settled yet.
    waiting: usize,
    observers: Vec<Arc<dyn ActionObserver>>,
    published: watch::Sender<ActionState>,
    cancel: watch::Sender<bool>,
}

struct Inner {
    nodes: Mutex<Vec<Node>>,
    observers: RwLock<Vec<Arc<dyn ActionObserver>>>,
    permits: Arc<Semaphore>,
}

/// Schedules actions, fans lifecycle events out to observers, and
/// propagates cancellation. Clones share the same arena.
///
/// Actions run as Tokio tasks; at most `max_concurrency` execute at once.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(&DispatcherConfig::default())
    }
}

fn same_observer(a: &Arc<dyn ActionObserver>, b: &Arc<dyn ActionObserver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
                permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            }),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, Vec<Node>> {
        self.inner
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an observer. Registering the same instance twice has no effect;
    /// notifications follow registration order.
    pub fn register(&self, observer: Arc<dyn ActionObserver>) {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if observers.iter().any(|o| same_observer(o, &observer)) {
            debug!("Observer already registered");
            return;
        }
        observers.push(observer);
    }

    /// Dispatcher-wide observers followed by `extra`.
    fn observers_with(&self, extra: &[Arc<dyn ActionObserver>]) -> Vec<Arc<dyn ActionObserver>> {
        let mut all = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        all.extend(extra.iter().cloned());
        all
    }

    /// Number of actions ever dispatched.
    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scheduling state of `id`, if it exists.
    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.nodes().get(id.index()).map(|n| n.state.clone())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run a single action with no dependencies. Returns immediately.
    pub fn dispatch(&self, action: ActionRef) -> ActionHandle {
        let handle = {
            let mut nodes = self.nodes();
            push_node(&mut nodes, action, Vec::new())
        };
        debug!(action = %handle.info, "Action dispatched");
        self.schedule(handle.id());
        handle
    }

    /// Register every action of `graph`, then schedule those whose
    /// dependencies are already terminal. Handles are returned in
    /// [`ActionGraph::add`] order.
    ///
    /// A cycle anywhere in the graph fails the whole call before anything is
    /// registered or any observer is notified.
    pub fn dispatch_graph(&self, graph: ActionGraph) -> Result<Vec<ActionHandle>> {
        if let Some((node, dep)) = graph.dangling_edge() {
            return Err(RelayError::InvalidGraph(format!(
                "node {} depends on node {} which is not part of the graph",
                node.0, dep.0
            )));
        }
        if let Some(node) = graph.find_cycle() {
            let action = graph.nodes[node.0].action.name().to_string();
            error!(action = %action, "Refusing to dispatch action graph with a dependency cycle");
            return Err(RelayError::CyclicDependency { action });
        }

        let (handles, ready) = {
            let mut nodes = self.nodes();
            for node in &graph.nodes {
                if let Some(missing) = node.after.iter().find(|id| id.index() >= nodes.len()) {
                    return Err(RelayError::UnknownAction(*missing));
                }
            }

            let base = nodes.len();
            let mut edges = Vec::with_capacity(graph.nodes.len());
            let mut handles = Vec::with_capacity(graph.nodes.len());
            for GraphNode {
                action,
                depends_on,
                after,
                observers,
            } in graph.nodes
            {
                let deps: Vec<ActionId> = depends_on
                    .iter()
                    .map(|n| ActionId((base + n.0) as u64))
                    .chain(after)
                    .collect();
                edges.push(deps);
                handles.push(push_node(&mut nodes, action, observers));
            }

            for (offset, deps) in edges.into_iter().enumerate() {
                let id = ActionId((base + offset) as u64);
                let mut waiting = 0;
                for dep in &deps {
                    let dependency = &mut nodes[dep.index()];
                    dependency.dependents.push(id);
                    if !dependency.settled {
                        waiting += 1;
                    }
                }
                let node = &mut nodes[id.index()];
                node.deps = deps;
                node.waiting = waiting;
            }

            let ready: Vec<ActionId> = handles
                .iter()
                .map(ActionHandle::id)
                .filter(|id| nodes[id.index()].waiting == 0)
                .collect();
            (handles, ready)
        };

        debug!(count = handles.len(), ready = ready.len(), "Action graph dispatched");
        for id in ready {
            self.schedule(id);
        }
        Ok(handles)
    }

    /// Used by [`ActionContext::produce_action`].
    pub(crate) fn produce(&self, parent: &ActionInfo, action: ActionRef) -> ActionHandle {
        let (handle, parent_observers) = {
            let mut nodes = self.nodes();
            let parent_observers = nodes
                .get(parent.id.index())
                .map(|n| n.observers.clone())
                .unwrap_or_default();
            (push_node(&mut nodes, action, Vec::new()), parent_observers)
        };
        debug!(parent = %parent, action = %handle.info, "Action produced");
        for observer in self.observers_with(&parent_observers) {
            observer.action_did_produce(parent, &handle.info);
        }
        self.schedule(handle.id());
        handle
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel `id` and everything that transitively depends on it.
    ///
    /// Pending actions become `Cancelled` without starting. Executing actions
    /// are signalled through [`ActionContext::cancelled`] and settle when they
    /// return. Dependencies of `id` are never touched.
    pub fn cancel(&self, id: ActionId) -> Result<()> {
        let mut cancelled = Vec::new();
        let mut signalled = 0;
        {
            let mut nodes = self.nodes();
            if id.index() >= nodes.len() {
                return Err(RelayError::UnknownAction(id));
            }
            let mut queue = VecDeque::from([id]);
            let mut seen = HashSet::from([id]);
            while let Some(next) = queue.pop_front() {
                let node = &mut nodes[next.index()];
                match node.state {
                    ActionState::Pending => {
                        node.state = ActionState::Cancelled;
                        node.action = None;
                        cancelled.push(next);
                    }
                    ActionState::Executing => {
                        node.cancel.send_replace(true);
                        signalled += 1;
                    }
                    ActionState::Finished { .. } | ActionState::Cancelled => {}
                }
                for dependent in &node.dependents {
                    if seen.insert(*dependent) {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        info!(action = %id, cancelled = cancelled.len(), signalled, "Cancellation requested");
        for id in cancelled {
            self.settle(id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    fn schedule(&self, id: ActionId) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let dispatcher = self.clone();
                runtime.spawn(async move { dispatcher.run(id).await });
            }
            Err(_) => {
                error!(action = %id, "No Tokio runtime: action cannot run");
                self.finish(
                    id,
                    ActionState::Finished {
                        errors: vec![ActionError::failed("no async runtime available")],
                    },
                );
            }
        }
    }

    async fn run(self, id: ActionId) {
        let permit = match self.inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.finish(
                    id,
                    ActionState::Finished {
                        errors: vec![ActionError::failed("dispatcher closed")],
                    },
                );
                return;
            }
        };

        let started = {
            let mut nodes = self.nodes();
            let node = &mut nodes[id.index()];
            if node.state != ActionState::Pending {
                // cancelled while queued for a permit
                return;
            }
            match node.action.take() {
                Some(action) => {
                    node.state = ActionState::Executing;
                    node.published.send_replace(ActionState::Executing);
                    let info = node.info.clone();
                    let deps = node.deps.clone();
                    let observers = node.observers.clone();
                    let cancel = node.cancel.subscribe();
                    let dependencies: Vec<DependencyResult> = deps
                        .iter()
                        .map(|dep| {
                            let dep = &nodes[dep.index()];
                            DependencyResult {
                                info: dep.info.clone(),
                                state: dep.state.clone(),
                            }
                        })
                        .collect();
                    Some((action, info, dependencies, observers, cancel))
                }
                None => None,
            }
        };
        let Some((action, info, dependencies, observers, cancel)) = started else {
            return;
        };

        debug!(action = %info, "Action started");
        for observer in self.observers_with(&observers) {
            observer.action_did_start(&info);
        }

        let ctx = ActionContext {
            info: info.clone(),
            dependencies,
            cancel,
            dispatcher: self.clone(),
        };
        let state = match AssertUnwindSafe(action.execute(ctx)).catch_unwind().await {
            Ok(result) => ActionState::from_result(result),
            Err(_) => {
                error!(action = %info, "Action panicked");
                ActionState::Finished {
                    errors: vec![ActionError::failed("action panicked")],
                }
            }
        };
        drop(permit);
        self.finish(id, state);
    }

    /// Phase 1: record the terminal state, then settle.
    fn finish(&self, id: ActionId, state: ActionState) {
        {
            let mut nodes = self.nodes();
            let node = &mut nodes[id.index()];
            if node.state.is_terminal() {
                return;
            }
            node.state = state;
            node.action = None;
        }
        self.settle(id);
    }

    /// Phases 2 and 3: notify observers, publish, release dependents.
    fn settle(&self, id: ActionId) {
        let (info, state, observers) = {
            let nodes = self.nodes();
            let node = &nodes[id.index()];
            (node.info.clone(), node.state.clone(), node.observers.clone())
        };

        match &state {
            ActionState::Cancelled => info!(action = %info, "Action cancelled"),
            ActionState::Finished { errors } if errors.is_empty() => {
                debug!(action = %info, "Action finished")
            }
            ActionState::Finished { errors } => {
                warn!(action = %info, errors = errors.len(), "Action finished with errors")
            }
            ActionState::Pending | ActionState::Executing => {}
        }

        let errors = state.errors();
        for observer in self.observers_with(&observers) {
            observer.action_did_finish(&info, &errors);
        }

        let ready = {
            let mut nodes = self.nodes();
            let node = &mut nodes[id.index()];
            node.settled = true;
            node.published.send_replace(state);
            let dependents = node.dependents.clone();
            let mut ready = Vec::new();
            for dependent in dependents {
                let node = &mut nodes[dependent.index()];
                node.waiting = node.waiting.saturating_sub(1);
                if node.waiting == 0 && node.state == ActionState::Pending {
                    ready.push(dependent);
                }
            }
            ready
        };
        for dependent in ready {
            self.schedule(dependent);
        }
    }
}

/// Append a pending node with no edges and return its handle.
fn push_node(
    nodes: &mut Vec<Node>,
    action: ActionRef,
    observers: Vec<Arc<dyn ActionObserver>>,
) -> ActionHandle {
    let info = ActionInfo {
        id: ActionId(nodes.len() as u64),
        name: action.name().to_string(),
    };
    let (published, state) = watch::channel(ActionState::Pending);
    let (cancel, _) = watch::channel(false);
    nodes.push(Node {
        info: info.clone(),
        action: Some(action),
        state: ActionState::Pending,
        settled: false,
        deps: Vec::new(),
        dependents: Vec::new(),
        waiting: 0,
        observers,
        published,
        cancel,
    });
    ActionHandle { info, state }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ActionFn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot, Notify};

    /// Records every callback as a short string.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.entries()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("missing {entry}"))
        }

        fn count(&self, entry: &str) -> usize {
            self.entries().iter().filter(|e| *e == entry).count()
        }
    }

    impl ActionObserver for Recorder {
        fn action_did_start(&self, action: &ActionInfo) {
            self.log.lock().unwrap().push(format!("start:{}", action.name));
        }

        fn action_did_produce(&self, parent: &ActionInfo, child: &ActionInfo) {
            self.log
                .lock()
                .unwrap()
                .push(format!("produce:{}->{}", parent.name, child.name));
        }

        fn action_did_finish(&self, action: &ActionInfo, errors: &[ActionError]) {
            self.log
                .lock()
                .unwrap()
                .push(format!("finish:{}:{}", action.name, errors.len()));
        }
    }

    fn noop(name: &'static str) -> ActionRef {
        ActionFn::arc(name, |_ctx| async { Ok(()) })
    }

    fn explode() -> crate::dispatch::ActionResult {
        panic!("boom")
    }

    fn dispatcher_with_recorder() -> (Dispatcher, Arc<Recorder>) {
        let dispatcher = Dispatcher::default();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());
        (dispatcher, recorder)
    }

    async fn wait_all(handles: &[ActionHandle]) -> Vec<ActionState> {
        let mut states = Vec::new();
        for handle in handles {
            states.push(handle.wait().await);
        }
        states
    }

    #[tokio::test]
    async fn single_action_starts_and_finishes_once() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let handle = dispatcher.dispatch(noop("sync"));
        assert!(handle.wait().await.succeeded());
        assert_eq!(recorder.entries(), vec!["start:sync", "finish:sync:0"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn diamond_runs_dependencies_first_exactly_once() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let mut graph = ActionGraph::new();
        let a = graph.add(noop("a"));
        let b = graph.add(noop("b"));
        let c = graph.add(noop("c"));
        let d = graph.add(noop("d"));
        graph.depends_on(b, a).depends_on(c, a);
        graph.depends_on(d, b).depends_on(d, c);

        let handles = dispatcher.dispatch_graph(graph).unwrap();
        assert!(wait_all(&handles).await.iter().all(ActionState::succeeded));

        for name in ["a", "b", "c", "d"] {
            assert_eq!(recorder.count(&format!("start:{name}")), 1);
            assert_eq!(recorder.count(&format!("finish:{name}:0")), 1);
            assert!(
                recorder.position(&format!("start:{name}"))
                    < recorder.position(&format!("finish:{name}:0"))
            );
        }
        for (dependent, dependency) in [("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")] {
            assert!(
                recorder.position(&format!("finish:{dependency}:0"))
                    < recorder.position(&format!("start:{dependent}")),
                "{dependency} must finish before {dependent} starts"
            );
        }
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_anything_runs() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let mut graph = ActionGraph::new();
        let a = graph.add(noop("a"));
        let b = graph.add(noop("b"));
        let c = graph.add(noop("c"));
        graph.depends_on(a, b).depends_on(b, c).depends_on(c, a);

        let err = dispatcher.dispatch_graph(graph).unwrap_err();
        assert!(matches!(err, RelayError::CyclicDependency { .. }));
        tokio::task::yield_now().await;
        assert!(recorder.entries().is_empty());
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn unknown_external_dependency_is_rejected() {
        let dispatcher = Dispatcher::default();
        let mut graph = ActionGraph::new();
        let a = graph.add(noop("a"));
        graph.after(a, ActionId(42));
        let err = dispatcher.dispatch_graph(graph).unwrap_err();
        assert!(matches!(err, RelayError::UnknownAction(ActionId(42))));
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn cancel_propagates_to_dependents_but_not_dependencies() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Notify::new());
        let entered_tx = Mutex::new(Some(entered_tx));

        let slow = {
            let gate = gate.clone();
            ActionFn::arc("slow", move |_ctx| {
                let gate = gate.clone();
                let entered = entered_tx.lock().unwrap().take();
                async move {
                    if let Some(tx) = entered {
                        let _ = tx.send(());
                    }
                    gate.notified().await;
                    Ok(())
                }
            })
        };

        let mut graph = ActionGraph::new();
        let a = graph.add(slow);
        let b = graph.add(noop("b"));
        let c = graph.add(noop("c"));
        graph.depends_on(b, a).depends_on(c, b);
        let handles = dispatcher.dispatch_graph(graph).unwrap();

        entered_rx.await.unwrap();
        dispatcher.cancel(handles[1].id()).unwrap();
        gate.notify_one();

        let states = wait_all(&handles).await;
        assert!(states[0].succeeded(), "dependency keeps running");
        assert_eq!(states[1], ActionState::Cancelled);
        assert_eq!(states[2], ActionState::Cancelled);
        assert_eq!(recorder.count("start:b"), 0);
        assert_eq!(recorder.count("start:c"), 0);
        assert_eq!(recorder.count("finish:b:1"), 1);
        assert_eq!(recorder.count("finish:c:1"), 1);
    }

    #[tokio::test]
    async fn executing_action_observes_cancellation() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered_tx = Mutex::new(Some(entered_tx));
        let looping = ActionFn::arc("poll", move |ctx: ActionContext| {
            let entered = entered_tx.lock().unwrap().take();
            async move {
                if let Some(tx) = entered {
                    let _ = tx.send(());
                }
                ctx.cancelled().await;
                ctx.checkpoint().map_err(|e| vec![e])
            }
        });

        let mut graph = ActionGraph::new();
        let a = graph.add(looping);
        let b = graph.add(noop("after-poll"));
        graph.depends_on(b, a);
        let handles = dispatcher.dispatch_graph(graph).unwrap();

        entered_rx.await.unwrap();
        dispatcher.cancel(handles[0].id()).unwrap();

        let states = wait_all(&handles).await;
        assert_eq!(states, vec![ActionState::Cancelled, ActionState::Cancelled]);
        assert_eq!(recorder.count("start:poll"), 1);
        assert_eq!(recorder.count("finish:poll:1"), 1);
        assert_eq!(recorder.count("start:after-poll"), 0);
    }

    #[tokio::test]
    async fn cancelling_unknown_action_errors() {
        let dispatcher = Dispatcher::default();
        assert!(matches!(
            dispatcher.cancel(ActionId(7)),
            Err(RelayError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn dependents_see_failed_dependencies_and_still_run() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing = ActionFn::arc("fetch", |_ctx| async {
            Err(vec![ActionError::failed("offline")])
        });
        let inspect = ActionFn::arc("inspect", move |ctx: ActionContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.dependencies().to_vec());
                ctx.require_dependencies()
            }
        });

        let mut graph = ActionGraph::new();
        let a = graph.add(failing);
        let b = graph.add(inspect);
        graph.depends_on(b, a);
        let handles = dispatcher.dispatch_graph(graph).unwrap();

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].info.name, "fetch");
        assert_eq!(
            seen[0].state,
            ActionState::Finished {
                errors: vec![ActionError::failed("offline")]
            }
        );
        assert_eq!(
            handles[1].wait().await,
            ActionState::Finished {
                errors: vec![ActionError::DependencyFailed {
                    dependency: "fetch".into()
                }]
            }
        );
    }

    #[tokio::test]
    async fn produced_action_is_announced_then_dispatched() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let parent = ActionFn::arc("parent", move |ctx: ActionContext| {
            let tx = tx.clone();
            async move {
                let child = ctx.produce_action(noop("child"));
                let _ = tx.send(child);
                Ok(())
            }
        });

        dispatcher.dispatch(parent).wait().await;
        let child = rx.recv().await.unwrap();
        assert!(child.wait().await.succeeded());
        assert!(recorder.position("produce:parent->child") < recorder.position("start:child"));
        assert_eq!(recorder.count("finish:child:0"), 1);
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn panicking_action_finishes_with_error() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let mut graph = ActionGraph::new();
        let a = graph.add(ActionFn::arc("boom", |_ctx| async { explode() }));
        let b = graph.add(noop("next"));
        graph.depends_on(b, a);
        let handles = dispatcher.dispatch_graph(graph).unwrap();

        let states = wait_all(&handles).await;
        assert_eq!(states[0].errors(), vec![ActionError::failed("action panicked")]);
        assert!(states[1].succeeded());
        assert_eq!(recorder.count("finish:boom:1"), 1);
    }

    #[tokio::test]
    async fn external_dependency_is_waited_for() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let gate = Arc::new(Notify::new());
        let first = dispatcher.dispatch({
            let gate = gate.clone();
            ActionFn::arc("first", move |_ctx| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
        });

        let mut graph = ActionGraph::new();
        let second = graph.add(noop("second"));
        graph.after(second, first.id());
        let handles = dispatcher.dispatch_graph(graph).unwrap();

        tokio::task::yield_now().await;
        assert_eq!(recorder.count("start:second"), 0);
        gate.notify_one();
        handles[0].wait().await;
        assert!(recorder.position("finish:first:0") < recorder.position("start:second"));
    }

    #[tokio::test]
    async fn observers_are_deduplicated_and_per_action_observers_run_last() {
        let dispatcher = Dispatcher::default();
        let global = Arc::new(Recorder::default());
        let local = Arc::new(Recorder::default());
        dispatcher.register(global.clone());
        dispatcher.register(global.clone());

        let mut graph = ActionGraph::new();
        let a = graph.add(noop("a"));
        graph.observe(a, local.clone());
        let _ = graph.add(noop("b"));
        let handles = dispatcher.dispatch_graph(graph).unwrap();
        wait_all(&handles).await;

        assert_eq!(global.count("start:a"), 1);
        assert_eq!(local.entries(), vec!["start:a", "finish:a:0"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded() {
        let dispatcher = Dispatcher::new(&DispatcherConfig { max_concurrency: 2 });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<ActionHandle> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                dispatcher.dispatch(ActionFn::arc("work", move |_ctx| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
            })
            .collect();

        wait_all(&handles).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn dispatch_without_runtime_finishes_with_error() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let handle = dispatcher.dispatch(noop("orphan"));
        assert_eq!(
            handle.state().errors(),
            vec![ActionError::failed("no async runtime available")]
        );
        assert_eq!(recorder.entries(), vec!["finish:orphan:1"]);
    }
}
