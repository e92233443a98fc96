pub mod graph;
pub mod progress;

use std::collections::VecDeque;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::util::lock;

pub use graph::{Graph, NodeDecl, NodeId};
pub use progress::{LogProgress, Progress};

/// The owner of an FSM: supplies handlers and receives notifications.
#[async_trait]
pub trait Driver: Send + Sync + Sized + 'static {
    type Node: NodeId;
    type Action: Copy + Debug + Send + Sync + 'static;
    type Error: Display + Send + 'static;

    fn fsm(&self) -> &Fsm<Self>;

    /// Run the handler of an action node.
    async fn execute(self: Arc<Self>, action: Self::Action) -> Result<(), Self::Error>;

    /// Called on the worker after a handler returned an error. The engine
    /// does not advance on its own; re-routing is up to the driver.
    async fn on_failure(self: Arc<Self>, node: Self::Node, error: Self::Error);

    /// Called whenever the current node changes. `is_final` is true only
    /// when no path is pending.
    fn entering_state(&self, _node: Self::Node, _is_final: bool) {}
}

struct Routing {
    current: usize,
    target: Option<usize>,
    path: VecDeque<usize>,
}

/// Clears the in-handler flag even if the step future is dropped.
struct HandlerGuard<'a>(&'a AtomicBool);

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns a graph of state and action nodes and a single worker task.
/// Callers steer with [`Fsm::goto`], [`Fsm::skew`] and [`Fsm::jump`]; the
/// worker drains the path one node at a time and hands every action node to
/// its [`Driver`].
pub struct Fsm<D: Driver> {
    graph: Graph<D::Node, D::Action>,
    driver: Weak<D>,
    /// Serializes goto/skew/jump.
    steering: Mutex<()>,
    /// Guards current node, target and pending path.
    routing: Mutex<Routing>,
    in_handler: AtomicBool,
    cancel: Mutex<CancellationToken>,
    wake: Arc<Notify>,
    idle: watch::Sender<bool>,
    arrivals: broadcast::Sender<D::Node>,
    worker: Mutex<Option<JoinHandle<()>>>,
    progress: Mutex<Arc<dyn Progress>>,
    reset_message: Mutex<String>,
}

impl<D: Driver> Fsm<D> {
    pub fn new(graph: Graph<D::Node, D::Action>, driver: Weak<D>) -> Self {
        let root = graph.root();
        let (idle, _) = watch::channel(true);
        let (arrivals, _) = broadcast::channel(64);
        Self {
            graph,
            driver,
            steering: Mutex::new(()),
            routing: Mutex::new(Routing {
                current: root,
                target: None,
                path: VecDeque::new(),
            }),
            in_handler: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            wake: Arc::new(Notify::new()),
            idle,
            arrivals,
            worker: Mutex::new(None),
            progress: Mutex::new(Arc::new(LogProgress::new("fsm"))),
            reset_message: Mutex::new("Reconfiguring".to_string()),
        }
    }

    pub fn graph(&self) -> &Graph<D::Node, D::Action> {
        &self.graph
    }

    pub fn current(&self) -> D::Node {
        let idx = lock(&self.routing).current;
        self.graph.node(idx).id
    }

    pub fn target(&self) -> Option<D::Node> {
        lock(&self.routing).target.map(|idx| self.graph.node(idx).id)
    }

    /// Nodes still queued on the current path, front first.
    pub fn pending(&self) -> Vec<D::Node> {
        let routing = lock(&self.routing);
        routing
            .path
            .iter()
            .map(|idx| self.graph.node(*idx).id)
            .collect()
    }

    /// True while a path is pending.
    pub fn is_active(&self) -> bool {
        !lock(&self.routing).path.is_empty()
    }

    // -----------------------------------------------------------------------
    // progress
    // -----------------------------------------------------------------------

    pub fn set_progress(&self, progress: Arc<dyn Progress>, reset_message: impl Into<String>) {
        *lock(&self.progress) = progress;
        *lock(&self.reset_message) = reset_message.into();
    }

    pub fn progress(&self) -> Arc<dyn Progress> {
        lock(&self.progress).clone()
    }

    pub fn begin(&self, message: &str) -> Arc<dyn Progress> {
        self.progress().begin(message)
    }

    pub fn doing(&self, message: &str) {
        self.progress().doing(message);
    }

    pub fn done(&self, message: &str) {
        self.progress().done(message);
    }

    pub fn fail(&self, message: &str, code: i32) {
        self.progress().fail(message, code);
    }

    // -----------------------------------------------------------------------
    // steering
    // -----------------------------------------------------------------------

    /// Route toward `target`, dropping the first `skip` nodes of the path.
    ///
    /// With no route the pending path is cleared and the previous target kept.
    pub fn goto(&self, target: D::Node, skip: usize) {
        let _steering = lock(&self.steering);
        self.route(target, skip);
    }

    /// Move the current node without running it, then resume toward the
    /// remembered target if a path was pending.
    pub fn skew(&self, node: D::Node) {
        let _steering = lock(&self.steering);
        let Some(idx) = self.graph.index_of(node) else {
            warn!(node = ?node, "skew to unknown node ignored");
            return;
        };

        let (pending, target) = {
            let mut routing = lock(&self.routing);
            routing.current = idx;
            (!routing.path.is_empty(), routing.target)
        };
        debug!(node = ?node, pending, "skewing");

        self.announce(idx, !pending);
        if pending {
            if let Some(target) = target {
                self.route(self.graph.node(target).id, 0);
            }
        }
    }

    /// Drop any pending path and run `node` immediately in the caller's task.
    ///
    /// Unknown nodes fall back to the root.
    pub async fn jump(&self, node: D::Node) {
        let idx = {
            let _steering = lock(&self.steering);
            let idx = self.graph.index_of(node).unwrap_or(self.graph.root());
            let mut routing = lock(&self.routing);
            routing.path.clear();
            routing.current = idx;
            idx
        };
        debug!(node = ?self.graph.node(idx).id, "jumping");

        self.announce(idx, true);
        let Some(action) = self.graph.node(idx).action else {
            return;
        };
        let Some(driver) = self.driver.upgrade() else {
            return;
        };
        match tokio::spawn(driver.execute(action)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(node = ?node, error = %e, "handler failed after jump"),
            Err(e) => error!(node = ?node, error = %e, "handler panicked after jump"),
        }
    }

    /// Steering lock must be held.
    fn route(&self, target: D::Node, skip: usize) {
        let Some(target_idx) = self.graph.index_of(target) else {
            warn!(target = ?target, "goto unknown node ignored");
            return;
        };

        let current = lock(&self.routing).current;
        let found = self.graph.find_path(current, target);

        let actions = {
            let mut routing = lock(&self.routing);
            routing.path.clear();
            match found {
                Some(path) => {
                    routing.path.extend(path.into_iter().skip(skip));
                    routing.target = Some(target_idx);
                    debug!(
                        from = ?self.graph.node(current).id,
                        target = ?target,
                        path = ?self.graph.ids(routing.path.make_contiguous()),
                        "route planned"
                    );
                }
                None => {
                    warn!(from = ?self.graph.node(current).id, target = ?target, "no route to target");
                }
            }
            let idle = routing.path.is_empty() && !self.in_handler.load(Ordering::Acquire);
            self.idle.send_replace(idle);
            self.graph.count_actions(routing.path.iter().copied())
        };

        let progress = self.progress();
        progress.restart(&lock(&self.reset_message));
        progress.set_max(actions);

        self.wake.notify_one();
    }

    fn announce(&self, idx: usize, is_final: bool) {
        let id = self.graph.node(idx).id;
        trace!(node = ?id, is_final, "entering node");
        let _ = self.arrivals.send(id);
        if let Some(driver) = self.driver.upgrade() {
            driver.entering_state(id, is_final);
        }
    }

    // -----------------------------------------------------------------------
    // execution
    // -----------------------------------------------------------------------

    /// Run one skip-and-execute cycle.
    ///
    /// Returns false while another handler is executing, when nothing is
    /// pending, or when the FSM has been interrupted.
    pub async fn step(&self) -> bool {
        if self.in_handler.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = HandlerGuard(&self.in_handler);
        self.advance().await
    }

    async fn advance(&self) -> bool {
        if self.is_interrupted() {
            return false;
        }
        let Some(driver) = self.driver.upgrade() else {
            return false;
        };

        let idx = loop {
            let (idx, is_final) = {
                let mut routing = lock(&self.routing);
                let Some(idx) = routing.path.pop_front() else {
                    return false;
                };
                routing.current = idx;
                (idx, routing.path.is_empty())
            };
            if self.graph.node(idx).is_state() && !is_final {
                self.announce(idx, false);
                continue;
            }
            self.announce(idx, is_final);
            break idx;
        };

        let node = self.graph.node(idx);
        let Some(action) = node.action else {
            return true;
        };

        debug!(node = ?node.id, "running handler");
        match tokio::spawn(driver.clone().execute(action)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(node = ?node.id, error = %e, "handler failed");
                driver.on_failure(node.id, e).await;
            }
            Err(e) => {
                error!(node = ?node.id, error = %e, "handler panicked, abandoning route");
                lock(&self.routing).path.clear();
            }
        }

        !self.is_interrupted()
    }

    /// Mark the FSM idle if the path has drained.
    fn settle(&self) {
        let routing = lock(&self.routing);
        if routing.path.is_empty() {
            self.idle.send_replace(true);
        }
    }

    // -----------------------------------------------------------------------
    // worker lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the worker task if it is not already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let token = {
            let mut cancel = lock(&self.cancel);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };
        *worker = Some(tokio::spawn(run_worker(
            self.driver.clone(),
            self.wake.clone(),
            token,
        )));
    }

    /// Ask the worker to stop after the handler in flight, if any.
    pub fn interrupt(&self) {
        lock(&self.cancel).cancel();
    }

    /// Interrupt the worker, release all waiters and join the task.
    pub async fn stop(&self) {
        self.interrupt();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "fsm worker ended abnormally");
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        lock(&self.cancel).is_cancelled()
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Wait until no path is pending and the worker is idle.
    ///
    /// Returns false on timeout or when the FSM is stopped.
    pub async fn wait_inactive(&self, timeout: Option<Duration>) -> bool {
        let mut idle = self.idle.subscribe();
        let cancel = self.cancel_token();
        let wait = async move {
            tokio::select! {
                res = idle.wait_for(|idle| *idle) => res.is_ok(),
                _ = cancel.cancelled() => false,
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Wait until the FSM arrives at `node`.
    ///
    /// Subscribes before returning, so arrivals that happen between this call
    /// and the first poll are not missed.
    pub fn wait_for(
        &self,
        node: D::Node,
        timeout: Option<Duration>,
    ) -> impl Future<Output = bool> + Send + '_ {
        let mut arrivals = self.arrivals.subscribe();
        let cancel = self.cancel_token();
        async move {
            if self.current() == node {
                return true;
            }
            let wait = async {
                loop {
                    tokio::select! {
                        arrived = arrivals.recv() => match arrived {
                            Ok(id) if id == node => return true,
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                if self.current() == node {
                                    return true;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return false,
                        },
                        _ = cancel.cancelled() => return false,
                    }
                }
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
                None => wait.await,
            }
        }
    }
}

impl<D: Driver> Drop for Fsm<D> {
    fn drop(&mut self) {
        lock(&self.cancel).cancel();
    }
}

async fn run_worker<D: Driver>(driver: Weak<D>, wake: Arc<Notify>, cancel: CancellationToken) {
    debug!("fsm worker started");
    loop {
        {
            let Some(driver) = driver.upgrade() else {
                break;
            };
            let fsm = driver.fsm();
            while !cancel.is_cancelled() && fsm.step().await {}
            fsm.settle();
        }
        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
        }
    }
    debug!("fsm worker stopped");
}

#[cfg(test)]
mod tests {
    use super::progress::testing::RecordingProgress;
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum N {
        Idle,
        A,
        B,
        Done,
        Back,
        Gate,
        Tail,
        Gated,
        Nested,
        NestedDone,
        Broken,
        Unreachable,
        Panics,
        PanicDone,
        Island,
    }

    struct TestDriver {
        fsm: Fsm<TestDriver>,
        log: Mutex<Vec<String>>,
        gate: Notify,
    }

    impl TestDriver {
        fn new() -> Arc<Self> {
            let graph = Graph::build(
                N::Idle,
                vec![
                    NodeDecl::state(N::Idle, [N::A, N::Gate, N::Nested, N::Broken, N::Panics]),
                    NodeDecl::handler(N::A, [N::B]),
                    NodeDecl::handler(N::B, [N::Done]),
                    NodeDecl::state(N::Done, [N::Back]),
                    NodeDecl::handler(N::Back, [N::Idle]),
                    NodeDecl::handler(N::Gate, [N::Tail]),
                    NodeDecl::handler(N::Tail, [N::Gated]),
                    NodeDecl::state(N::Gated, []),
                    NodeDecl::handler(N::Nested, [N::NestedDone]),
                    NodeDecl::state(N::NestedDone, []),
                    NodeDecl::handler(N::Broken, [N::Unreachable]),
                    NodeDecl::state(N::Unreachable, []),
                    NodeDecl::handler(N::Panics, [N::PanicDone]),
                    NodeDecl::state(N::PanicDone, []),
                    NodeDecl::state(N::Island, []),
                ],
            )
            .unwrap();
            Arc::new_cyclic(|weak| TestDriver {
                fsm: Fsm::new(graph, weak.clone()),
                log: Mutex::new(Vec::new()),
                gate: Notify::new(),
            })
        }

        fn record(&self, line: String) {
            self.log.lock().unwrap().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Driver for TestDriver {
        type Node = N;
        type Action = N;
        type Error = String;

        fn fsm(&self) -> &Fsm<Self> {
            &self.fsm
        }

        async fn execute(self: Arc<Self>, action: N) -> Result<(), String> {
            self.record(format!("run {:?}", action));
            match action {
                N::Gate => {
                    self.gate.notified().await;
                    Ok(())
                }
                N::Nested => {
                    let stepped = self.fsm.step().await;
                    self.record(format!("nested {stepped}"));
                    Ok(())
                }
                N::Broken => Err("broken".to_string()),
                N::Panics => panic!("handler exploded"),
                _ => Ok(()),
            }
        }

        async fn on_failure(self: Arc<Self>, node: N, error: String) {
            self.record(format!("failed {:?}: {}", node, error));
            self.fsm.jump(N::Idle).await;
        }

        fn entering_state(&self, node: N, is_final: bool) {
            self.record(format!("enter {:?} {}", node, is_final));
        }
    }

    const LIMIT: Option<Duration> = Some(Duration::from_secs(5));

    // -----------------------------------------------------------------------
    // routing
    // -----------------------------------------------------------------------

    #[test]
    fn test_goto_replaces_path_and_skips_current() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        assert_eq!(d.fsm.pending(), vec![N::A, N::B, N::Done]);
        assert_eq!(d.fsm.target(), Some(N::Done));
        assert!(d.fsm.is_active());

        d.fsm.goto(N::Gated, 1);
        assert_eq!(d.fsm.pending(), vec![N::Gate, N::Tail, N::Gated]);
        assert_eq!(d.fsm.target(), Some(N::Gated));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_goto_never_mixes_paths() {
        let d = TestDriver::new();
        let to_done = vec![N::A, N::B, N::Done];
        let to_gated = vec![N::Gate, N::Tail, N::Gated];

        let mut steering = Vec::new();
        for i in 0..4 {
            let d = d.clone();
            steering.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let target = if i % 2 == 0 { N::Done } else { N::Gated };
                    d.fsm.goto(target, 1);
                    tokio::task::yield_now().await;
                }
            }));
        }

        let sampler = {
            let d = d.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..2000 {
                    seen.push(d.fsm.pending());
                    tokio::task::yield_now().await;
                }
                seen
            })
        };

        for task in steering {
            task.await.unwrap();
        }
        for snapshot in sampler.await.unwrap() {
            assert!(
                snapshot.is_empty() || snapshot == to_done || snapshot == to_gated,
                "mixed path observed: {snapshot:?}"
            );
        }
        let last = d.fsm.pending();
        match d.fsm.target() {
            Some(N::Done) => assert_eq!(last, to_done),
            Some(N::Gated) => assert_eq!(last, to_gated),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_goto_without_route_clears_path_and_keeps_target() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        d.fsm.goto(N::Island, 1);
        assert!(d.fsm.pending().is_empty());
        assert_eq!(d.fsm.target(), Some(N::Done));
    }

    #[test]
    fn test_goto_resets_progress_with_action_count() {
        let d = TestDriver::new();
        let progress = Arc::new(RecordingProgress::default());
        d.fsm.set_progress(progress.clone(), "Moving");
        d.fsm.goto(N::Done, 1);
        assert_eq!(progress.lines(), vec!["restart:Moving", "max:2"]);
    }

    #[test]
    fn test_skew_with_pending_path_reroutes_to_target() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        d.fsm.skew(N::B);
        assert_eq!(d.fsm.current(), N::B);
        assert_eq!(d.fsm.pending(), vec![N::B, N::Done]);
        assert_eq!(d.lines(), vec!["enter B false"]);
    }

    #[test]
    fn test_skew_without_path_is_final() {
        let d = TestDriver::new();
        d.fsm.skew(N::Done);
        assert_eq!(d.fsm.current(), N::Done);
        assert!(d.fsm.pending().is_empty());
        assert_eq!(d.lines(), vec!["enter Done true"]);
    }

    // -----------------------------------------------------------------------
    // worker
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_worker_runs_actions_in_path_order() {
        let d = TestDriver::new();
        d.fsm.start();
        d.fsm.goto(N::Done, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        assert_eq!(
            d.lines(),
            vec!["enter A false", "run A", "enter B false", "run B", "enter Done true"]
        );
        assert_eq!(d.fsm.current(), N::Done);
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_step_refuses_reentry_from_handler() {
        let d = TestDriver::new();
        d.fsm.start();
        d.fsm.goto(N::NestedDone, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        let lines = d.lines();
        assert!(lines.contains(&"nested false".to_string()));
        assert_eq!(lines.last().unwrap(), "enter NestedDone true");
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_step_with_empty_path_returns_false() {
        let d = TestDriver::new();
        assert!(!d.fsm.step().await);
    }

    #[tokio::test]
    async fn test_failure_is_handed_to_driver() {
        let d = TestDriver::new();
        d.fsm.start();
        d.fsm.goto(N::Unreachable, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        let lines = d.lines();
        assert!(lines.contains(&"failed Broken: broken".to_string()));
        assert!(!lines.contains(&"enter Unreachable true".to_string()));
        assert_eq!(d.fsm.current(), N::Idle);
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_abandons_route() {
        let d = TestDriver::new();
        d.fsm.start();
        d.fsm.goto(N::PanicDone, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        assert!(!d.fsm.is_active());
        assert!(!d.lines().contains(&"enter PanicDone true".to_string()));

        // The worker survives and keeps serving routes.
        d.fsm.skew(N::Idle);
        d.fsm.goto(N::Done, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        assert_eq!(d.fsm.current(), N::Done);
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_jump_clears_path_and_runs_handler() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        d.fsm.jump(N::Back).await;
        assert!(d.fsm.pending().is_empty());
        assert_eq!(d.fsm.current(), N::Back);
        assert_eq!(d.lines(), vec!["enter Back true", "run Back"]);
    }

    #[tokio::test]
    async fn test_interrupt_stops_before_next_handler() {
        let d = TestDriver::new();
        let at_gate = d.fsm.wait_for(N::Gate, LIMIT);
        d.fsm.start();
        d.fsm.goto(N::Gated, 1);
        assert!(at_gate.await);

        d.fsm.interrupt();
        d.gate.notify_one();
        d.fsm.stop().await;

        let lines = d.lines();
        assert!(lines.contains(&"run Gate".to_string()));
        assert!(!lines.contains(&"run Tail".to_string()));
        assert_eq!(d.fsm.pending(), vec![N::Tail, N::Gated]);
    }

    #[tokio::test]
    async fn test_step_after_interrupt_keeps_path_intact() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        d.fsm.interrupt();

        assert!(!d.fsm.step().await);
        assert_eq!(d.fsm.pending(), vec![N::A, N::B, N::Done]);
        assert_eq!(d.fsm.current(), N::Idle);
        assert!(d.lines().is_empty());

        // A restarted worker picks the route up from its first action.
        d.fsm.start();
        assert!(d.fsm.wait_inactive(LIMIT).await);
        assert_eq!(
            d.lines(),
            vec!["enter A false", "run A", "enter B false", "run B", "enter Done true"]
        );
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_reports_arrival_and_timeout() {
        let d = TestDriver::new();
        let arrived = d.fsm.wait_for(N::Done, LIMIT);
        d.fsm.start();
        d.fsm.goto(N::Done, 1);
        assert!(arrived.await);

        assert!(!d.fsm.wait_for(N::Island, Some(Duration::from_millis(50))).await);
        d.fsm.stop().await;
    }

    #[tokio::test]
    async fn test_wait_inactive_returns_after_stop() {
        let d = TestDriver::new();
        d.fsm.goto(N::Done, 1);
        d.fsm.interrupt();
        assert!(!d.fsm.wait_inactive(LIMIT).await);
    }

    #[tokio::test]
    async fn test_worker_restarts_after_stop() {
        let d = TestDriver::new();
        d.fsm.start();
        d.fsm.stop().await;
        d.fsm.start();
        d.fsm.goto(N::Done, 1);
        assert!(d.fsm.wait_inactive(LIMIT).await);
        assert_eq!(d.fsm.current(), N::Done);
        d.fsm.stop().await;
    }
}
