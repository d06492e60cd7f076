//! The single-threaded cluster-state task executor.
//!
//! All state mutation in this crate funnels through one `tokio` task
//! reading an `mpsc` channel: while a task runs, nothing else touches the
//! state, so every [`crate::cluster_state_task::ClusterStateTask`] may
//! treat the state handed to `execute` as frozen.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::cluster_state::ClusterState;
use crate::cluster_state_task::{ClusterStateTask, MasterRequirement, Priority};
use crate::error::ClusterResult;
use crate::node::NodeId;

tokio::task_local! {
    static ON_EXECUTOR: ();
}

struct QueuedTask {
    priority: Priority,
    sequence: u64,
    task: Arc<dyn ClusterStateTask>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; within a priority, lower sequence
        // (submitted earlier) first — i.e. FIFO per class.
        self.priority
            .cmp(&other.priority)
            .then_with(|| Reverse(self.sequence).cmp(&Reverse(other.sequence)))
    }
}

/// Owns the current [`ClusterState`] and serializes every mutation to it
/// through a background task.
pub struct ClusterStateService {
    state: watch::Sender<Arc<ClusterState>>,
    submit: mpsc::UnboundedSender<QueuedTask>,
    local_id: NodeId,
    sequence: AtomicU64,
    shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl ClusterStateService {
    /// Start the executor task for `local_id`, owning `initial`.
    #[must_use]
    pub fn start(local_id: NodeId, initial: ClusterState) -> Arc<Self> {
        let (state_tx, _state_rx) = watch::channel(Arc::new(initial));
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            state: state_tx,
            submit: submit_tx,
            local_id,
            sequence: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(true),
        });

        let worker = Arc::clone(&service);
        tokio::spawn(async move { worker.run(submit_rx).await });

        service
    }

    /// The currently visible state.
    #[must_use]
    pub fn current(&self) -> Arc<ClusterState> {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.state.subscribe()
    }

    /// Submit a task for execution. Returns immediately; the task runs
    /// asynchronously on the executor, honoring its declared priority.
    pub fn submit(&self, task: Arc<dyn ClusterStateTask>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedTask {
            priority: task.priority(),
            sequence,
            task,
        };
        if self.submit.send(queued).is_err() {
            warn!("cluster-state executor is shut down, dropping submitted task");
        }
    }

    /// Stop the executor. Already-queued tasks are abandoned.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Panics outside tests if called off the executor task; used by
    /// code paths (like [`crate::discovery`]'s rejoin action) that must
    /// only ever run from within a submitted task.
    pub fn assert_on_executor() {
        debug_assert!(
            ON_EXECUTOR.try_with(|()| ()).is_ok(),
            "must be called from within the cluster-state executor"
        );
    }

    async fn run(self: Arc<Self>, mut submit_rx: mpsc::UnboundedReceiver<QueuedTask>) {
        // A small buffer reorders arriving tasks by priority without
        // requiring the channel itself to be priority-aware.
        let mut pending: BinaryHeap<QueuedTask> = BinaryHeap::new();

        loop {
            if pending.is_empty() {
                tokio::select! {
                    () = self.shutdown.notified() => return,
                    maybe_task = submit_rx.recv() => {
                        match maybe_task {
                            Some(task) => pending.push(task),
                            None => return,
                        }
                    }
                }
            }

            // Drain whatever else has arrived without blocking, so a
            // burst of submissions gets priority-ordered before any of
            // them runs.
            while let Ok(task) = submit_rx.try_recv() {
                pending.push(task);
            }

            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            if let Some(queued) = pending.pop() {
                ON_EXECUTOR.scope((), self.run_one(queued.task)).await;
            }
        }
    }

    async fn run_one(&self, task: Arc<dyn ClusterStateTask>) {
        let current = self.current();

        if task.master_requirement() == MasterRequirement::Required && !current.nodes.local_is_master() {
            debug!(source = task.source(), "task requires mastership, local is not master");
            task.on_no_longer_master().await;
            return;
        }

        match task.execute(&current).await {
            Ok(new_state) => {
                debug!(
                    source = task.source(),
                    old_version = current.version,
                    new_version = new_state.version,
                    "cluster-state task applied"
                );
                let new_state = Arc::new(new_state);
                let _ = self.state.send(new_state.clone());
                task.cluster_state_processed(&current, &new_state).await;
                if new_state.nodes.master_id.as_ref() == Some(&self.local_id) && !current.nodes.local_is_master() {
                    info!(node = %self.local_id, "local node is now master");
                }
            }
            Err(error) => {
                warn!(source = task.source(), error = %error, "cluster-state task failed");
                task.on_failure(&error).await;
            }
        }
    }
}

impl std::fmt::Debug for ClusterStateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStateService")
            .field("local_id", &self.local_id)
            .field("current_version", &self.current().version)
            .finish_non_exhaustive()
    }
}

/// Convenience blanket impl so simple closures can be submitted as tasks
/// in tests without a named type for every scenario.
pub struct FnTask<F> {
    source: &'static str,
    priority: Priority,
    master_requirement: MasterRequirement,
    execute: F,
}

impl<F> FnTask<F>
where
    F: Fn(&ClusterState) -> ClusterResult<ClusterState> + Send + Sync,
{
    /// Wrap `execute` as a task named `source`.
    #[must_use]
    pub fn new(source: &'static str, priority: Priority, master_requirement: MasterRequirement, execute: F) -> Self {
        Self {
            source,
            priority,
            master_requirement,
            execute,
        }
    }
}

#[async_trait::async_trait]
impl<F> ClusterStateTask for FnTask<F>
where
    F: Fn(&ClusterState) -> ClusterResult<ClusterState> + Send + Sync,
{
    fn source(&self) -> &str {
        self.source
    }

    fn master_requirement(&self) -> MasterRequirement {
        self.master_requirement
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn execute(&self, current: &ClusterState) -> Result<ClusterState, crate::error::ClusterError> {
        (self.execute)(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeDescriptor;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9700".parse().unwrap()
    }

    #[tokio::test]
    async fn submitted_task_mutates_visible_state() {
        let local = NodeDescriptor::new("a", addr());
        let initial = ClusterState::unformed("test", local);
        let service = ClusterStateService::start(NodeId::from("a"), initial);

        service.submit(Arc::new(FnTask::new(
            "elect-self",
            Priority::Immediate,
            MasterRequirement::NotRequired,
            |current| {
                let mut next = current.clone();
                next.version = next.next_version();
                next.nodes.master_id = Some(NodeId::from("a"));
                next.blocks.remove(crate::cluster_state::NO_MASTER_BLOCK);
                Ok(next)
            },
        )));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.current().nodes.local_is_master());
    }

    #[tokio::test]
    async fn master_required_task_skips_when_not_master() {
        let local = NodeDescriptor::new("a", addr());
        let initial = ClusterState::unformed("test", local);
        let service = ClusterStateService::start(NodeId::from("a"), initial);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        service.submit(Arc::new(FnTask::new(
            "requires-master",
            Priority::Normal,
            MasterRequirement::Required,
            move |current| {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(current.clone())
            },
        )));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn higher_priority_task_runs_before_lower_when_queued_together() {
        let local = NodeDescriptor::new("a", addr());
        let initial = ClusterState::unformed("test", local);
        let service = ClusterStateService::start(NodeId::from("a"), initial);

        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        for (label, priority) in [("normal", Priority::Normal), ("immediate", Priority::Immediate)] {
            let order = Arc::clone(&order);
            service.submit(Arc::new(FnTask::new(
                label,
                priority,
                MasterRequirement::NotRequired,
                move |current| {
                    let order = Arc::clone(&order);
                    tokio::spawn(async move {
                        order.lock().await.push(label);
                    });
                    Ok(current.clone())
                },
            )));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = order.lock().await.clone();
        assert_eq!(recorded.first(), Some(&"immediate"));
    }
}
