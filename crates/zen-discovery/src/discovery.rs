//! The discovery controller: join-thread lifecycle, `find_master()`,
//! pending-state draining, fault-reaction tasks, split-brain resolution,
//! and rejoin.
//!
//! Every public entry point that mutates cluster state does so by
//! constructing a [`ClusterStateTask`] and submitting it to the
//! [`ClusterStateService`]; nothing here touches the current state outside
//! of a task's `execute`/`cluster_state_processed` hooks. Control methods
//! for the join thread (`start_if_not_running` and friends) assert they
//! run on the executor, since their ordering guarantees depend on it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cluster_state::{ClusterState, NO_MASTER_BLOCK};
use crate::cluster_state_service::ClusterStateService;
use crate::cluster_state_task::{ClusterStateTask, MasterRequirement, Priority};
use crate::config::ClusterConfig;
use crate::elect_master::{elect_master, has_enough_master_nodes, ElectionFilter};
use crate::error::{ClusterError, ClusterResult};
use crate::fault_detection::{
    install_heartbeat_handler, AnotherMasterCounter, BoxFuture, MasterFaultDetection, NodesFaultDetection,
};
use crate::membership::{
    install_join_handler, install_leave_handler, install_validate_join_handler, MembershipClient, ValidateJoinOutcome,
};
use crate::node::{NodeDescriptor, NodeId};
use crate::ping::{PingService, UnicastHostsProvider};
use crate::publish::{install_publish_handler, AckListener, PublishClusterState};
use crate::transport::{Handler, Transport};

/// Wire action a forced-rejoin request is sent on.
pub const REJOIN_ACTION: &str = "discovery.rejoin";

/// Override applied to a subset of dynamic settings via [`DiscoveryController::reload`].
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    /// New `minimum_master_nodes`, if changing.
    pub minimum_master_nodes: Option<usize>,
    /// New `rejoin_on_master_gone`, if changing.
    pub rejoin_on_master_gone: Option<bool>,
}

/// Outcome reported back to whoever enqueued a pending-state entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry was consumed by the drain, successfully or as a
    /// superseded/stale member of its run.
    Processed,
    /// The entry's master differed from the one currently believed in.
    Rejected(String),
}

type AckFn = Arc<dyn Fn(AckOutcome) + Send + Sync>;

struct PendingStateEntry {
    state: ClusterState,
    ack: AckFn,
}

/// Orchestrates unicast discovery, election, membership, fault detection,
/// and publish into a single running node.
pub struct DiscoveryController {
    local: NodeDescriptor,
    config: RwLock<ClusterConfig>,
    transport: Arc<dyn Transport>,
    state_service: Arc<ClusterStateService>,
    ping: Arc<PingService>,
    membership_client: Arc<MembershipClient>,
    publisher: Arc<PublishClusterState>,
    master_fd: Arc<MasterFaultDetection>,
    nodes_fd: Arc<NodesFaultDetection>,
    another_master_counter: Arc<AnotherMasterCounter>,
    join_generation: AtomicU64,
    join_running: AtomicBool,
    pending_states: tokio::sync::Mutex<VecDeque<PendingStateEntry>>,
    cluster_join_counter: AtomicU64,
    has_joined_once: AtomicBool,
}

impl DiscoveryController {
    /// Build and start a controller for `local`, installing every wire
    /// handler on `transport` and kicking off the join thread.
    #[must_use]
    pub async fn start(
        local: NodeDescriptor,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        providers: Vec<Arc<dyn UnicastHostsProvider>>,
    ) -> Arc<Self> {
        let initial = ClusterState::unformed(config.cluster_name.clone(), local.clone());
        let state_service = ClusterStateService::start(local.id.clone(), initial);

        let ping = PingService::new(
            local.clone(),
            config.cluster_name.clone(),
            Arc::clone(&transport),
            config.discovery.unicast_hosts.clone(),
            providers,
            config.discovery.concurrent_connects,
            config.ping_timeout * 2,
        );
        ping.install_handlers();

        let membership_client = Arc::new(MembershipClient::new(
            Arc::clone(&transport),
            config.cluster_name.clone(),
            config.join_retry_attempts,
            config.join_retry_delay,
        ));

        let publisher = Arc::new(PublishClusterState::new(Arc::clone(&transport), config.ping_timeout));

        let master_fd = MasterFaultDetection::new(
            Arc::clone(&transport),
            local.id.clone(),
            config.fault_detection.interval,
            config.fault_detection.retry_count,
            config.ping_timeout,
        );
        let nodes_fd = NodesFaultDetection::new(
            Arc::clone(&transport),
            local.id.clone(),
            config.fault_detection.interval,
            config.fault_detection.retry_count,
            config.ping_timeout,
        );
        let another_master_counter = AnotherMasterCounter::new();

        let controller = Arc::new(Self {
            local,
            config: RwLock::new(config),
            transport,
            state_service,
            ping,
            membership_client,
            publisher,
            master_fd,
            nodes_fd,
            another_master_counter,
            join_generation: AtomicU64::new(0),
            join_running: AtomicBool::new(false),
            pending_states: tokio::sync::Mutex::new(VecDeque::new()),
            cluster_join_counter: AtomicU64::new(0),
            has_joined_once: AtomicBool::new(false),
        });

        controller.install_wire_handlers();
        controller.spawn_ping_snapshot_sync();
        controller
            .state_service
            .submit(Arc::new(StartJoinThreadTask { controller: Arc::clone(&controller) }));

        controller
    }

    /// The currently visible cluster state.
    #[must_use]
    pub fn current_state(&self) -> Arc<ClusterState> {
        self.state_service.current()
    }

    /// Subscribe to cluster-state changes.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<ClusterState>> {
        self.state_service.subscribe()
    }

    /// Number of times this node has (re)joined a cluster since starting.
    #[must_use]
    pub fn cluster_join_counter(&self) -> u64 {
        self.cluster_join_counter.load(Ordering::SeqCst)
    }

    /// Apply dynamic configuration changes, serialized against elections
    /// via the state executor.
    pub fn reload(self: &Arc<Self>, update: ConfigUpdate) {
        self.state_service
            .submit(Arc::new(ReloadSettingsTask { controller: Arc::clone(self), update }));
    }

    /// Stop join-thread activity, fault detectors, and the state executor,
    /// sending a best-effort leave notice to the believed master first.
    pub async fn shutdown(&self) {
        self.master_fd.stop();
        self.nodes_fd.stop();

        let config = self.config_snapshot();
        if config.send_leave_request {
            let current = self.current_state();
            if let Some(master) = current.nodes.master() {
                if master.id != self.local.id {
                    self.membership_client
                        .send_leave_request(master, &self.local, config.ping_timeout)
                        .await;
                }
            }
        }

        self.state_service.shutdown();
    }

    // Only ever written from within a state-executor task, so a poisoned
    // lock here means a prior task panicked mid-write; there is no
    // recovery path, so surfacing it as a crash is correct.
    #[allow(clippy::expect_used)]
    fn config_snapshot(&self) -> ClusterConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn election_filter(&self) -> ElectionFilter {
        self.config_snapshot().master_election.into()
    }

    fn spawn_ping_snapshot_sync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut rx = self.state_service.subscribe();
        tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                let believed = state.nodes.master().cloned();
                this.ping
                    .update_local_snapshot(believed, this.has_joined_once.load(Ordering::SeqCst))
                    .await;
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn install_wire_handlers(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);

        install_validate_join_handler(&self.transport, self.config_snapshot().cluster_name);

        {
            let weak_join = weak.clone();
            let weak_validate = weak.clone();
            install_join_handler(
                &self.transport,
                self.config_snapshot().cluster_name,
                self.config_snapshot().ping_timeout,
                move |candidate| {
                    let Some(this) = weak_validate.upgrade() else {
                        return ValidateJoinOutcome::Reject("node is shutting down".to_owned());
                    };
                    if !this.current_state().nodes.local_is_master() {
                        return ValidateJoinOutcome::NotMaster;
                    }
                    let _ = candidate;
                    ValidateJoinOutcome::Accept
                },
                move |candidate: NodeDescriptor| {
                    if let Some(this) = weak_join.upgrade() {
                        this.state_service
                            .submit(Arc::new(JoinAcceptedTask { controller: Arc::clone(&this), candidate }));
                    }
                },
            );
        }

        {
            let weak_leave = weak.clone();
            install_leave_handler(&self.transport, move |leaving: NodeDescriptor| {
                let Some(this) = weak_leave.upgrade() else { return };
                let current = this.current_state();
                if current.nodes.master_id.as_ref() == Some(&leaving.id) {
                    this.state_service.submit(Arc::new(MasterGoneTask {
                        controller: Arc::clone(&this),
                        lost_master: leaving.id,
                        reason: "received leave notice from believed master".to_owned(),
                    }));
                } else {
                    this.state_service.submit(Arc::new(RemoveNodeTask {
                        controller: Arc::clone(&this),
                        target: leaving.id,
                        reason: "received leave notice".to_owned(),
                    }));
                }
            });
        }

        {
            let weak_publish = weak.clone();
            install_publish_handler(&self.transport, move |state: ClusterState| {
                let Some(this) = weak_publish.upgrade() else { return };
                let expected = this.config_snapshot().cluster_name;
                if state.cluster_name != expected {
                    warn!(expected, actual = %state.cluster_name, "dropping published state with mismatched cluster name");
                    return;
                }
                tokio::spawn(async move {
                    if this.current_state().nodes.local_is_master() {
                        this.state_service.submit(Arc::new(HandleForeignMasterTask {
                            controller: Arc::clone(&this),
                            signal: ForeignMasterSignal::Published(state),
                        }));
                        return;
                    }
                    let version = state.version;
                    let ack: AckFn = Arc::new(move |outcome| {
                        debug!(version, ?outcome, "pending state entry resolved");
                    });
                    this.pending_states.lock().await.push_back(PendingStateEntry { state, ack });
                    this.state_service
                        .submit(Arc::new(DrainPendingStatesTask { controller: Arc::clone(&this) }));
                });
            });
        }

        {
            let weak_member = weak.clone();
            let weak_status = weak.clone();
            let weak_foreign = weak.clone();
            let counter = Arc::clone(&self.another_master_counter);
            let max_pings = self.config_snapshot().max_pings_from_another_master;
            install_heartbeat_handler(
                &self.transport,
                move |from| weak_member.upgrade().is_some_and(|this| this.current_state().nodes.contains(from)),
                move || {
                    weak_status.upgrade().map_or((false, 0), |this| {
                        let state = this.current_state();
                        (state.nodes.local_is_master(), state.version)
                    })
                },
                counter,
                max_pings,
                move |peer, version| {
                    if let Some(this) = weak_foreign.upgrade() {
                        this.state_service.submit(Arc::new(HandleForeignMasterTask {
                            controller: Arc::clone(&this),
                            signal: ForeignMasterSignal::Heard { peer, version },
                        }));
                    }
                },
            );
        }

        {
            let weak_rejoin = weak.clone();
            let handler: Handler = Arc::new(move |from, _payload| {
                let weak_rejoin = weak_rejoin.clone();
                Box::pin(async move {
                    if let Some(this) = weak_rejoin.upgrade() {
                        info!(%from, "received forced rejoin request");
                        this.state_service.submit(Arc::new(RejoinTask { controller: Arc::clone(&this) }));
                    }
                    Ok(Bytes::new())
                })
            });
            self.transport.register_handler(REJOIN_ACTION, handler);
        }
    }

    // --- join-thread control; executor-only ---

    fn start_if_not_running(self: &Arc<Self>) {
        ClusterStateService::assert_on_executor();
        if self.join_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.join_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_join_thread(generation).await });
    }

    fn mark_done(&self) {
        ClusterStateService::assert_on_executor();
        self.join_running.store(false, Ordering::SeqCst);
    }

    fn mark_done_and_start_new(self: &Arc<Self>) {
        self.mark_done();
        self.start_if_not_running();
    }

    /// Invalidates any in-flight join-thread iteration (it observes a
    /// stale generation at its next check, even mid-RPC) and starts a
    /// fresh one. Used only by rejoin, which must win over whatever the
    /// join thread happened to be doing.
    fn stop_running_and_rejoin(self: &Arc<Self>) {
        ClusterStateService::assert_on_executor();
        self.join_generation.fetch_add(1, Ordering::SeqCst);
        self.join_running.store(false, Ordering::SeqCst);
        self.start_if_not_running();
    }

    fn rejoin_state(&self, current: &ClusterState) -> ClusterState {
        ClusterStateService::assert_on_executor();
        let mut next = current.clone();
        next.version = next.next_version();
        next.nodes.master_id = None;
        next.blocks.add(NO_MASTER_BLOCK);
        next
    }

    fn rejoin_side_effects(self: &Arc<Self>) {
        ClusterStateService::assert_on_executor();
        self.master_fd.stop();
        self.nodes_fd.stop();
        self.stop_running_and_rejoin();
    }

    async fn run_join_thread(self: Arc<Self>, generation: u64) {
        loop {
            if self.join_generation.load(Ordering::SeqCst) != generation || !self.join_running.load(Ordering::SeqCst)
            {
                return;
            }

            let Some(candidate) = self.find_master().await else {
                continue;
            };

            if self.join_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            if candidate.id == self.local.id {
                self.state_service.submit(Arc::new(ElectSelfTask { controller: Arc::clone(&self) }));
                return;
            }

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let config = this.config_snapshot();
                match this
                    .membership_client
                    .send_join_request_blocking(&candidate, &this.local, config.join_timeout)
                    .await
                {
                    Ok(()) => {
                        this.state_service.submit(Arc::new(ElectedOtherFinalizeTask {
                            controller: Arc::clone(&this),
                            target: candidate,
                        }));
                    }
                    Err(e) => {
                        warn!(master = %candidate.id, error = %e, "join attempt exhausted retries");
                        this.state_service
                            .submit(Arc::new(RestartJoinThreadTask { controller: Arc::clone(&this) }));
                    }
                }
            });
            return;
        }
    }

    /// Run one `ping_and_wait` round and reduce the responses to the next
    /// join-thread action: prefer a peer's believed master; otherwise
    /// elect locally if quorum allows, preferring already-joined peers;
    /// otherwise report nothing found.
    async fn find_master(&self) -> Option<NodeDescriptor> {
        let config = self.config_snapshot();
        let filter = self.election_filter();
        let current = self.current_state();
        let known_master_eligible: Vec<NodeDescriptor> = current.nodes.master_eligible().cloned().collect();

        let responses = self.ping.ping_and_wait(config.ping_timeout, &known_master_eligible).await;

        let mut ping_masters: Vec<NodeDescriptor> = Vec::new();
        let mut seen_masters: HashSet<NodeId> = HashSet::new();
        let mut active_nodes: Vec<NodeDescriptor> = vec![self.local.clone()];
        let mut seen_active: HashSet<NodeId> = HashSet::from([self.local.id.clone()]);
        let mut joined_once: HashSet<NodeId> = HashSet::new();
        if self.has_joined_once.load(Ordering::SeqCst) {
            joined_once.insert(self.local.id.clone());
        }

        for response in &responses {
            if seen_active.insert(response.responder.id.clone()) {
                active_nodes.push(response.responder.clone());
            }
            if response.has_joined_once {
                joined_once.insert(response.responder.id.clone());
            }
            if let Some(master) = &response.believed_master {
                if master.id != self.local.id && seen_masters.insert(master.id.clone()) {
                    ping_masters.push(master.clone());
                }
            }
        }

        if !ping_masters.is_empty() {
            return elect_master(ping_masters.iter(), filter).cloned();
        }

        if !has_enough_master_nodes(active_nodes.iter(), config.minimum_master_nodes, filter) {
            return None;
        }

        let joined_subset: Vec<&NodeDescriptor> =
            active_nodes.iter().filter(|n| joined_once.contains(&n.id)).collect();
        if has_enough_master_nodes(joined_subset.iter().copied(), config.minimum_master_nodes, filter) {
            if let Some(winner) = elect_master(joined_subset, filter) {
                return Some(winner.clone());
            }
        }

        elect_master(active_nodes.iter(), filter).cloned()
    }

    fn spawn_publish(self: &Arc<Self>, state: ClusterState) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let listener = AckListener::new();
            if let Err(e) = this.publisher.publish(&state, &this.local.id, &listener).await {
                warn!(error = %e, "publish failed");
            }
        });
    }

    fn spawn_rejoin_request(self: &Arc<Self>, target: NodeDescriptor) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.transport.connect(&target).await.is_err() {
                return;
            }
            let timeout = this.config_snapshot().ping_timeout;
            if let Ok(payload) = bincode::serialize(&this.local.id) {
                let _ = this.transport.send(&target.id, REJOIN_ACTION, Bytes::from(payload), timeout).await;
            }
            this.transport.disconnect(&target.id).await;
        });
    }

    fn reseed_nodes_fd(self: &Arc<Self>, state: &ClusterState) {
        let peers: Vec<NodeDescriptor> =
            state.nodes.iter().filter(|n| n.id != self.local.id).cloned().collect();
        let controller = Arc::clone(self);
        let status_controller = Arc::clone(self);
        self.nodes_fd.reseed(
            peers,
            move || {
                let state = status_controller.current_state();
                (state.nodes.local_is_master(), state.version)
            },
            move |failed, reason| {
                let controller = Arc::clone(&controller);
                Box::pin(async move {
                    controller
                        .state_service
                        .submit(Arc::new(RemoveNodeTask { controller: Arc::clone(&controller), target: failed, reason }));
                }) as BoxFuture
            },
        );
    }

    fn watch_master_fd(self: &Arc<Self>, master: NodeDescriptor) {
        let controller = Arc::clone(self);
        self.master_fd.watch(master, move |lost_master, reason| {
            let controller = Arc::clone(&controller);
            Box::pin(async move {
                controller.state_service.submit(Arc::new(MasterGoneTask {
                    controller: Arc::clone(&controller),
                    lost_master,
                    reason,
                }));
            }) as BoxFuture
        });
    }
}

#[allow(clippy::expect_used)]
fn pop_same_master_run(queue: &mut VecDeque<PendingStateEntry>) -> Option<Vec<PendingStateEntry>> {
    let first = queue.pop_front()?;
    let master = first.state.nodes.master_id.clone();
    let mut run = vec![first];
    while let Some(front) = queue.front() {
        if front.state.nodes.master_id == master {
            // `front()` just confirmed an entry is there; nothing else
            // drains this queue concurrently.
            run.push(queue.pop_front().expect("front just peeked"));
        } else {
            break;
        }
    }
    Some(run)
}

struct StartJoinThreadTask {
    controller: Arc<DiscoveryController>,
}

#[async_trait]
impl ClusterStateTask for StartJoinThreadTask {
    fn source(&self) -> &str {
        "start-join-thread"
    }

    fn priority(&self) -> Priority {
        Priority::Immediate
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        Ok(current.clone())
    }

    async fn cluster_state_processed(&self, _old: &ClusterState, _new: &ClusterState) {
        self.controller.start_if_not_running();
    }
}

struct RestartJoinThreadTask {
    controller: Arc<DiscoveryController>,
}

#[async_trait]
impl ClusterStateTask for RestartJoinThreadTask {
    fn source(&self) -> &str {
        "restart-join-thread"
    }

    fn priority(&self) -> Priority {
        Priority::Immediate
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        Ok(current.clone())
    }

    async fn cluster_state_processed(&self, _old: &ClusterState, _new: &ClusterState) {
        self.controller.mark_done_and_start_new();
    }
}

/// Elects the local node master if no master is currently set.
struct ElectSelfTask {
    controller: Arc<DiscoveryController>,
}

#[async_trait]
impl ClusterStateTask for ElectSelfTask {
    fn source(&self) -> &str {
        "elect-self"
    }

    fn priority(&self) -> Priority {
        Priority::Immediate
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if current.nodes.master_id.is_some() {
            return Ok(current.clone());
        }
        let mut next = current.clone();
        next.version = next.next_version();
        next.nodes.master_id = Some(self.controller.local.id.clone());
        next.blocks.remove(NO_MASTER_BLOCK);
        Ok(next)
    }

    async fn cluster_state_processed(&self, _old: &ClusterState, new: &ClusterState) {
        if new.nodes.local_is_master() {
            info!(node = %self.controller.local.id, "elected self as master");
            self.controller.has_joined_once.store(true, Ordering::SeqCst);
            self.controller.cluster_join_counter.fetch_add(1, Ordering::SeqCst);
            self.controller.reseed_nodes_fd(new);
            self.controller.mark_done();
        } else {
            debug!("lost election race to a concurrently published master, resuming pinging");
            self.controller.mark_done_and_start_new();
        }
    }
}

/// Finalizes a successful outgoing join: the node becomes a follower of
/// `target` unless another master was recorded in the meantime.
struct ElectedOtherFinalizeTask {
    controller: Arc<DiscoveryController>,
    target: NodeDescriptor,
}

#[async_trait]
impl ClusterStateTask for ElectedOtherFinalizeTask {
    fn source(&self) -> &str {
        "elected-other-finalize"
    }

    fn priority(&self) -> Priority {
        Priority::Immediate
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if let Some(existing) = &current.nodes.master_id {
            if existing != &self.target.id {
                return Err(ClusterError::NotMaster(self.controller.local.id.clone(), Some(existing.clone())));
            }
            return Ok(current.clone());
        }
        let mut next = current.clone();
        next.version = next.next_version();
        next.nodes.master_id = Some(self.target.id.clone());
        next.blocks.remove(NO_MASTER_BLOCK);
        next.nodes.insert(self.target.clone());
        Ok(next)
    }

    async fn on_failure(&self, error: &ClusterError) {
        warn!(target = %self.target.id, error = %error, "join result rejected, resuming pinging");
        self.controller.mark_done_and_start_new();
    }

    async fn cluster_state_processed(&self, _old: &ClusterState, _new: &ClusterState) {
        info!(master = %self.target.id, "joined cluster as follower");
        self.controller.has_joined_once.store(true, Ordering::SeqCst);
        self.controller.watch_master_fd(self.target.clone());
        self.controller.mark_done();
    }
}

/// Master-side acceptance of a validated join.
struct JoinAcceptedTask {
    controller: Arc<DiscoveryController>,
    candidate: NodeDescriptor,
}

#[async_trait]
impl ClusterStateTask for JoinAcceptedTask {
    fn source(&self) -> &str {
        "join-accepted"
    }

    fn master_requirement(&self) -> MasterRequirement {
        MasterRequirement::Required
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if current.nodes.contains(&self.candidate.id) {
            return Ok(current.clone());
        }
        let mut next = current.clone();
        next.nodes.insert(self.candidate.clone());
        next.version = next.next_version();
        Ok(next)
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        if old.version == new.version {
            return;
        }
        info!(node = %self.candidate.id, "node joined cluster");
        self.controller.reseed_nodes_fd(new);
        self.controller.spawn_publish(new.clone());
    }
}

/// Removes a node from the master's view, surrendering mastership if
/// quorum is lost. Shared by node-failure detection and a follower's
/// leave notice received by the master.
struct RemoveNodeTask {
    controller: Arc<DiscoveryController>,
    target: NodeId,
    reason: String,
}

#[async_trait]
impl ClusterStateTask for RemoveNodeTask {
    fn source(&self) -> &str {
        "remove-node"
    }

    fn master_requirement(&self) -> MasterRequirement {
        MasterRequirement::Required
    }

    fn priority(&self) -> Priority {
        Priority::Immediate
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if !current.nodes.contains(&self.target) {
            return Ok(current.clone());
        }
        let mut next = current.clone();
        next.nodes.remove(&self.target);
        let config = self.controller.config_snapshot();
        let filter = self.controller.election_filter();
        if !has_enough_master_nodes(next.nodes.master_eligible(), config.minimum_master_nodes, filter) {
            return Ok(self.controller.rejoin_state(&next));
        }
        next.version = next.next_version();
        Ok(next)
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        if old.version == new.version {
            return;
        }
        warn!(node = %self.target, reason = %self.reason, "node removed from cluster");
        if new.has_no_master() {
            self.controller.rejoin_side_effects();
        } else {
            self.controller.reseed_nodes_fd(new);
            self.controller.spawn_publish(new.clone());
        }
    }
}

/// Follower-side reaction to losing contact with the believed master.
struct MasterGoneTask {
    controller: Arc<DiscoveryController>,
    lost_master: NodeId,
    reason: String,
}

#[async_trait]
impl ClusterStateTask for MasterGoneTask {
    fn source(&self) -> &str {
        "master-gone"
    }

    fn priority(&self) -> Priority {
        Priority::Urgent
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if current.nodes.master_id.as_ref() != Some(&self.lost_master) {
            return Ok(current.clone());
        }

        let config = self.controller.config_snapshot();
        let filter = self.controller.election_filter();

        if !config.rejoin_on_master_gone {
            let candidates: Vec<&NodeDescriptor> =
                current.nodes.iter().filter(|n| n.id != self.lost_master).collect();
            if let Some(winner) = elect_master(candidates, filter) {
                let mut next = current.clone();
                next.version = next.next_version();
                next.nodes.master_id = Some(winner.id.clone());
                next.blocks.remove(NO_MASTER_BLOCK);
                return Ok(next);
            }
        }

        Ok(self.controller.rejoin_state(current))
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        warn!(master = %self.lost_master, reason = %self.reason, "master fault detected");
        self.controller.pending_states.lock().await.clear();

        if new.has_no_master() {
            self.controller.rejoin_side_effects();
        } else if new.nodes.local_is_master() {
            info!("promoted self to master after master loss");
            self.controller.has_joined_once.store(true, Ordering::SeqCst);
            self.controller.cluster_join_counter.fetch_add(1, Ordering::SeqCst);
            self.controller.reseed_nodes_fd(new);
            self.controller.mark_done();
        } else if let Some(new_master) = new.nodes.master() {
            if Some(&new_master.id) != old.nodes.master_id.as_ref() {
                self.controller.watch_master_fd(new_master.clone());
            }
        }
    }
}

/// Drains one same-master run from the pending-states queue and decides
/// whether to install it, ignore it as stale, or reject it as a
/// master mismatch.
struct DrainPendingStatesTask {
    controller: Arc<DiscoveryController>,
}

#[async_trait]
impl ClusterStateTask for DrainPendingStatesTask {
    fn source(&self) -> &str {
        "drain-pending-states"
    }

    fn priority(&self) -> Priority {
        Priority::Urgent
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        let run = {
            let mut queue = self.controller.pending_states.lock().await;
            pop_same_master_run(&mut queue)
        };
        let Some(run) = run else {
            return Ok(current.clone());
        };

        // `run` always holds at least the entry `pop_same_master_run` popped first.
        #[allow(clippy::expect_used)]
        let selected_idx =
            run.iter().enumerate().max_by_key(|(_, e)| e.state.version).map(|(i, _)| i).expect("run is non-empty");

        for (i, entry) in run.iter().enumerate() {
            if i != selected_idx {
                (entry.ack)(AckOutcome::Processed);
            }
        }
        let selected = &run[selected_idx];
        let run_master = selected.state.nodes.master_id.clone();

        if current.nodes.master_id.is_some() && current.nodes.master_id != run_master {
            (selected.ack)(AckOutcome::Rejected("published state is from an unrecognized master".to_owned()));
            warn!(expected = ?current.nodes.master_id, actual = ?run_master, "rejecting published state");
            return Ok(current.clone());
        }

        if !current.blocks.has_no_master_block() && current.version >= selected.state.version {
            (selected.ack)(AckOutcome::Processed);
            return Ok(current.clone());
        }

        (selected.ack)(AckOutcome::Processed);
        Ok(selected.state.clone())
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        if old.version != new.version || old.nodes.master_id != new.nodes.master_id {
            if old.blocks.has_no_master_block() {
                self.controller.has_joined_once.store(true, Ordering::SeqCst);
                self.controller.cluster_join_counter.fetch_add(1, Ordering::SeqCst);
            }
            if old.nodes.master_id != new.nodes.master_id {
                if let Some(master) = new.nodes.master() {
                    self.controller.watch_master_fd(master.clone());
                }
            }
        }

        if !self.controller.pending_states.lock().await.is_empty() {
            self.controller.state_service.submit(Arc::new(DrainPendingStatesTask { controller: Arc::clone(&self.controller) }));
        }
    }
}

/// Signal that triggered split-brain resolution: either a state published
/// by another self-proclaimed master, or a heartbeat cross-check.
enum ForeignMasterSignal {
    Published(ClusterState),
    Heard { peer: NodeId, version: u64 },
}

/// Resolves a conflicting master sighted while the local node is master
/// itself: surrender if the other side's version is newer, otherwise ask
/// it to rejoin.
struct HandleForeignMasterTask {
    controller: Arc<DiscoveryController>,
    signal: ForeignMasterSignal,
}

impl HandleForeignMasterTask {
    fn foreign_version(&self) -> u64 {
        match &self.signal {
            ForeignMasterSignal::Published(state) => state.version,
            ForeignMasterSignal::Heard { version, .. } => *version,
        }
    }

    fn foreign_master_descriptor(&self, current: &ClusterState) -> Option<NodeDescriptor> {
        match &self.signal {
            ForeignMasterSignal::Published(state) => state.nodes.master().cloned(),
            ForeignMasterSignal::Heard { peer, .. } => current.nodes.get(peer).cloned(),
        }
    }
}

#[async_trait]
impl ClusterStateTask for HandleForeignMasterTask {
    fn source(&self) -> &str {
        "handle-foreign-master"
    }

    fn master_requirement(&self) -> MasterRequirement {
        MasterRequirement::Required
    }

    fn priority(&self) -> Priority {
        Priority::Urgent
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        if self.foreign_version() > current.version {
            Ok(self.controller.rejoin_state(current))
        } else {
            Ok(current.clone())
        }
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        if new.has_no_master() && !old.has_no_master() {
            warn!(foreign_version = self.foreign_version(), "surrendering mastership to a higher-versioned peer");
            self.controller.rejoin_side_effects();
        } else if let Some(target) = self.foreign_master_descriptor(old) {
            debug!(peer = %target.id, "asking conflicting master to rejoin");
            self.controller.spawn_rejoin_request(target);
        }
    }
}

/// Master-side handling of a forced rejoin request: surrender
/// unconditionally, trusting the requester's authority.
struct RejoinTask {
    controller: Arc<DiscoveryController>,
}

#[async_trait]
impl ClusterStateTask for RejoinTask {
    fn source(&self) -> &str {
        "rejoin"
    }

    fn priority(&self) -> Priority {
        Priority::Urgent
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        Ok(self.controller.rejoin_state(current))
    }

    async fn cluster_state_processed(&self, _old: &ClusterState, _new: &ClusterState) {
        self.controller.rejoin_side_effects();
    }
}

/// Applies a dynamic configuration update, rejoining if the new settings
/// immediately invalidate quorum.
struct ReloadSettingsTask {
    controller: Arc<DiscoveryController>,
    update: ConfigUpdate,
}

#[async_trait]
impl ClusterStateTask for ReloadSettingsTask {
    fn source(&self) -> &str {
        "reload-settings"
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    async fn execute(&self, current: &ClusterState) -> ClusterResult<ClusterState> {
        {
            // Only ever written from within a state-executor task; a poisoned
            // lock means a prior task panicked mid-write, which is not recoverable.
            #[allow(clippy::expect_used)]
            let mut config = self.controller.config.write().expect("config lock poisoned");
            if let Some(m) = self.update.minimum_master_nodes {
                config.minimum_master_nodes = m;
            }
            if let Some(r) = self.update.rejoin_on_master_gone {
                config.rejoin_on_master_gone = r;
            }
        }

        let config = self.controller.config_snapshot();
        let filter = self.controller.election_filter();
        if current.nodes.master_id.is_some()
            && !has_enough_master_nodes(current.nodes.master_eligible(), config.minimum_master_nodes, filter)
        {
            return Ok(self.controller.rejoin_state(current));
        }
        Ok(current.clone())
    }

    async fn cluster_state_processed(&self, old: &ClusterState, new: &ClusterState) {
        info!(update = ?self.update, "applied dynamic configuration update");
        if new.has_no_master() && !old.has_no_master() {
            self.controller.rejoin_side_effects();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, TransportHub};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn test_config(seeds: Vec<String>) -> ClusterConfig {
        ClusterConfig::builder()
            .cluster_name("scenario")
            .ping_timeout(Duration::from_millis(60))
            .join_timeout(Duration::from_millis(300))
            .join_retry(3, Duration::from_millis(20))
            .minimum_master_nodes(1)
            .unicast_hosts(seeds)
            .build()
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if f() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn two_nodes_converge_on_smallest_id_as_master() {
        let hub = TransportHub::new();
        let seeds = vec!["127.0.0.1:9900".to_owned(), "127.0.0.1:9901".to_owned()];

        let transport_a = InProcessTransport::register(NodeId::from("a"), addr(9900), hub.clone()).await;
        let transport_b = InProcessTransport::register(NodeId::from("b"), addr(9901), hub).await;

        let controller_a =
            DiscoveryController::start(NodeDescriptor::new("a", addr(9900)), test_config(seeds.clone()), transport_a, Vec::new())
                .await;
        let controller_b =
            DiscoveryController::start(NodeDescriptor::new("b", addr(9901)), test_config(seeds), transport_b, Vec::new()).await;

        let converged = wait_until(
            || {
                controller_a.current_state().nodes.master_id == Some(NodeId::from("a"))
                    && controller_b.current_state().nodes.master_id == Some(NodeId::from("a"))
                    && controller_a.current_state().nodes.len() == 2
                    && controller_b.current_state().nodes.len() == 2
            },
            Duration::from_secs(5),
        )
        .await;

        assert!(converged, "expected both nodes to converge on 'a' as master");
        assert!(!controller_a.current_state().blocks.has_no_master_block());
        assert!(!controller_b.current_state().blocks.has_no_master_block());
    }

    #[tokio::test]
    async fn lone_node_under_quorum_two_stays_unformed() {
        let hub = TransportHub::new();
        let transport_a = InProcessTransport::register(NodeId::from("a"), addr(9910), hub).await;

        let mut config = test_config(vec!["127.0.0.1:9910".to_owned(), "127.0.0.1:9911".to_owned()]);
        config.minimum_master_nodes = 2;

        let controller_a = DiscoveryController::start(NodeDescriptor::new("a", addr(9910)), config, transport_a, Vec::new()).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(controller_a.current_state().blocks.has_no_master_block());
        assert!(controller_a.current_state().nodes.master_id.is_none());
    }
}
