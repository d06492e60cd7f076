//! Periodic liveness probing.
//!
//! Two independent probers run as background tasks and report failures by
//! invoking an async callback; neither touches cluster state directly —
//! callbacks are expected to submit a [`crate::cluster_state_task`] to
//! bring the failure back onto the single-writer executor.
//!
//! The probe payload doubles as the cross-check described in spec §4.4:
//! a prober embeds whether it currently believes itself master and its
//! current cluster-state version, so a responder that is *also* convinced
//! it is master can detect the conflict and count it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::ClusterError;
use crate::node::{NodeDescriptor, NodeId};
use crate::transport::{Handler, Transport};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wire action both probers send on.
pub const HEARTBEAT_ACTION: &str = "discovery.heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatRequest {
    from: NodeId,
    believes_self_master: bool,
    version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatReply {
    /// `false` when the responder does not recognize `from` as a member
    /// of its cluster — the "you are not in my cluster" reply of §4.4.
    accepted: bool,
}

/// Outcome of a single probe, distinguishing the explicit
/// "not in my cluster" rejection from an ordinary send failure so
/// [`MasterFaultDetection`] can fire immediately on the former rather
/// than waiting out `retry_count`.
enum ProbeOutcome {
    Alive,
    NotInCluster,
    Failed(String),
}

/// Probes `target`, (re)connecting first since a probe may fire long
/// after the connection a prior RPC (join, publish) used was torn down.
/// `connect` is documented idempotent, so this is cheap when a real
/// transport already holds the connection open.
async fn send_heartbeat(
    transport: &Arc<dyn Transport>,
    target: &NodeDescriptor,
    timeout: Duration,
    local_id: &NodeId,
    believes_self_master: bool,
    version: u64,
) -> ProbeOutcome {
    if let Err(e) = transport.connect(target).await {
        return ProbeOutcome::Failed(e.to_string());
    }

    let request = HeartbeatRequest {
        from: local_id.clone(),
        believes_self_master,
        version,
    };
    let payload = match bincode::serialize(&request) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => return ProbeOutcome::Failed(e.to_string()),
    };

    match transport.send(&target.id, HEARTBEAT_ACTION, payload, timeout).await {
        Ok(raw) => match bincode::deserialize::<HeartbeatReply>(&raw) {
            Ok(reply) if reply.accepted => ProbeOutcome::Alive,
            Ok(_) => ProbeOutcome::NotInCluster,
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        },
        Err(e) => ProbeOutcome::Failed(e.to_string()),
    }
}

/// Registers the `discovery.heartbeat` handler shared by both probers'
/// targets. `is_member` decides the "not in my cluster" reply;
/// `local_status` reports whether the local node currently believes
/// itself master and its current version, for the cross-check; when a
/// peer that also claims mastership crosses `max_pings_from_another_master`,
/// `on_foreign_master` fires with that peer's id and reported version.
pub fn install_heartbeat_handler<M, S, F>(
    transport: &Arc<dyn Transport>,
    is_member: M,
    local_status: S,
    counter: Arc<AnotherMasterCounter>,
    max_pings_from_another_master: u32,
    on_foreign_master: F,
) where
    M: Fn(&NodeId) -> bool + Send + Sync + 'static,
    S: Fn() -> (bool, u64) + Send + Sync + 'static,
    F: Fn(NodeId, u64) + Send + Sync + 'static,
{
    let is_member = Arc::new(is_member);
    let local_status = Arc::new(local_status);
    let on_foreign_master = Arc::new(on_foreign_master);

    let handler: Handler = Arc::new(move |from, payload| {
        let is_member = Arc::clone(&is_member);
        let local_status = Arc::clone(&local_status);
        let counter = Arc::clone(&counter);
        let on_foreign_master = Arc::clone(&on_foreign_master);
        Box::pin(async move {
            let req: HeartbeatRequest = bincode::deserialize(&payload)?;
            if !is_member(&from) {
                let reply = HeartbeatReply { accepted: false };
                return Ok(Bytes::from(bincode::serialize(&reply)?));
            }

            let (locally_master, local_version) = local_status();
            if locally_master && req.believes_self_master {
                let count = counter.record(&from);
                if count >= max_pings_from_another_master {
                    debug!(%from, count, "threshold reached for pings from another master");
                    on_foreign_master(from, req.version);
                }
                let _ = local_version;
            }

            let reply = HeartbeatReply { accepted: true };
            Ok(Bytes::from(bincode::serialize(&reply)?))
        })
    });
    transport.register_handler(HEARTBEAT_ACTION, handler);
}

/// Probes the believed master on behalf of a follower.
pub struct MasterFaultDetection {
    transport: Arc<dyn Transport>,
    local_id: NodeId,
    interval: Duration,
    retry_count: u32,
    ping_timeout: Duration,
    stop: Arc<Notify>,
    running: std::sync::atomic::AtomicBool,
}

impl MasterFaultDetection {
    /// A prober that has not started watching anyone yet.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        local_id: NodeId,
        interval: Duration,
        retry_count: u32,
        ping_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            local_id,
            interval,
            retry_count: retry_count.max(1),
            ping_timeout,
            stop: Arc::new(Notify::new()),
            running: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Stop any currently running watch. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop.notify_waiters();
        }
    }

    /// Start watching `master`, firing `on_failure(master, reason)` after
    /// `retry_count` consecutive probe failures, or immediately on an
    /// explicit "not in my cluster" reply. Restarting (calling this
    /// again) implicitly stops the previous watch, matching the "MasterFD
    /// must be explicitly restarted against the new target" rule.
    pub fn watch<F>(self: &Arc<Self>, master: NodeDescriptor, on_failure: F)
    where
        F: Fn(NodeId, String) -> BoxFuture + Send + Sync + 'static,
    {
        self.stop();
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let stop = Arc::clone(&self.stop);

        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    () = stop.notified() => return,
                    () = tokio::time::sleep(this.interval) => {}
                }
                if !this.running.load(Ordering::SeqCst) {
                    return;
                }

                match send_heartbeat(&this.transport, &master, this.ping_timeout, &this.local_id, false, 0).await {
                    ProbeOutcome::Alive => consecutive_failures = 0,
                    ProbeOutcome::NotInCluster => {
                        this.running.store(false, Ordering::SeqCst);
                        on_failure(master.id, "not in my cluster".to_owned()).await;
                        return;
                    }
                    ProbeOutcome::Failed(reason) => {
                        consecutive_failures += 1;
                        debug!(master = %master.id, consecutive_failures, "master probe failed");
                        if consecutive_failures >= this.retry_count {
                            this.running.store(false, Ordering::SeqCst);
                            on_failure(master.id, reason).await;
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Probes every follower on behalf of the master.
pub struct NodesFaultDetection {
    transport: Arc<dyn Transport>,
    local_id: NodeId,
    interval: Duration,
    retry_count: u32,
    ping_timeout: Duration,
    stop: Arc<Notify>,
    generation: AtomicU32,
}

impl NodesFaultDetection {
    /// A prober watching nobody yet.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        local_id: NodeId,
        interval: Duration,
        retry_count: u32,
        ping_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            local_id,
            interval,
            retry_count: retry_count.max(1),
            ping_timeout,
            stop: Arc::new(Notify::new()),
            generation: AtomicU32::new(0),
        })
    }

    /// Stop watching every node. Idempotent.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Re-seed the watched set to exactly `nodes`, as required after
    /// every accepted state update on the master. Nodes no longer present
    /// are dropped; new nodes start being watched immediately. `status`
    /// is polled fresh before every probe so the outgoing heartbeat always
    /// embeds the master's current version.
    pub fn reseed<S, F>(self: &Arc<Self>, nodes: Vec<NodeDescriptor>, status: S, on_failure: F)
    where
        S: Fn() -> (bool, u64) + Send + Sync + 'static,
        F: Fn(NodeId, String) -> BoxFuture + Send + Sync + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let status = Arc::new(status);
        let on_failure = Arc::new(on_failure);

        for node in nodes {
            let this = Arc::clone(self);
            let status = Arc::clone(&status);
            let on_failure = Arc::clone(&on_failure);
            let stop = Arc::clone(&self.stop);

            tokio::spawn(async move {
                let mut consecutive_failures: u32 = 0;
                loop {
                    tokio::select! {
                        () = stop.notified() => return,
                        () = tokio::time::sleep(this.interval) => {}
                    }
                    if this.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }

                    let (believes_self_master, version) = status();
                    match send_heartbeat(&this.transport, &node, this.ping_timeout, &this.local_id, believes_self_master, version).await {
                        ProbeOutcome::Alive => consecutive_failures = 0,
                        ProbeOutcome::NotInCluster => {
                            warn!(node = %node.id, "node no longer recognizes us, treating as failed");
                            on_failure(node.id, "not in my cluster".to_owned()).await;
                            return;
                        }
                        ProbeOutcome::Failed(reason) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= this.retry_count {
                                warn!(node = %node.id, "node failed fault detection");
                                on_failure(node.id, reason).await;
                                return;
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Counts pings received from a peer that also believes itself master,
/// per §4.4's cross-check. Resets whenever the suspected peer changes.
#[derive(Debug, Default)]
pub struct AnotherMasterCounter {
    suspect: std::sync::Mutex<Option<NodeId>>,
    count: AtomicU32,
}

impl AnotherMasterCounter {
    /// A fresh counter.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a ping received from `peer` while it believes itself
    /// master. Returns the new count for `peer`.
    pub fn record(&self, peer: &NodeId) -> u32 {
        // Nothing in this struct panics while holding the lock, so it can
        // never be poisoned.
        #[allow(clippy::expect_used)]
        let mut suspect = self.suspect.lock().expect("lock poisoned");
        if suspect.as_ref() != Some(peer) {
            *suspect = Some(peer.clone());
            self.count.store(0, Ordering::SeqCst);
        }
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, TransportHub};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn counter_resets_when_suspect_changes() {
        let counter = AnotherMasterCounter::new();
        assert_eq!(counter.record(&NodeId::from("a")), 1);
        assert_eq!(counter.record(&NodeId::from("a")), 2);
        assert_eq!(counter.record(&NodeId::from("b")), 1);
    }

    #[test]
    fn counter_reaches_threshold() {
        let counter = AnotherMasterCounter::new();
        let mut last = 0;
        for _ in 0..3 {
            last = counter.record(&NodeId::from("a"));
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn heartbeat_rejects_non_member() {
        let hub = TransportHub::new();
        let prober_id = NodeId::from("prober");
        let target_id = NodeId::from("target");
        let prober = InProcessTransport::register(prober_id.clone(), addr(9800), hub.clone()).await;
        let target = InProcessTransport::register(target_id.clone(), addr(9801), hub).await;
        let target_dyn: Arc<dyn Transport> = target;

        install_heartbeat_handler(
            &target_dyn,
            |_from| false,
            || (false, 0),
            AnotherMasterCounter::new(),
            3,
            |_peer, _version| {},
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        prober
            .connect(&crate::node::NodeDescriptor::new(target_id, addr(9801)))
            .await
            .unwrap();

        let fd = MasterFaultDetection::new(prober, prober_id.clone(), Duration::from_millis(5), 1, Duration::from_secs(1));
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        fd.watch(crate::node::NodeDescriptor::new(NodeId::from("target"), addr(9801)), move |_node, reason| {
            let fired = Arc::clone(&fired_clone);
            Box::pin(async move {
                assert_eq!(reason, "not in my cluster");
                fired.store(true, Ordering::SeqCst);
            })
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn heartbeat_cross_check_fires_after_threshold() {
        let hub = TransportHub::new();
        let a_id = NodeId::from("a");
        let b_id = NodeId::from("b");
        let a = InProcessTransport::register(a_id.clone(), addr(9802), hub.clone()).await;
        let b = InProcessTransport::register(b_id.clone(), addr(9803), hub).await;
        let b_dyn: Arc<dyn Transport> = b;

        let counter = AnotherMasterCounter::new();
        let triggered = Arc::new(AtomicBool::new(false));
        let triggered_clone = Arc::clone(&triggered);
        install_heartbeat_handler(
            &b_dyn,
            |_from| true,
            || (true, 7),
            counter,
            2,
            move |_peer, _version| {
                triggered_clone.store(true, Ordering::SeqCst);
            },
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let b_descriptor = crate::node::NodeDescriptor::new(b_id.clone(), addr(9803));
        a.connect(&b_descriptor).await.unwrap();
        for _ in 0..2 {
            let _ = send_heartbeat(&(a.clone() as Arc<dyn Transport>), &b_descriptor, Duration::from_secs(1), &a_id, true, 5).await;
        }

        assert!(triggered.load(Ordering::SeqCst));
    }
}
