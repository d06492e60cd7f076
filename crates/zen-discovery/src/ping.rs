//! Unicast peer discovery.
//!
//! [`PingService`] fires ping waves at a union of seed hosts, dynamic
//! [`UnicastHostsProvider`] hosts, recently-gossiped peers, and the local
//! view's master-eligible nodes, and collects [`PingResponse`]s within a
//! timeout. It has no notion of the cluster's current membership beyond
//! what callers pass in or what arrives over the wire: the discovery
//! controller is the one component that reconciles results into state.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ClusterError;
use crate::node::{NodeDescriptor, NodeId};
use crate::transport::{Handler, Transport};

/// Legacy ping action, understood by every protocol version.
pub const PING_ACTION_V1: &str = "ping.unicast";
/// Ping action carrying `has_joined_once`, understood from a later
/// protocol version onward.
pub const PING_ACTION_V2: &str = "ping.unicast.v2";

/// One peer's self-reported view, exchanged during a ping round.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PingResponse {
    /// The responding node's own descriptor, including its address — this
    /// is what lets a gossiped [`PingResponse`] serve as a ping target in
    /// a later wave.
    pub responder: NodeDescriptor,
    /// The node the responder currently believes is master, if any. Carries
    /// the full descriptor (not just an id) so a master candidate that has
    /// only ever been heard of through gossip, never connected to directly,
    /// can still be passed to [`crate::elect_master::elect_master`].
    pub believed_master: Option<NodeDescriptor>,
    /// Cluster name the responder belongs to.
    pub cluster_name: String,
    /// Whether the responder has ever successfully joined a cluster.
    pub has_joined_once: bool,
    /// Id of the ping round this response answers.
    pub request_id: u64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PingWireRequest {
    request_id: u64,
    responder: PingResponse,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PingWireResponse {
    responses: Vec<PingResponse>,
}

/// A source of unicast ping targets beyond the static seed list.
#[async_trait]
pub trait UnicastHostsProvider: Send + Sync + fmt::Debug {
    /// Return zero or more `host:port` strings. Failures are logged by the
    /// implementation and surfaced as an empty list rather than an error,
    /// so one misbehaving provider never blocks a ping round.
    async fn hosts(&self) -> Vec<String>;
}

/// The configured seed list, returned unchanged on every call.
#[derive(Debug, Clone)]
pub struct StaticHostsProvider(Vec<String>);

impl StaticHostsProvider {
    /// Wrap a fixed host list.
    #[must_use]
    pub fn new(hosts: Vec<String>) -> Self {
        Self(hosts)
    }
}

#[async_trait]
impl UnicastHostsProvider for StaticHostsProvider {
    async fn hosts(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// Resolves ping targets from a DNS name: SRV records first (each target
/// resolved again for its A/AAAA records), falling back to a direct
/// A/AAAA lookup against `default_port` when no SRV records exist.
#[derive(Debug, Clone)]
pub struct DnsHostsProvider {
    dns_name: String,
    default_port: u16,
}

impl DnsHostsProvider {
    /// A provider resolving `dns_name`, using `default_port` for bare
    /// A/AAAA lookups that carry no port of their own.
    #[must_use]
    pub fn new(dns_name: impl Into<String>, default_port: u16) -> Self {
        Self {
            dns_name: dns_name.into(),
            default_port,
        }
    }

    async fn resolve(&self) -> Result<Vec<String>, ClusterError> {
        use hickory_resolver::TokioAsyncResolver;

        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            ClusterError::DiscoveryError(format!("failed to create DNS resolver: {e}"))
        })?;

        let mut hosts = Vec::new();
        match resolver.srv_lookup(self.dns_name.as_str()).await {
            Ok(srv_records) => {
                for srv in srv_records.iter() {
                    let target = srv.target().to_string();
                    let port = srv.port();
                    match resolver.lookup_ip(target.as_str()).await {
                        Ok(ips) => hosts.extend(ips.iter().map(|ip| format!("{ip}:{port}"))),
                        Err(e) => warn!(target, error = %e, "failed to resolve SRV target"),
                    }
                }
            }
            Err(_) => match resolver.lookup_ip(self.dns_name.as_str()).await {
                Ok(ips) => {
                    hosts.extend(ips.iter().map(|ip| format!("{ip}:{}", self.default_port)));
                }
                Err(e) => {
                    return Err(ClusterError::DiscoveryError(format!(
                        "failed to resolve DNS name '{}': {e}",
                        self.dns_name
                    )));
                }
            },
        }
        Ok(hosts)
    }
}

#[async_trait]
impl UnicastHostsProvider for DnsHostsProvider {
    async fn hosts(&self) -> Vec<String> {
        match self.resolve().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "DNS hosts provider failed, returning no targets this round");
                Vec::new()
            }
        }
    }
}

struct TemporalEntry {
    inserted_at: Instant,
    response: PingResponse,
}

/// Fires unicast ping waves and assembles the replies into a single
/// per-round result set.
pub struct PingService {
    local: NodeDescriptor,
    cluster_name: String,
    transport: Arc<dyn Transport>,
    seed_hosts: Vec<String>,
    providers: Vec<Arc<dyn UnicastHostsProvider>>,
    concurrent_connects: usize,
    temporal_responses: Mutex<Vec<TemporalEntry>>,
    temporal_ttl: Duration,
    local_snapshot: RwLock<PingResponse>,
    temp_ordinal: AtomicUsize,
    next_request_id: AtomicUsize,
}

impl PingService {
    /// Construct a ping service for `local`. `temporal_ttl` should be
    /// `2 * ping_timeout`, matching the buffer's expiry rule.
    #[must_use]
    pub fn new(
        local: NodeDescriptor,
        cluster_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        seed_hosts: Vec<String>,
        providers: Vec<Arc<dyn UnicastHostsProvider>>,
        concurrent_connects: usize,
        temporal_ttl: Duration,
    ) -> Arc<Self> {
        let cluster_name = cluster_name.into();
        let snapshot = PingResponse {
            responder: local.clone(),
            believed_master: None,
            cluster_name: cluster_name.clone(),
            has_joined_once: false,
            request_id: 0,
        };
        Arc::new(Self {
            local,
            cluster_name,
            transport,
            seed_hosts,
            providers,
            concurrent_connects: concurrent_connects.max(1),
            temporal_responses: Mutex::new(Vec::new()),
            temporal_ttl,
            local_snapshot: RwLock::new(snapshot),
            temp_ordinal: AtomicUsize::new(0),
            next_request_id: AtomicUsize::new(1),
        })
    }

    /// Update the view of `self` embedded in outgoing pings and handed
    /// out to inbound ones. Called by the discovery controller whenever
    /// the believed master or join state changes.
    pub async fn update_local_snapshot(&self, believed_master: Option<NodeDescriptor>, has_joined_once: bool) {
        let mut snapshot = self.local_snapshot.write().await;
        snapshot.believed_master = believed_master;
        snapshot.has_joined_once = has_joined_once;
    }

    /// Register this service's wire handlers on `transport`.
    pub fn install_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handler_v1: Handler =
            Arc::new(move |from, payload| Box::pin(Arc::clone(&this).handle_ping(from, payload)));
        self.transport.register_handler(PING_ACTION_V1, handler_v1);

        let this = Arc::clone(self);
        let handler_v2: Handler =
            Arc::new(move |from, payload| Box::pin(Arc::clone(&this).handle_ping(from, payload)));
        self.transport.register_handler(PING_ACTION_V2, handler_v2);
    }

    async fn handle_ping(self: Arc<Self>, from: NodeId, payload: Bytes) -> Result<Bytes, ClusterError> {
        let req: PingWireRequest = bincode::deserialize(&payload)?;
        debug!(%from, request_id = req.request_id, "received ping");

        self.push_temporal(req.responder).await;

        let mut responses = self.snapshot_temporal().await;
        let mut local = self.local_snapshot.read().await.clone();
        local.request_id = req.request_id;
        responses.push(local);

        let wire = PingWireResponse { responses };
        Ok(Bytes::from(bincode::serialize(&wire)?))
    }

    async fn push_temporal(&self, response: PingResponse) {
        let mut buf = self.temporal_responses.lock().await;
        prune_expired(&mut buf, self.temporal_ttl);
        buf.push(TemporalEntry {
            inserted_at: Instant::now(),
            response,
        });
    }

    async fn snapshot_temporal(&self) -> Vec<PingResponse> {
        let mut buf = self.temporal_responses.lock().await;
        prune_expired(&mut buf, self.temporal_ttl);
        buf.iter().map(|e| e.response.clone()).collect()
    }

    fn next_temp_id(&self) -> NodeId {
        NodeId::temporary(self.temp_ordinal.fetch_add(1, Ordering::Relaxed))
    }

    async fn collect_targets(&self, known_master_eligible: &[NodeDescriptor]) -> Vec<(SocketAddr, bool)> {
        let mut targets: HashMap<SocketAddr, bool> = HashMap::new();

        for host in &self.seed_hosts {
            if let Ok(addr) = host.parse::<SocketAddr>() {
                targets.entry(addr).or_insert(true);
            } else {
                warn!(host, "unparseable seed host, skipping");
            }
        }

        for provider in &self.providers {
            for host in provider.hosts().await {
                if let Ok(addr) = host.parse::<SocketAddr>() {
                    targets.entry(addr).or_insert(false);
                } else {
                    warn!(host, "unparseable dynamic host, skipping");
                }
            }
        }

        for entry in self.snapshot_temporal().await {
            targets.entry(entry.responder.address).or_insert(false);
        }

        for node in known_master_eligible {
            targets.entry(node.address).or_insert(false);
        }

        targets.remove(&self.local.address);
        targets.into_iter().collect()
    }

    async fn send_to_target(
        &self,
        addr: SocketAddr,
        is_seed: bool,
        request_id: u64,
        rpc_timeout: Duration,
    ) -> Vec<PingResponse> {
        let temp_id = self.next_temp_id();
        let descriptor = NodeDescriptor::new(temp_id.clone(), addr);

        if let Err(e) = self.transport.connect(&descriptor).await {
            debug!(%addr, error = %e, "ping connect failed");
            return Vec::new();
        }

        let responder = {
            let mut snapshot = self.local_snapshot.read().await.clone();
            snapshot.request_id = request_id;
            snapshot
        };
        let request = PingWireRequest { request_id, responder };
        let payload = match bincode::serialize(&request) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "failed to serialize ping request");
                self.transport.disconnect(&temp_id).await;
                return Vec::new();
            }
        };

        let primary_action = if is_seed { PING_ACTION_V1 } else { PING_ACTION_V2 };
        let raw = match self
            .transport
            .send(&temp_id, primary_action, payload.clone(), rpc_timeout)
            .await
        {
            Ok(raw) => Some(raw),
            Err(ClusterError::ActionNotFound(_)) if !is_seed => {
                match self
                    .transport
                    .send(&temp_id, PING_ACTION_V1, payload, rpc_timeout)
                    .await
                {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        debug!(%addr, error = %e, "legacy ping fallback failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(%addr, error = %e, "ping send failed");
                None
            }
        };

        self.transport.disconnect(&temp_id).await;

        match raw.and_then(|r| bincode::deserialize::<PingWireResponse>(&r).ok()) {
            Some(wire) => wire.responses,
            None => Vec::new(),
        }
    }

    async fn fire_wave(
        self: &Arc<Self>,
        targets: &[(SocketAddr, bool)],
        request_id: u64,
        rpc_timeout: Duration,
        collected: &Arc<Mutex<HashMap<NodeId, PingResponse>>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrent_connects));
        let mut joins = tokio::task::JoinSet::new();

        for &(addr, is_seed) in targets {
            // `semaphore` is owned by this call and never closed before
            // the loop finishes, so acquiring a permit cannot fail.
            #[allow(clippy::expect_used)]
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let this = Arc::clone(self);
            let collected = Arc::clone(collected);

            joins.spawn(async move {
                let responses = this
                    .send_to_target(addr, is_seed, request_id, rpc_timeout)
                    .await;
                drop(permit);
                let mut map = collected.lock().await;
                for response in responses {
                    map.insert(response.responder.id.clone(), response);
                }
            });
        }

        while joins.join_next().await.is_some() {}
    }

    /// Fire three ping waves (at 0, `timeout/2`, `timeout`) and wait a
    /// final `timeout/2` before returning, so late joiners reached by the
    /// last wave still have time to reply.
    pub async fn ping_and_wait(
        self: &Arc<Self>,
        timeout: Duration,
        known_master_eligible: &[NodeDescriptor],
    ) -> Vec<PingResponse> {
        let half = timeout / 2;
        let collected: Arc<Mutex<HashMap<NodeId, PingResponse>>> = Arc::new(Mutex::new(HashMap::new()));

        for _ in 0..3 {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) as u64;
            let targets = self.collect_targets(known_master_eligible).await;
            self.fire_wave(&targets, request_id, half.max(Duration::from_millis(1)), &collected)
                .await;
            tokio::time::sleep(half).await;
        }

        Arc::try_unwrap(collected)
            .map(Mutex::into_inner)
            .unwrap_or_default()
            .into_values()
            .collect()
    }
}

impl fmt::Debug for PingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingService")
            .field("local", &self.local.id)
            .field("cluster_name", &self.cluster_name)
            .field("concurrent_connects", &self.concurrent_connects)
            .finish_non_exhaustive()
    }
}

fn prune_expired(buf: &mut Vec<TemporalEntry>, ttl: Duration) {
    let now = Instant::now();
    buf.retain(|e| now.saturating_duration_since(e.inserted_at) < ttl);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, TransportHub};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn build_node(id: &str, port: u16, hub: Arc<TransportHub>) -> (Arc<PingService>, Arc<InProcessTransport>) {
        let local = NodeDescriptor::new(id, addr(port));
        let transport = InProcessTransport::register(local.id.clone(), local.address, hub).await;
        let svc = PingService::new(
            local,
            "test-cluster",
            transport.clone(),
            Vec::new(),
            Vec::new(),
            4,
            Duration::from_secs(10),
        );
        svc.install_handlers();
        (svc, transport)
    }

    #[tokio::test]
    async fn ping_round_with_no_targets_returns_empty() {
        let hub = TransportHub::new();
        let (svc, _t) = build_node("a", 9301, hub).await;
        let result = svc.ping_and_wait(Duration::from_millis(20), &[]).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn static_provider_returns_configured_hosts() {
        let provider = StaticHostsProvider::new(vec!["127.0.0.1:9400".to_owned()]);
        assert_eq!(provider.hosts().await, vec!["127.0.0.1:9400".to_owned()]);
    }

    #[tokio::test]
    async fn temporal_entries_expire_after_ttl() {
        let hub = TransportHub::new();
        let (svc, _t) = build_node("a", 9302, hub).await;
        let other = NodeDescriptor::new("b", addr(9303));
        svc.push_temporal(PingResponse {
            responder: other,
            believed_master: None,
            cluster_name: "test-cluster".into(),
            has_joined_once: false,
            request_id: 1,
        })
        .await;
        assert_eq!(svc.snapshot_temporal().await.len(), 1);

        // force expiry by directly rewriting the insertion time in the past
        {
            let mut buf = svc.temporal_responses.lock().await;
            for entry in buf.iter_mut() {
                entry.inserted_at = Instant::now() - Duration::from_secs(3600);
            }
        }
        assert!(svc.snapshot_temporal().await.is_empty());
    }
}
