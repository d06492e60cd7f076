//! Join, validate-join, and leave: the three membership RPCs.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::node::NodeDescriptor;
use crate::transport::{Handler, Transport};

/// Wire action for an outgoing join request.
pub const JOIN_ACTION: &str = "membership.join";
/// Wire action for the master's pre-accept validation round-trip.
pub const VALIDATE_JOIN_ACTION: &str = "membership.validate_join";
/// Wire action for a best-effort leave notice.
pub const LEAVE_ACTION: &str = "membership.leave";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct JoinWireRequest {
    cluster_name: String,
    candidate: NodeDescriptor,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum JoinWireReply {
    Accepted,
    NotMaster,
    Rejected(String),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ValidateJoinWireRequest {
    cluster_name: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum ValidateJoinWireReply {
    Accept,
    Reject(String),
}

/// Master-side round trip to the candidate itself: confirms the candidate
/// is reachable and agrees on the cluster name, independent of whatever
/// the candidate claimed in its join request payload. Every node installs
/// the responder side via [`install_validate_join_handler`], since any
/// node may be queried as a join candidate.
async fn validate_join_round_trip(
    transport: &Arc<dyn Transport>,
    candidate: &NodeDescriptor,
    cluster_name: &str,
    timeout: Duration,
) -> Result<(), String> {
    if transport.connect(candidate).await.is_err() {
        return Err(format!("could not connect to {} to validate join", candidate.id));
    }
    let send_result = match bincode::serialize(&ValidateJoinWireRequest { cluster_name: cluster_name.to_owned() }) {
        Ok(bytes) => {
            transport
                .send(&candidate.id, VALIDATE_JOIN_ACTION, Bytes::from(bytes), timeout)
                .await
        }
        Err(e) => Err(ClusterError::SerializationError(e.to_string())),
    };
    transport.disconnect(&candidate.id).await;

    let raw = send_result.map_err(|e| format!("validate-join round trip to {} failed: {e}", candidate.id))?;
    match bincode::deserialize::<ValidateJoinWireReply>(&raw) {
        Ok(ValidateJoinWireReply::Accept) => Ok(()),
        Ok(ValidateJoinWireReply::Reject(reason)) => Err(reason),
        Err(e) => Err(format!("failed to decode validate-join reply from {}: {e}", candidate.id)),
    }
}

/// Registers the joiner-side `membership.validate_join` handler: replies
/// whether the local node agrees on the cluster name. Installed on every
/// node, since any node may be asked to validate as a join candidate.
pub fn install_validate_join_handler(transport: &Arc<dyn Transport>, cluster_name: String) {
    let cluster_name = Arc::new(cluster_name);
    let handler: Handler = Arc::new(move |_from, payload| {
        let cluster_name = Arc::clone(&cluster_name);
        Box::pin(async move {
            let req: ValidateJoinWireRequest = bincode::deserialize(&payload)?;
            let reply = if req.cluster_name == *cluster_name {
                ValidateJoinWireReply::Accept
            } else {
                ValidateJoinWireReply::Reject(format!(
                    "candidate believes cluster name is {}, master believes {cluster_name}",
                    req.cluster_name
                ))
            };
            Ok(Bytes::from(bincode::serialize(&reply)?))
        })
    });
    transport.register_handler(VALIDATE_JOIN_ACTION, handler);
}

/// Client side of the membership protocol: a candidate node calling out
/// to a master it believes exists.
pub struct MembershipClient {
    transport: Arc<dyn Transport>,
    cluster_name: String,
    join_retry_attempts: u32,
    join_retry_delay: Duration,
}

impl MembershipClient {
    /// A client sending membership RPCs as `cluster_name`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        cluster_name: impl Into<String>,
        join_retry_attempts: u32,
        join_retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            cluster_name: cluster_name.into(),
            join_retry_attempts: join_retry_attempts.max(1),
            join_retry_delay,
        }
    }

    /// Send a join request to `master`, retrying up to
    /// `join_retry_attempts` (spaced `join_retry_delay` apart) only when
    /// the recipient reports it is not currently master. Every other
    /// error is terminal for this attempt.
    pub async fn send_join_request_blocking(
        &self,
        master: &NodeDescriptor,
        candidate: &NodeDescriptor,
        join_timeout: Duration,
    ) -> ClusterResult<()> {
        self.transport.connect(master).await?;

        let attempt = || async {
            self.try_join_once(master, candidate, join_timeout).await
        };

        // `with_max_times` counts retries *after* the first attempt, so
        // the total RPCs sent is `join_retry_attempts` only if we pass
        // one fewer than the configured attempt count.
        let result = attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.join_retry_delay)
                    .with_max_delay(self.join_retry_delay)
                    .with_max_times(self.join_retry_attempts.saturating_sub(1) as usize),
            )
            .when(ClusterError::is_retriable_join)
            .notify(|err: &ClusterError, delay| {
                debug!(master = %master.id, error = %err, ?delay, "join attempt will retry");
            })
            .await;

        self.transport.disconnect(&master.id).await;
        result
    }

    async fn try_join_once(
        &self,
        master: &NodeDescriptor,
        candidate: &NodeDescriptor,
        join_timeout: Duration,
    ) -> ClusterResult<()> {
        let payload = JoinWireRequest {
            cluster_name: self.cluster_name.clone(),
            candidate: candidate.clone(),
        };
        let bytes = Bytes::from(bincode::serialize(&payload)?);
        let raw = self
            .transport
            .send(&master.id, JOIN_ACTION, bytes, join_timeout)
            .await?;
        let reply: JoinWireReply = bincode::deserialize(&raw)?;

        match reply {
            JoinWireReply::Accepted => {
                info!(master = %master.id, "join accepted");
                Ok(())
            }
            JoinWireReply::NotMaster => Err(ClusterError::NotMasterForJoin(master.id.clone())),
            JoinWireReply::Rejected(reason) => Err(ClusterError::RemoteRejected(master.id.clone(), reason)),
        }
    }

    /// Best-effort, one-shot leave notice. Failures are logged and
    /// ignored; the caller proceeds with shutdown either way.
    pub async fn send_leave_request(&self, master: &NodeDescriptor, local: &NodeDescriptor, timeout: Duration) {
        if self.transport.connect(master).await.is_err() {
            return;
        }
        let payload = match bincode::serialize(local) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                warn!(error = %e, "failed to serialize leave request");
                return;
            }
        };
        if let Err(e) = self.transport.send(&master.id, LEAVE_ACTION, payload, timeout).await {
            warn!(master = %master.id, error = %e, "leave request failed, ignoring");
        }
        self.transport.disconnect(&master.id).await;
    }
}

/// Outcome of the master-side validate-join round-trip, handed to the
/// discovery controller's elected-other/elected-self task submission.
#[derive(Debug)]
pub enum ValidateJoinOutcome {
    /// The candidate may be added to the node set.
    Accept,
    /// Reject with a human-readable reason (e.g. wrong cluster name).
    Reject(String),
    /// The local node is not currently master; the candidate should retry
    /// elsewhere (or retry this same peer once a master is known again).
    NotMaster,
}

/// Registers the master-side `membership.join`/`membership.leave` wire
/// handlers. `on_join` and `on_leave` are expected to submit a
/// [`crate::cluster_state_task::ClusterStateTask`] rather than mutate
/// anything directly.
///
/// Before accepting, the master performs the `membership.validate_join`
/// round trip against the candidate itself (see
/// [`validate_join_round_trip`]) rather than trusting the candidate's
/// self-declared cluster name alone, per the master-side validate-join
/// step of the join protocol.
pub fn install_join_handler<J, V>(
    transport: &Arc<dyn Transport>,
    cluster_name: String,
    validate_timeout: Duration,
    validate: V,
    on_join: J,
) where
    J: Fn(NodeDescriptor) + Send + Sync + 'static,
    V: Fn(&NodeDescriptor) -> ValidateJoinOutcome + Send + Sync + 'static,
{
    let validate = Arc::new(validate);
    let on_join = Arc::new(on_join);
    let cluster_name = Arc::new(cluster_name);
    let transport = Arc::clone(transport);

    let handler: Handler = Arc::new(move |_from, payload| {
        let validate = Arc::clone(&validate);
        let on_join = Arc::clone(&on_join);
        let cluster_name = Arc::clone(&cluster_name);
        let transport = Arc::clone(&transport);
        Box::pin(async move {
            let req: JoinWireRequest = bincode::deserialize(&payload)?;
            let reply = if req.cluster_name != *cluster_name {
                JoinWireReply::Rejected(format!(
                    "wrong cluster name: expected {cluster_name}, got {}",
                    req.cluster_name
                ))
            } else {
                match validate(&req.candidate) {
                    ValidateJoinOutcome::Accept => {
                        match validate_join_round_trip(&transport, &req.candidate, &cluster_name, validate_timeout)
                            .await
                        {
                            Ok(()) => {
                                on_join(req.candidate);
                                JoinWireReply::Accepted
                            }
                            Err(reason) => {
                                warn!(candidate = %req.candidate.id, reason, "validate-join round trip rejected candidate");
                                JoinWireReply::Rejected(reason)
                            }
                        }
                    }
                    ValidateJoinOutcome::Reject(reason) => JoinWireReply::Rejected(reason),
                    ValidateJoinOutcome::NotMaster => JoinWireReply::NotMaster,
                }
            };
            Ok(Bytes::from(bincode::serialize(&reply)?))
        })
    });
    transport.register_handler(JOIN_ACTION, handler);
}

/// Registers the master-side `membership.leave` handler. `on_leave`
/// should submit a removal task rather than mutate state directly.
pub fn install_leave_handler<L>(transport: &Arc<dyn Transport>, on_leave: L)
where
    L: Fn(NodeDescriptor) + Send + Sync + 'static,
{
    let on_leave = Arc::new(on_leave);
    let handler: Handler = Arc::new(move |_from, payload| {
        let on_leave = Arc::clone(&on_leave);
        Box::pin(async move {
            let leaving: NodeDescriptor = bincode::deserialize(&payload)?;
            on_leave(leaving);
            Ok(Bytes::new())
        })
    });
    transport.register_handler(LEAVE_ACTION, handler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, TransportHub};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn join_is_accepted_when_cluster_name_matches() {
        let hub = TransportHub::new();
        let master_id = crate::node::NodeId::from("master");
        let master_transport =
            InProcessTransport::register(master_id.clone(), addr(9500), hub.clone()).await;
        let candidate_transport =
            InProcessTransport::register(crate::node::NodeId::from("candidate"), addr(9501), hub).await;

        let joined = Arc::new(AtomicBool::new(false));
        let joined_clone = Arc::clone(&joined);
        let master_transport_dyn: Arc<dyn Transport> = master_transport;
        let candidate_transport_dyn: Arc<dyn Transport> = candidate_transport;
        install_validate_join_handler(&candidate_transport_dyn, "test-cluster".to_owned());
        install_join_handler(
            &master_transport_dyn,
            "test-cluster".to_owned(),
            Duration::from_millis(200),
            |_candidate| ValidateJoinOutcome::Accept,
            move |_candidate| joined_clone.store(true, Ordering::SeqCst),
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let client = MembershipClient::new(candidate_transport_dyn, "test-cluster", 3, Duration::from_millis(10));
        let master_desc = NodeDescriptor::new(master_id, addr(9500));
        let candidate_desc = NodeDescriptor::new("candidate", addr(9501));

        client
            .send_join_request_blocking(&master_desc, &candidate_desc, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(joined.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn join_is_rejected_on_cluster_name_mismatch() {
        let hub = TransportHub::new();
        let master_id = crate::node::NodeId::from("master");
        let master_transport =
            InProcessTransport::register(master_id.clone(), addr(9502), hub.clone()).await;
        let candidate_transport =
            InProcessTransport::register(crate::node::NodeId::from("candidate"), addr(9503), hub).await;

        let master_transport_dyn: Arc<dyn Transport> = master_transport;
        let candidate_transport_dyn: Arc<dyn Transport> = candidate_transport;
        install_validate_join_handler(&candidate_transport_dyn, "wrong-cluster".to_owned());
        install_join_handler(
            &master_transport_dyn,
            "real-cluster".to_owned(),
            Duration::from_millis(200),
            |_candidate| ValidateJoinOutcome::Accept,
            |_candidate| {},
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let client = MembershipClient::new(candidate_transport_dyn, "wrong-cluster", 3, Duration::from_millis(10));
        let master_desc = NodeDescriptor::new(master_id, addr(9502));
        let candidate_desc = NodeDescriptor::new("candidate", addr(9503));

        let err = client
            .send_join_request_blocking(&master_desc, &candidate_desc, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::RemoteRejected(_, _)));
    }

    #[tokio::test]
    async fn join_is_rejected_when_validate_round_trip_disagrees_on_cluster_name() {
        // The join request payload itself claims the right cluster name,
        // but a direct validate-join round trip to the candidate reveals
        // it actually believes in a different one — the master must not
        // trust the self-declared payload alone.
        let hub = TransportHub::new();
        let master_id = crate::node::NodeId::from("master");
        let master_transport =
            InProcessTransport::register(master_id.clone(), addr(9504), hub.clone()).await;
        let candidate_transport =
            InProcessTransport::register(crate::node::NodeId::from("candidate"), addr(9505), hub).await;

        let joined = Arc::new(AtomicBool::new(false));
        let joined_clone = Arc::clone(&joined);
        let master_transport_dyn: Arc<dyn Transport> = master_transport;
        let candidate_transport_dyn: Arc<dyn Transport> = candidate_transport;
        install_validate_join_handler(&candidate_transport_dyn, "stale-cluster".to_owned());
        install_join_handler(
            &master_transport_dyn,
            "test-cluster".to_owned(),
            Duration::from_millis(200),
            |_candidate| ValidateJoinOutcome::Accept,
            move |_candidate| joined_clone.store(true, Ordering::SeqCst),
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let client = MembershipClient::new(candidate_transport_dyn, "test-cluster", 1, Duration::from_millis(10));
        let master_desc = NodeDescriptor::new(master_id, addr(9504));
        let candidate_desc = NodeDescriptor::new("candidate", addr(9505));

        let err = client
            .send_join_request_blocking(&master_desc, &candidate_desc, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::RemoteRejected(_, _)));
        assert!(!joined.load(Ordering::SeqCst));
    }
}
