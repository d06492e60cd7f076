//! Master-side cluster-state broadcast with per-follower ack tracking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster_state::ClusterState;
use crate::error::ClusterResult;
use crate::node::NodeId;
use crate::transport::{Handler, Transport};

/// Wire action a published state is sent on.
pub const PUBLISH_ACTION: &str = "cluster_state.publish";

/// Tracks which followers have acked the in-flight publish, so a retry
/// (if ever added by a caller) would know who still needs a resend.
/// Per spec, this crate stops retrying a node on its first successful
/// delivery and never retries beyond that — the listener exists to let
/// callers observe completion, not to drive retries itself.
#[derive(Default)]
pub struct AckListener {
    acked: Mutex<HashSet<NodeId>>,
    failed: Mutex<HashSet<NodeId>>,
}

impl AckListener {
    /// A listener expecting acks from nobody yet.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn mark_acked(&self, node: NodeId) {
        self.acked.lock().await.insert(node);
    }

    async fn mark_failed(&self, node: NodeId) {
        self.failed.lock().await.insert(node);
    }

    /// Nodes that acked the most recent publish this listener tracked.
    pub async fn acked_nodes(&self) -> HashSet<NodeId> {
        self.acked.lock().await.clone()
    }

    /// Nodes that failed to ack the most recent publish this listener
    /// tracked.
    pub async fn failed_nodes(&self) -> HashSet<NodeId> {
        self.failed.lock().await.clone()
    }
}

/// Broadcasts a cluster state to every follower in its node set.
pub struct PublishClusterState {
    transport: Arc<dyn Transport>,
    publish_timeout: Duration,
}

impl PublishClusterState {
    /// A publisher sending on `transport`, waiting up to
    /// `publish_timeout` for each follower's ack.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, publish_timeout: Duration) -> Self {
        Self {
            transport,
            publish_timeout,
        }
    }

    /// Send `state` to every node in its node set other than `local_id`,
    /// in parallel, recording each outcome on `listener`.
    pub async fn publish(&self, state: &ClusterState, local_id: &NodeId, listener: &Arc<AckListener>) -> ClusterResult<()> {
        let payload = Bytes::from(bincode::serialize(state)?);
        let version = state.version;

        let mut joins = tokio::task::JoinSet::new();
        for node in state.nodes.iter() {
            if &node.id == local_id {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let payload = payload.clone();
            let timeout = self.publish_timeout;
            let listener = Arc::clone(listener);
            let node_id = node.id.clone();
            let descriptor = node.clone();

            joins.spawn(async move {
                if let Err(e) = transport.connect(&descriptor).await {
                    warn!(node = %node_id, error = %e, "publish connect failed");
                    listener.mark_failed(node_id).await;
                    return;
                }
                match transport.send(&node_id, PUBLISH_ACTION, payload, timeout).await {
                    Ok(_) => {
                        debug!(node = %node_id, version, "publish acked");
                        listener.mark_acked(node_id.clone()).await;
                    }
                    Err(e) => {
                        warn!(node = %node_id, error = %e, "publish failed");
                        listener.mark_failed(node_id.clone()).await;
                    }
                }
                transport.disconnect(&node_id).await;
            });
        }

        while joins.join_next().await.is_some() {}
        Ok(())
    }
}

/// Registers the follower-side `cluster_state.publish` handler. `on_state`
/// is expected to enqueue the state into `pending_states` and submit the
/// URGENT drain task, per the discovery controller's follower path — it
/// must not block.
pub fn install_publish_handler<F>(transport: &Arc<dyn Transport>, on_state: F)
where
    F: Fn(ClusterState) + Send + Sync + 'static,
{
    let on_state = Arc::new(on_state);
    let handler: Handler = Arc::new(move |_from, payload| {
        let on_state = Arc::clone(&on_state);
        Box::pin(async move {
            let state: ClusterState = bincode::deserialize(&payload)?;
            on_state(state);
            Ok(Bytes::new())
        })
    });
    transport.register_handler(PUBLISH_ACTION, handler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeDescriptor;
    use crate::transport::{InProcessTransport, TransportHub};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_every_follower_and_acks() {
        let hub = TransportHub::new();
        let master_transport =
            InProcessTransport::register(NodeId::from("master"), addr(9600), hub.clone()).await;

        let received = Arc::new(AtomicUsize::new(0));
        for (id, port) in [("f1", 9601u16), ("f2", 9602)] {
            let t = InProcessTransport::register(NodeId::from(id), addr(port), hub.clone()).await;
            let t_dyn: Arc<dyn Transport> = t;
            let received = Arc::clone(&received);
            install_publish_handler(&t_dyn, move |_state| {
                received.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut state = ClusterState::unformed("test-cluster", NodeDescriptor::new("master", addr(9600)));
        state.nodes.master_id = Some(NodeId::from("master"));
        state.blocks.remove(crate::cluster_state::NO_MASTER_BLOCK);
        state.nodes.insert(NodeDescriptor::new("f1", addr(9601)));
        state.nodes.insert(NodeDescriptor::new("f2", addr(9602)));

        let publisher = PublishClusterState::new(master_transport, Duration::from_secs(1));
        let listener = AckListener::new();
        publisher
            .publish(&state, &NodeId::from("master"), &listener)
            .await
            .unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(listener.acked_nodes().await.len(), 2);
        assert!(listener.failed_nodes().await.is_empty());
    }
}
