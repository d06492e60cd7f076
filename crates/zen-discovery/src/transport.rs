//! Connection-oriented request/response transport (external contract).
//!
//! This core depends only on the [`Transport`] trait; a production binary
//! supplies a concrete implementation (gRPC, raw TCP, ...) that is not
//! part of this crate. [`InProcessTransport`] is the reference
//! implementation used by this crate's own tests: it connects
//! same-process nodes registered on a shared [`TransportHub`] through
//! `tokio` channels, which is enough to exercise every protocol in this
//! crate without a real socket.
//!
//! A caller may `connect()` by address before it knows a peer's real id
//! (unicast ping does exactly this, handing out a synthetic id of its
//! own choosing). [`InProcessTransport`] resolves the connect by address
//! against the hub and remembers an alias from the caller's chosen id to
//! the peer's real id, so a later `send()` by that id is routed
//! correctly even though no real socket handshake ever happened.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{NodeDescriptor, NodeId};

/// A pending handler invocation's result.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ClusterResult<Bytes>> + Send>>;

/// A registered handler for an action name: takes the raw request bytes
/// and the sender's id, returns a future resolving to response bytes or
/// an error. Boxed rather than expressed via `async_trait` because this
/// is a bare `Fn`, not a trait impl.
pub type Handler = Arc<dyn Fn(NodeId, Bytes) -> HandlerFuture + Send + Sync + 'static>;

/// Connection-oriented request/response transport between nodes.
///
/// Action-not-found is surfaced as [`ClusterError::ActionNotFound`]
/// distinctly from other transport errors so callers can use it for
/// ping-version negotiation (§4.2); connect failures surface as
/// [`ClusterError::ConnectError`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a logical connection to `node`. Idempotent.
    async fn connect(&self, node: &NodeDescriptor) -> ClusterResult<()>;

    /// Tear down the logical connection to `node`, if any.
    async fn disconnect(&self, node: &NodeId);

    /// Send `request` for `action` to `node` and wait up to `timeout` for
    /// a reply.
    async fn send(
        &self,
        node: &NodeId,
        action: &str,
        request: Bytes,
        timeout: Duration,
    ) -> ClusterResult<Bytes>;

    /// Register a handler for inbound requests naming `action`.
    fn register_handler(&self, action: &str, handler: Handler);
}

type Inbox = mpsc::UnboundedSender<InboundRequest>;

struct InboundRequest {
    from: NodeId,
    action: String,
    payload: Bytes,
    reply: oneshot::Sender<ClusterResult<Bytes>>,
}

struct NodeEndpoint {
    id: NodeId,
    inbox: Inbox,
}

/// A shared registry of same-process nodes, used by [`InProcessTransport`]
/// to route sends between peers without a real network. Endpoints are
/// looked up by address, mirroring how a real transport dials a socket
/// before it has confirmed the peer's identity.
#[derive(Default)]
pub struct TransportHub {
    endpoints: Mutex<HashMap<SocketAddr, NodeEndpoint>>,
}

impl TransportHub {
    /// An empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Channel-backed [`Transport`] implementation routing through a shared
/// [`TransportHub`]. Intended for tests and for driving the scenarios in
/// this crate's `tests/` directory end-to-end in a single process.
pub struct InProcessTransport {
    local_id: NodeId,
    hub: Arc<TransportHub>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    /// Maps a caller-chosen id (real or synthetic) to the real id and
    /// inbox discovered at `connect()` time.
    aliases: Mutex<HashMap<NodeId, (NodeId, Inbox)>>,
}

impl InProcessTransport {
    /// Register `local_id` at `local_addr` on `hub` and return a
    /// transport handle for it.
    pub async fn register(local_id: NodeId, local_addr: SocketAddr, hub: Arc<TransportHub>) -> Arc<Self> {
        let handlers: Arc<Mutex<HashMap<String, Handler>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundRequest>();

        {
            let mut endpoints = hub.endpoints.lock().await;
            endpoints.insert(
                local_addr,
                NodeEndpoint {
                    id: local_id.clone(),
                    inbox: tx,
                },
            );
        }

        let handlers_for_loop = handlers.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let handler = {
                    let handlers = handlers_for_loop.lock().await;
                    handlers.get(&req.action).cloned()
                };
                tokio::spawn(async move {
                    let result = match handler {
                        Some(h) => h(req.from, req.payload).await,
                        None => Err(ClusterError::ActionNotFound(req.action)),
                    };
                    let _ = req.reply.send(result);
                });
            }
        });

        Arc::new(Self {
            local_id,
            hub,
            handlers,
            aliases: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self, node: &NodeDescriptor) -> ClusterResult<()> {
        let endpoints = self.hub.endpoints.lock().await;
        let endpoint = endpoints.get(&node.address).ok_or_else(|| {
            ClusterError::ConnectError(node.address, "peer not registered on transport hub".into())
        })?;
        let real_id = endpoint.id.clone();
        let inbox = endpoint.inbox.clone();
        drop(endpoints);

        self.aliases
            .lock()
            .await
            .insert(node.id.clone(), (real_id, inbox));
        Ok(())
    }

    async fn disconnect(&self, node: &NodeId) {
        self.aliases.lock().await.remove(node);
    }

    async fn send(
        &self,
        node: &NodeId,
        action: &str,
        request: Bytes,
        timeout: Duration,
    ) -> ClusterResult<Bytes> {
        let (real_id, inbox) = {
            let aliases = self.aliases.lock().await;
            aliases.get(node).cloned().ok_or_else(|| {
                ClusterError::TransportError(format!("{node} is not connected, call connect() first"))
            })?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let req = InboundRequest {
            from: self.local_id.clone(),
            action: action.to_owned(),
            payload: request,
            reply: reply_tx,
        };
        if inbox.send(req).is_err() {
            return Err(ClusterError::TransportError("peer inbox closed".into()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::TransportError("peer dropped reply".into())),
            Err(_) => {
                debug!(%real_id, action, "send timed out");
                Err(ClusterError::Timeout(timeout))
            }
        }
    }

    fn register_handler(&self, action: &str, handler: Handler) {
        let handlers = self.handlers.clone();
        let action = action.to_owned();
        tokio::spawn(async move {
            handlers.lock().await.insert(action, handler);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn connect_fails_for_unregistered_address() {
        let hub = TransportHub::new();
        let t = InProcessTransport::register(NodeId::from("a"), addr(9300), hub).await;
        let stranger = NodeDescriptor::new("ghost", addr(9399));
        let err = t.connect(&stranger).await.unwrap_err();
        assert!(matches!(err, ClusterError::ConnectError(_, _)));
    }

    #[tokio::test]
    async fn send_round_trips_through_registered_handler() {
        let hub = TransportHub::new();
        let a = InProcessTransport::register(NodeId::from("a"), addr(9301), hub.clone()).await;
        let b = InProcessTransport::register(NodeId::from("b"), addr(9302), hub).await;

        b.register_handler(
            "echo",
            Arc::new(|_from, payload| Box::pin(async move { Ok(payload) })),
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        a.connect(&NodeDescriptor::new("b", addr(9302))).await.unwrap();
        let resp = a
            .send(
                &NodeId::from("b"),
                "echo",
                Bytes::from_static(b"hi"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(resp, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn connect_by_synthetic_id_resolves_to_real_peer() {
        let hub = TransportHub::new();
        let a = InProcessTransport::register(NodeId::from("a"), addr(9303), hub.clone()).await;
        let b = InProcessTransport::register(NodeId::from("b"), addr(9304), hub).await;

        b.register_handler(
            "whoami",
            Arc::new(|from, _payload| {
                Box::pin(async move { Ok(Bytes::from(from.as_str().to_owned())) })
            }),
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let temp = NodeId::temporary(0);
        a.connect(&NodeDescriptor::new(temp.clone(), addr(9304))).await.unwrap();
        let resp = a
            .send(&temp, "whoami", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn unknown_action_is_reported_distinctly() {
        let hub = TransportHub::new();
        let a = InProcessTransport::register(NodeId::from("a"), addr(9305), hub.clone()).await;
        let _b = InProcessTransport::register(NodeId::from("b"), addr(9306), hub).await;

        a.connect(&NodeDescriptor::new("b", addr(9306))).await.unwrap();
        let err = a
            .send(
                &NodeId::from("b"),
                "ping.unicast.v2",
                Bytes::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ActionNotFound(_)));
    }

    #[tokio::test]
    async fn send_without_connect_is_rejected() {
        let hub = TransportHub::new();
        let a = InProcessTransport::register(NodeId::from("a"), addr(9307), hub).await;
        let err = a
            .send(&NodeId::from("b"), "echo", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TransportError(_)));
    }
}
