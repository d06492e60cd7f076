//! Cluster error types and result definitions.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-specific errors.
///
/// Variants carry kinds of failure, not a Java-style exception hierarchy:
/// whether a variant is retriable, terminal, or should drive the node into
/// rejoin is a property of how callers react to it, documented alongside
/// each variant below and in the crate's module docs.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Node not found in the local node set.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// Node already known.
    #[error("node {0} already exists in cluster")]
    NodeAlreadyExists(NodeId),

    /// A heartbeat or join arrived from a node the recipient does not
    /// recognize as a member of its own cluster.
    #[error("{0} is not a member of this cluster")]
    NotInCluster(NodeId),

    /// No master elected or known.
    #[error("no master elected in cluster")]
    NoLeader,

    /// The local node is not (or no longer) the master.
    #[error("node {0} is not master, master is {1:?}")]
    NotMaster(NodeId, Option<NodeId>),

    /// A transport-level connect attempt failed. Retriable via the outer
    /// loop (ping round, join retry).
    #[error("failed to connect to {0}: {1}")]
    ConnectError(SocketAddr, String),

    /// The requested action has no registered handler on the peer. Used
    /// for ping-version negotiation (fall back to the legacy action).
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// A peer replied to a join request that it is not currently master.
    /// Retriable at the join-request level, up to `join_retry_attempts`.
    #[error("{0} is not master for join request")]
    NotMasterForJoin(NodeId),

    /// A peer rejected a request outright (not retriable).
    #[error("request rejected by {0}: {1}")]
    RemoteRejected(NodeId, String),

    /// Join/validate-join rejected because of a cluster-name mismatch.
    #[error("wrong cluster name: expected {expected}, got {actual}")]
    WrongClusterName {
        /// Cluster name the local node believes in.
        expected: String,
        /// Cluster name the remote peer sent.
        actual: String,
    },

    /// A published state was older than (or equal to) the one already
    /// held from the same master. Callers ignore this silently.
    #[error("stale state: version {0} from {1}")]
    StaleState(u64, NodeId),

    /// Quorum of master-eligible nodes was lost; caller should rejoin and
    /// set `NO_MASTER_BLOCK`.
    #[error("quorum lost: need {needed}, have {have}")]
    QuorumLost {
        /// Configured `minimum_master_nodes`.
        needed: usize,
        /// Master-eligible nodes actually present.
        have: usize,
    },

    /// Transport error not covered by a more specific variant.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Service discovery error (DNS/etcd unicast-hosts provider).
    #[error("service discovery error: {0}")]
    DiscoveryError(String),

    /// Operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An uncaught error inside a cluster-state task. The task is
    /// abandoned via `on_failure`; state is left unchanged.
    #[error("cluster-state task failed: {0}")]
    TaskFailed(String),

    /// A state-executor-only operation was invoked outside the executor.
    #[error("operation must run on the cluster-state executor")]
    NotOnExecutor,

    /// Internal invariant violation.
    #[error("internal cluster error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl ClusterError {
    /// Whether this error should be retried by the join-request loop,
    /// as opposed to being terminal for the current join attempt.
    #[must_use]
    pub fn is_retriable_join(&self) -> bool {
        matches!(self, Self::NotMasterForJoin(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_master_for_join_is_retriable() {
        let err = ClusterError::NotMasterForJoin(NodeId::from("a"));
        assert!(err.is_retriable_join());
    }

    #[test]
    fn other_errors_are_not_retriable_join() {
        assert!(!ClusterError::NoLeader.is_retriable_join());
        assert!(!ClusterError::Internal("x".into()).is_retriable_join());
    }
}
