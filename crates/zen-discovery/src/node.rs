//! Node descriptors and the node set.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Sentinel prefix minted for unicast targets the local node has not yet
/// exchanged a real node id with. Such nodes are disconnected once the
/// ping round that created them completes.
pub const UNICAST_TEMP_PREFIX: &str = "#zen_unicast_";

/// Unique identifier for a node in the cluster.
///
/// Newtype over `String` rather than a bare string so that the
/// "smallest id wins" tie-break in [`crate::elect_master`] is expressed
/// through `Ord` at the type level instead of ad-hoc comparisons, and so
/// synthetic unicast ids (see [`UNICAST_TEMP_PREFIX`]) are ordinary values
/// of the same type as a joined node's id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Mint a temporary id for a unicast target whose real id is unknown.
    #[must_use]
    pub fn temporary(ordinal: usize) -> Self {
        Self(format!("{UNICAST_TEMP_PREFIX}{ordinal}"))
    }

    /// Whether this id was minted by [`NodeId::temporary`].
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(UNICAST_TEMP_PREFIX)
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role flags describing what a node is eligible to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    /// Eligible to become master and to vote in elections.
    pub master_eligible: bool,
    /// Holds (or would hold) indexed data. Out of this core's scope beyond
    /// the role flag itself, which election filtering consults.
    pub data: bool,
    /// Client-only node: never eligible for election.
    pub client: bool,
}

impl NodeRoles {
    /// A node eligible to be elected master and to hold data.
    #[must_use]
    pub fn master_and_data() -> Self {
        Self {
            master_eligible: true,
            data: true,
            client: false,
        }
    }

    /// A data-only node: not master-eligible.
    #[must_use]
    pub fn data_only() -> Self {
        Self {
            master_eligible: false,
            data: true,
            client: false,
        }
    }

    /// A client-only node: never participates in election.
    #[must_use]
    pub fn client_only() -> Self {
        Self {
            master_eligible: false,
            data: false,
            client: true,
        }
    }
}

/// Immutable descriptor of a node participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Opaque node identifier, unique within the cluster.
    pub id: NodeId,
    /// Human-readable display name.
    pub name: String,
    /// Address other nodes use to reach this node.
    pub address: SocketAddr,
    /// Free-form string attributes.
    pub attributes: BTreeMap<String, String>,
    /// Software version running on this node.
    pub version: String,
    /// Role flags.
    pub roles: NodeRoles,
}

impl NodeDescriptor {
    /// Construct a minimal master-and-data-eligible descriptor, useful in
    /// tests and as a starting point for builders elsewhere.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            address,
            attributes: BTreeMap::new(),
            version: String::new(),
            roles: NodeRoles::master_and_data(),
        }
    }

    /// Whether this node is eligible to be elected master.
    #[must_use]
    pub fn is_master_eligible(&self) -> bool {
        self.roles.master_eligible
    }
}

/// Ordered mapping from node id to node descriptor, plus the distinguished
/// master and local ids.
///
/// `BTreeMap` keeps iteration order deterministic by id, which matters for
/// reproducing the election tie-break bit-exactly across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    nodes: BTreeMap<NodeId, NodeDescriptor>,
    /// Id of the node this set's holder currently believes is master.
    pub master_id: Option<NodeId>,
    /// Id of the local node, if this node set belongs to a running node
    /// rather than to an inbound message payload.
    pub local_id: Option<NodeId>,
}

impl NodeSet {
    /// An empty node set with no master and no local id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node descriptor.
    pub fn insert(&mut self, node: NodeDescriptor) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node by id, returning it if present.
    pub fn remove(&mut self, id: &NodeId) -> Option<NodeDescriptor> {
        self.nodes.remove(id)
    }

    /// Look up a node descriptor by id.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    /// Whether a node with this id is present.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate node descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Master-eligible nodes in id order.
    pub fn master_eligible(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| n.is_master_eligible())
    }

    /// The descriptor of the node currently believed to be master, if any.
    #[must_use]
    pub fn master(&self) -> Option<&NodeDescriptor> {
        self.master_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Whether the local id equals the believed master id.
    #[must_use]
    pub fn local_is_master(&self) -> bool {
        self.local_id.is_some() && self.local_id == self.master_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9300".parse().unwrap()
    }

    #[test]
    fn node_id_ordering_is_lexicographic() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        assert!(a < b);
    }

    #[test]
    fn temporary_ids_are_recognized() {
        let t = NodeId::temporary(3);
        assert!(t.is_temporary());
        assert!(!NodeId::from("a").is_temporary());
    }

    #[test]
    fn node_set_tracks_master_eligibility() {
        let mut set = NodeSet::new();
        set.insert(NodeDescriptor::new("a", addr()));
        let mut client = NodeDescriptor::new("b", addr());
        client.roles = NodeRoles::client_only();
        set.insert(client);

        assert_eq!(set.len(), 2);
        assert_eq!(set.master_eligible().count(), 1);
    }

    #[test]
    fn local_is_master_requires_both_set_and_equal() {
        let mut set = NodeSet::new();
        set.local_id = Some(NodeId::from("a"));
        assert!(!set.local_is_master());
        set.master_id = Some(NodeId::from("a"));
        assert!(set.local_is_master());
        set.master_id = Some(NodeId::from("b"));
        assert!(!set.local_is_master());
    }
}
