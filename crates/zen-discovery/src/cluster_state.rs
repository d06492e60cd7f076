//! Immutable cluster-state snapshots.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, NodeSet};

/// Distinguished block that forbids reads/writes while no master is known.
pub const NO_MASTER_BLOCK: &str = "no_master_block";

/// A set of cluster-wide guards. Only [`NO_MASTER_BLOCK`] has meaning to
/// this core; application-defined blocks pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlocks(BTreeSet<String>);

impl ClusterBlocks {
    /// No blocks set.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Only `NO_MASTER_BLOCK` set, as a freshly-initialized or rejoining
    /// node observes.
    #[must_use]
    pub fn no_master() -> Self {
        let mut set = BTreeSet::new();
        set.insert(NO_MASTER_BLOCK.to_owned());
        Self(set)
    }

    /// Add a block.
    pub fn add(&mut self, block: impl Into<String>) {
        self.0.insert(block.into());
    }

    /// Remove a block.
    pub fn remove(&mut self, block: &str) {
        self.0.remove(block);
    }

    /// Whether `NO_MASTER_BLOCK` is present.
    #[must_use]
    pub fn has_no_master_block(&self) -> bool {
        self.0.contains(NO_MASTER_BLOCK)
    }
}

/// Opaque application metadata (routing tables, index metadata, ...)
/// carried through unchanged by this core. Represented as a structurally
/// shared JSON value so unchanged metadata survives a version bump without
/// being recloned or reparsed by this crate, matching the "preserve
/// routing and metadata objects unchanged by version" rule in
/// [`crate::discovery`]'s pending-state drain.
pub type Metadata = serde_json::Value;

/// Immutable snapshot of cluster membership and metadata.
///
/// `version` is monotonically increasing while the master id is unchanged;
/// on a master change it restarts at an arbitrary value, so comparing
/// versions across different masters is meaningless (see
/// [`ClusterState::is_same_master_as`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic version within a single master's series.
    pub version: u64,
    /// Cluster name; joins/states with a mismatched name are rejected.
    pub cluster_name: String,
    /// Membership, including the believed master id.
    pub nodes: NodeSet,
    /// Cluster-wide guard flags.
    pub blocks: ClusterBlocks,
    /// Opaque application metadata, passed through unchanged.
    pub metadata: Metadata,
}

impl ClusterState {
    /// A fresh, unformed state: no master, `NO_MASTER_BLOCK` set, only the
    /// local node present.
    #[must_use]
    pub fn unformed(cluster_name: impl Into<String>, local: crate::node::NodeDescriptor) -> Self {
        let local_id = local.id.clone();
        let mut nodes = NodeSet::new();
        nodes.local_id = Some(local_id);
        nodes.insert(local);
        Self {
            version: 0,
            cluster_name: cluster_name.into(),
            nodes,
            blocks: ClusterBlocks::no_master(),
            metadata: Metadata::Null,
        }
    }

    /// Whether this state currently has no master, per the invariant that
    /// `master_id == None` iff `NO_MASTER_BLOCK` is set.
    #[must_use]
    pub fn has_no_master(&self) -> bool {
        self.nodes.master_id.is_none()
    }

    /// Whether `other` comes from the same master as `self`.
    #[must_use]
    pub fn is_same_master_as(&self, other: &ClusterState) -> bool {
        self.nodes.master_id.is_some() && self.nodes.master_id == other.nodes.master_id
    }

    /// Whether `self.version < other.version`, only meaningful when both
    /// states share a master (see [`ClusterState::is_same_master_as`]).
    #[must_use]
    pub fn precedes(&self, other: &ClusterState) -> bool {
        self.version < other.version
    }

    /// Derive the next version from this state, keeping the same master.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// Check the invariant that a node id equal to the master id clears
    /// `NO_MASTER_BLOCK`, and vice versa (property P2).
    #[must_use]
    pub fn master_block_invariant_holds(&self) -> bool {
        self.nodes.master_id.is_some() != self.blocks.has_no_master_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeDescriptor;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9300".parse().unwrap()
    }

    #[test]
    fn unformed_state_has_no_master_block() {
        let state = ClusterState::unformed("test", NodeDescriptor::new("a", addr()));
        assert!(state.has_no_master());
        assert!(state.blocks.has_no_master_block());
        assert!(state.master_block_invariant_holds());
    }

    #[test]
    fn precedes_compares_versions() {
        let mut s1 = ClusterState::unformed("test", NodeDescriptor::new("a", addr()));
        s1.nodes.master_id = Some("a".into());
        s1.blocks.remove(NO_MASTER_BLOCK);
        s1.version = 5;
        let mut s2 = s1.clone();
        s2.version = 6;
        assert!(s1.precedes(&s2));
        assert!(s1.is_same_master_as(&s2));
    }

    #[test]
    fn invariant_fails_when_master_set_without_clearing_block() {
        let mut state = ClusterState::unformed("test", NodeDescriptor::new("a", addr()));
        state.nodes.master_id = Some("a".into());
        // block still set -> invariant violated
        assert!(!state.master_block_invariant_holds());
    }
}
