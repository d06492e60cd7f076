//! Pure, deterministic master election.
//!
//! Every function here is a pure function of its inputs: no I/O, no
//! mutable shared state, so the same candidate set and settings always
//! produce the same elected node (property P4).

use serde::{Deserialize, Serialize};

use crate::node::NodeDescriptor;

/// Filtering policy applied before election and before ping-target
/// priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionFilter {
    /// Exclude client-role nodes from the candidate set. Kept as a
    /// setting (default `true`) even though client nodes are never
    /// master-eligible, so the ping-target variant of this filter
    /// ([`sort_by_master_likelihood`]) has an explicit knob.
    pub filter_client: bool,
    /// Exclude data-only (non-master-eligible, data-holding) nodes.
    pub filter_data: bool,
}

impl Default for ElectionFilter {
    fn default() -> Self {
        Self {
            filter_client: true,
            filter_data: false,
        }
    }
}

/// Apply the election filter, returning only nodes that remain eligible
/// as election candidates: master-eligible, and not excluded by the
/// active filter flags.
fn filtered_candidates<'a>(
    nodes: impl IntoIterator<Item = &'a NodeDescriptor>,
    filter: ElectionFilter,
) -> Vec<&'a NodeDescriptor> {
    nodes
        .into_iter()
        .filter(|n| n.roles.master_eligible)
        .filter(|n| !(filter.filter_client && n.roles.client))
        .filter(|n| !(filter.filter_data && n.roles.data && !n.roles.master_eligible))
        .collect()
}

/// Count master-eligible nodes after filtering, for use in
/// [`has_enough_master_nodes`].
fn count_master_eligible<'a>(
    nodes: impl IntoIterator<Item = &'a NodeDescriptor>,
    filter: ElectionFilter,
) -> usize {
    filtered_candidates(nodes, filter).len()
}

/// Whether the given node set has at least `minimum_master_nodes`
/// master-eligible members after filtering.
#[must_use]
pub fn has_enough_master_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a NodeDescriptor>,
    minimum_master_nodes: usize,
    filter: ElectionFilter,
) -> bool {
    count_master_eligible(nodes, filter) >= minimum_master_nodes
}

/// Sort candidates by `(version ascending, id ascending)` — "smallest id
/// wins, oldest version preferred" — and return the id of the winner.
///
/// This is the sole tie-break rule; it must be reproduced bit-exactly, so
/// the comparator is a plain derived-trait-free tuple comparison rather
/// than anything that could be affected by locale or hashing.
#[must_use]
pub fn elect_master<'a>(
    candidates: impl IntoIterator<Item = &'a NodeDescriptor>,
    filter: ElectionFilter,
) -> Option<&'a NodeDescriptor> {
    filtered_candidates(candidates, filter)
        .into_iter()
        .min_by(|a, b| (&a.version, &a.id).cmp(&(&b.version, &b.id)))
}

/// Order candidates by the same `(version, id)` key used by
/// [`elect_master`], for use as a ping-target priority list: nodes most
/// likely to already be (or become) master are tried first.
#[must_use]
pub fn sort_by_master_likelihood(
    candidates: &mut [&NodeDescriptor],
    filter: ElectionFilter,
) {
    candidates.retain(|n| {
        n.roles.master_eligible
            && !(filter.filter_client && n.roles.client)
            && !(filter.filter_data && n.roles.data && !n.roles.master_eligible)
    });
    candidates.sort_by(|a, b| (&a.version, &a.id).cmp(&(&b.version, &b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRoles;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9300".parse().unwrap()
    }

    fn node(id: &str, version: &str, roles: NodeRoles) -> NodeDescriptor {
        let mut n = NodeDescriptor::new(id, addr());
        n.version = version.to_owned();
        n.roles = roles;
        n
    }

    #[test]
    fn smallest_id_wins_at_equal_version() {
        let a = node("a", "1.0", NodeRoles::master_and_data());
        let b = node("b", "1.0", NodeRoles::master_and_data());
        let winner = elect_master([&a, &b], ElectionFilter::default()).unwrap();
        assert_eq!(winner.id, a.id);
    }

    #[test]
    fn oldest_version_preferred_over_id() {
        // "z" has the older version ("1" < "2") despite the larger id, so
        // it wins: version is compared before id.
        let older = node("z", "1", NodeRoles::master_and_data());
        let newer = node("a", "2", NodeRoles::master_and_data());
        let winner = elect_master([&older, &newer], ElectionFilter::default()).unwrap();
        assert_eq!(winner.id, older.id);
    }

    #[test]
    fn clients_are_excluded() {
        let client = node("a", "1", NodeRoles::client_only());
        let data = node("b", "1", NodeRoles::master_and_data());
        let winner = elect_master([&client, &data], ElectionFilter::default()).unwrap();
        assert_eq!(winner.id, data.id);
    }

    #[test]
    fn election_is_deterministic_across_calls() {
        let a = node("a", "1", NodeRoles::master_and_data());
        let b = node("b", "1", NodeRoles::master_and_data());
        let c = node("c", "1", NodeRoles::master_and_data());
        let first = elect_master([&a, &b, &c], ElectionFilter::default()).map(|n| n.id.clone());
        let second = elect_master([&c, &b, &a], ElectionFilter::default()).map(|n| n.id.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn quorum_check_counts_only_master_eligible() {
        let a = node("a", "1", NodeRoles::master_and_data());
        let b = node("b", "1", NodeRoles::data_only());
        assert!(!has_enough_master_nodes([&a, &b], 2, ElectionFilter::default()));
        assert!(has_enough_master_nodes([&a], 1, ElectionFilter::default()));
    }

    #[test]
    fn sort_by_master_likelihood_matches_elect_master_winner() {
        let a = node("a", "1", NodeRoles::master_and_data());
        let b = node("b", "1", NodeRoles::master_and_data());
        let mut list = vec![&b, &a];
        sort_by_master_likelihood(&mut list, ElectionFilter::default());
        assert_eq!(list[0].id, a.id);
    }
}
