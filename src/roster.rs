//! Data model: participants, the roster, and the server topology.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::dh::DhPublicKey;

/// A participant id: a small integer unique within a roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Everything an honest node knows about a peer: its long-term signing and DH
/// public keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub signing_pk: PublicKey,
    pub dh_pk: DhPublicKey,
}

/// The full roster at a point in time: every participant, plus the ordered server
/// subgroup. Identical at every honest node when a round starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    members: BTreeMap<NodeId, NodeInfo>,
    /// Server subgroup, in topology order (first to shuffle first).
    subgroup: Vec<NodeId>,
}

impl Roster {
    pub fn new(members: BTreeMap<NodeId, NodeInfo>, subgroup: Vec<NodeId>) -> Self {
        Self { members, subgroup }
    }

    pub fn all_ids(&self) -> BTreeSet<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn info(&self, id: NodeId) -> Option<&NodeInfo> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    /// Server subgroup, in topology order.
    pub fn subgroup(&self) -> &[NodeId] {
        &self.subgroup
    }

    pub fn is_server(&self, id: NodeId) -> bool {
        self.subgroup.contains(&id)
    }

    /// Clients: roster minus subgroup.
    pub fn clients(&self) -> Vec<NodeId> {
        self.members
            .keys()
            .copied()
            .filter(|id| !self.is_server(*id))
            .collect()
    }

    /// The round leader: first in the server subgroup.
    pub fn leader(&self) -> Option<NodeId> {
        self.subgroup.first().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns a new roster with the given ids removed (used after blame excludes
    /// members).
    pub fn without(&self, excluded: &BTreeSet<NodeId>) -> Self {
        let members = self
            .members
            .iter()
            .filter(|(id, _)| !excluded.contains(id))
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        let subgroup = self
            .subgroup
            .iter()
            .copied()
            .filter(|id| !excluded.contains(id))
            .collect();
        Self { members, subgroup }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_info() -> NodeInfo {
        use crate::crypto::{CryptoPort, RsaCrypto};
        use crate::dh::DhKeypair;
        let crypto = RsaCrypto;
        let (_sk, pk) = crypto.gen_keypair(512).unwrap();
        NodeInfo {
            signing_pk: pk,
            dh_pk: DhKeypair::generate().public(),
        }
    }

    #[test]
    fn leader_is_first_server_in_topology_order() {
        let members = (1..=3).map(|i| (NodeId(i), dummy_info())).collect();
        let roster = Roster::new(members, vec![NodeId(2), NodeId(3)]);
        assert_eq!(roster.leader(), Some(NodeId(2)));
        assert_eq!(roster.clients(), vec![NodeId(1)]);
    }

    #[test]
    fn without_removes_from_both_member_and_subgroup_lists() {
        let members = (1..=3).map(|i| (NodeId(i), dummy_info())).collect();
        let roster = Roster::new(members, vec![NodeId(1), NodeId(2)]);
        let excluded = BTreeSet::from([NodeId(2)]);
        let trimmed = roster.without(&excluded);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed.subgroup(), &[NodeId(1)]);
    }
}
