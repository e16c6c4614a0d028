//! External interfaces: configuration.
//!
//! Plain, structured, `serde`-enumerated configuration. CLI parsing, GUI, config
//! file formats, and PEM key loading are out of scope: this module does not parse
//! any file format, an embedder builds a [`Config`] in memory however it likes and
//! hands it to the [`crate::session::SessionController`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SecretKey};
use crate::error::ConfigError;
use crate::roster::NodeId;

/// One entry of `nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub addr: String,
    pub port: u16,
    pub identity_pk: PublicKey,
}

/// One entry of `topology`: the server subgroup ring. Terminals use sentinel `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub node_id: NodeId,
    pub next_id: i64,
    pub prev_id: i64,
}

/// This node's position: either an index into `topology`, or "client".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Server(usize),
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum ProtocolVersion {
    ShuffleOnly,
    V1ShuffleBulk,
    V2NeffCsDcNet,
}

impl ProtocolVersion {
    /// `V2NeffCsDcNet` is accepted for round-tripping through configuration, but
    /// this core does not implement its round body.
    pub fn is_supported(self) -> bool {
        !matches!(self, ProtocolVersion::V2NeffCsDcNet)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub my_node_id: NodeId,
    #[serde(skip)]
    pub identity_sk: Option<SecretKey>,
    pub nodes: BTreeMap<NodeId, NodeEntry>,
    pub num_nodes: u32,
    pub disposable_key_length: usize,
    pub shuffle_msg_length: usize,
    pub topology: Vec<TopologyEntry>,
    pub my_position: Position,
    pub protocol_version: ProtocolVersion,
    pub wait_between_rounds_ms: u64,
}

impl Config {
    /// Checks the structural invariants of the node list and topology.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes as usize != self.nodes.len() {
            return Err(ConfigError::NodeCountMismatch {
                declared: self.num_nodes,
                actual: self.nodes.len(),
            });
        }
        if self.topology.is_empty() {
            return Err(ConfigError::EmptySubgroup);
        }
        if !self.protocol_version.is_supported() {
            return Err(ConfigError::UnsupportedProtocolVersion(self.protocol_version));
        }

        // The topology must form exactly one linked chain: each non-terminal
        // `next_id` must point at another listed entry, and terminals (-1) must
        // appear exactly at the two ends.
        let ids: std::collections::BTreeSet<i64> =
            self.topology.iter().map(|t| t.node_id.0 as i64).collect();
        for entry in &self.topology {
            if entry.next_id != -1 && !ids.contains(&entry.next_id) {
                return Err(ConfigError::MalformedTopology);
            }
            if entry.prev_id != -1 && !ids.contains(&entry.prev_id) {
                return Err(ConfigError::MalformedTopology);
            }
        }
        let terminal_starts = self.topology.iter().filter(|t| t.prev_id == -1).count();
        let terminal_ends = self.topology.iter().filter(|t| t.next_id == -1).count();
        if terminal_starts != 1 || terminal_ends != 1 {
            return Err(ConfigError::MalformedTopology);
        }

        match self.my_position {
            Position::Server(idx) => {
                if idx >= self.topology.len() {
                    return Err(ConfigError::UnresolvedPosition);
                }
            }
            Position::Client => {
                if self.topology.iter().any(|t| t.node_id == self.my_node_id) {
                    return Err(ConfigError::UnresolvedPosition);
                }
            }
        }

        Ok(())
    }

    /// Ordered server ids, first to last in topology order.
    pub fn topology_order(&self) -> Vec<NodeId> {
        let mut by_prev: BTreeMap<i64, &TopologyEntry> = BTreeMap::new();
        for entry in &self.topology {
            by_prev.insert(entry.prev_id, entry);
        }
        let mut order = Vec::with_capacity(self.topology.len());
        let mut cursor = -1i64;
        while let Some(entry) = by_prev.get(&cursor) {
            order.push(entry.node_id);
            cursor = entry.node_id.0 as i64;
        }
        order
    }
}
