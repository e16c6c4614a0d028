//! Shared round vocabulary used by shuffle, bulk, and blame: a flat `RoundKind`
//! sum type plus a table of state handlers, in place of a deep inheritance chain.

use std::any::Any;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::Digest20;
use crate::roster::NodeId;

/// Immutable round identifier: `hash(session_id ‖ round_counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundId(pub Digest20);

impl RoundId {
    pub fn derive(crypto: &impl crate::crypto::CryptoPort, session_id: &[u8], round_counter: u64) -> Self {
        Self(crypto.hash(&[session_id, &round_counter.to_be_bytes()]))
    }
}

/// Which kind of round is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundKind {
    Shuffle,
    Bulk,
    BlameShuffle,
}

/// Payload produced while processing a received message, consumed at finalize
/// time (mirrors `manul::protocol::Payload`'s type-erased accumulator pattern,
/// collapsed here to a concrete enum per round kind since this core has a closed
/// set of round kinds rather than an open protocol framework).
#[derive(Debug)]
pub struct Payload(pub Box<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: 'static + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast<T: 'static>(self) -> Result<T, crate::error::LocalError> {
        self.0
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| crate::error::LocalError::new("payload type mismatch"))
    }
}

/// The terminal outcome of any of the three round kinds: `Success(plaintexts)`
/// or `Failure(bad_members)`.
#[derive(Debug)]
pub enum RoundOutcome<T> {
    Success(T),
    Failure { bad_members: BTreeSet<NodeId> },
}

/// A fatal, unrecoverable transport/crypto-stack failure distinct from a provable
/// blame outcome: `success=false, bad_members=[]`.
pub fn unrecoverable_failure<T>() -> RoundOutcome<T> {
    RoundOutcome::Failure { bad_members: BTreeSet::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RsaCrypto;

    #[test]
    fn round_id_is_deterministic_in_its_inputs() {
        let crypto = RsaCrypto;
        let a = RoundId::derive(&crypto, b"session-1", 3);
        let b = RoundId::derive(&crypto, b"session-1", 3);
        let c = RoundId::derive(&crypto, b"session-1", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
