//! External interfaces: the wire-exact packet layout.
//!
//! `[nonce: u32][running_hash: H][from: u32][to: u32 or 0][len: u32][body: len
//! bytes][sig: pk-dependent bytes]`, all lengths big-endian.
//!
//! The running-hash chain covers `dst ‖ body`, not only the body, so that a
//! misrouted but otherwise faithfully-replayed packet still breaks the chain.

use crate::crypto::{CryptoPort, Digest20, PublicKey, SecretKey, Signature};
use crate::error::{LocalError, NetworkError};
use crate::roster::NodeId;

/// The single message-type tag shared by shuffle, bulk, and blame states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ShuffleKeyShare = 1,
    ShuffleData = 2,
    ShufflePermuted = 3,
    ShuffleVote = 4,
    ShufflePrivateKey = 5,
    BulkClientCiphertext = 10,
    BulkClientList = 11,
    BulkServerCommit = 12,
    BulkServerCiphertext = 13,
    BulkCleartextSignature = 14,
    BulkCleartextPush = 15,
    BlameDisclosure = 20,
    BlameDisclosureHashTable = 21,
    BlameAccusationShuffleData = 22,
    BlameAlibi = 23,
    BlameNizk = 24,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Result<Self, NetworkError> {
        use MessageType::*;
        Ok(match tag {
            1 => ShuffleKeyShare,
            2 => ShuffleData,
            3 => ShufflePermuted,
            4 => ShuffleVote,
            5 => ShufflePrivateKey,
            10 => BulkClientCiphertext,
            11 => BulkClientList,
            12 => BulkServerCommit,
            13 => BulkServerCiphertext,
            14 => BulkCleartextSignature,
            15 => BulkCleartextPush,
            20 => BlameDisclosure,
            21 => BlameDisclosureHashTable,
            22 => BlameAccusationShuffleData,
            23 => BlameAlibi,
            24 => BlameNizk,
            other => return Err(NetworkError::Transport(format!("unknown message tag {other}"))),
        })
    }
}

/// `None` destination means broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination(pub Option<NodeId>);

impl Destination {
    fn to_wire(self) -> u32 {
        self.0.map(|id| id.0).unwrap_or(0)
    }

    fn from_wire(raw: u32) -> Self {
        Destination(if raw == 0 { None } else { Some(NodeId(raw)) })
    }
}

/// A verified, integrity-protected packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub nonce: u32,
    pub running_hash: Digest20,
    pub from: NodeId,
    pub to: Destination,
    pub body: Vec<u8>,
    pub sig: Signature,
}

impl Packet {
    /// The bytes that get signed: the whole header plus the body.
    fn signed_bytes(nonce: u32, running_hash: &Digest20, from: NodeId, to: Destination, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 20 + 4 + 4 + 4 + body.len());
        buf.extend_from_slice(&nonce.to_be_bytes());
        buf.extend_from_slice(running_hash);
        buf.extend_from_slice(&from.0.to_be_bytes());
        buf.extend_from_slice(&to.to_wire().to_be_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    pub fn sign(
        crypto: &impl CryptoPort,
        sk: &SecretKey,
        nonce: u32,
        running_hash: Digest20,
        from: NodeId,
        to: Destination,
        body: Vec<u8>,
    ) -> Result<Self, LocalError> {
        let signed = Self::signed_bytes(nonce, &running_hash, from, to, &body);
        let sig = crypto
            .sign(sk, &signed)
            .map_err(|e| LocalError::new(format!("failed to sign outgoing packet: {e}")))?;
        Ok(Self { nonce, running_hash, from, to, body, sig })
    }

    /// Verifies the signature under `pk`; does not check nonce or running-hash
    /// continuity (that is [`crate::network::Network`]'s job, since it needs
    /// session/per-sender state this type doesn't carry).
    pub fn verify(&self, crypto: &impl CryptoPort, pk: &PublicKey) -> Result<(), NetworkError> {
        let signed = Self::signed_bytes(self.nonce, &self.running_hash, self.from, self.to, &self.body);
        crypto
            .verify(pk, &signed, &self.sig)
            .map_err(|_| NetworkError::BadSignature { from: self.from.0 })
    }

    /// Advances a sender's running-hash chain: `hash(prev ‖ dst ‖ body)`.
    pub fn next_running_hash(crypto: &impl CryptoPort, prev: &Digest20, to: Destination, body: &[u8]) -> Digest20 {
        crypto.hash(&[prev, &to.to_wire().to_be_bytes(), body])
    }
}
