//! Error taxonomy shared by every component.
//!
//! Two tiers: unstructured leaf errors ([`LocalError`], [`RemoteError`]), mirroring
//! `manul`'s `protocol::errors` module byte-for-byte in spirit, and structured,
//! classified errors for the cases a caller needs to `match` on.

/// An error local to this node: a bug or a state it should never have reached.
#[derive(Debug, Clone, displaydoc::Display)]
#[displaydoc("{0}")]
pub struct LocalError(pub(crate) String);

impl LocalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::error::Error for LocalError {}

/// An error attributable to a remote party, but not (yet) backed by signed evidence.
#[derive(Debug, Clone, displaydoc::Display)]
#[displaydoc("{0}")]
pub struct RemoteError(pub(crate) String);

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::error::Error for RemoteError {}

/// Failures from [`crate::crypto::CryptoPort`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("signature did not verify")]
    BadSignature,
    #[error("ciphertext did not decrypt: {0}")]
    BadCiphertext(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("serialized key or ciphertext was malformed: {0}")]
    Malformed(String),
}

/// Failures from the [`crate::network::Network`] layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("packet signature from {from:?} did not verify")]
    BadSignature { from: u32 },
    #[error("packet session nonce did not match the installed session")]
    NonceMismatch,
    #[error("running hash chain from {from:?} is inconsistent")]
    RunningHashBroken { from: u32 },
    #[error("destination {dst:?} is not in the roster")]
    UnknownDestination { dst: u32 },
    #[error("transport failed to deliver: {0}")]
    Transport(String),
}

/// Misconfiguration detected by [`crate::config::Config::validate`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("num_nodes ({declared}) does not match nodes.len() ({actual})")]
    NodeCountMismatch { declared: u32, actual: usize },
    #[error("topology is empty: the server subgroup must be non-empty")]
    EmptySubgroup,
    #[error("topology is not a single, consistently linked chain")]
    MalformedTopology,
    #[error("my_position does not resolve to a topology entry or Client")]
    UnresolvedPosition,
    #[error("protocol version {0:?} is not implemented by this core")]
    UnsupportedProtocolVersion(crate::config::ProtocolVersion),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("application callback failed: {0}")]
pub struct ApplicationError(pub String);

/// A detected deviation from a round's state machine.
///
/// Every variant here is, by construction, something a round can attribute to a
/// specific member; the blame engine turns these into the global bad-member set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("node {node:?} sent a message of the wrong size (expected {expected}, got {got})")]
    WrongMessageSize { node: u32, expected: usize, got: usize },
    #[error("node {0:?} did not respond before the phase deadline")]
    Timeout(u32),
    #[error("node {0:?} submitted a duplicate ciphertext during shuffle")]
    DuplicateCiphertext(u32),
    #[error("node {0:?}'s announced key does not match its revealed private component")]
    KeyMismatch(u32),
    #[error("node {0:?}'s ciphertext failed to decrypt under the expected key")]
    BadCiphertextFrom(u32),
    #[error("node {0:?} voted NO_GO or disagreed with the majority state hash")]
    ShuffleNoGo(u32),
    #[error("server {0:?}'s broadcast ciphertext does not match its earlier commitment")]
    CommitMismatch(u32),
    #[error("server {0:?}'s signature over the DC-net cleartext is invalid")]
    BadCleartextSignature(u32),
    #[error("client {0:?} submitted ciphertext to more than one server in the same phase")]
    DoubleSubmission(u32),
    #[error("node {0:?} equivocated: two different disclosures signed for the same round")]
    Equivocation(u32),
}

/// Failures of the offload/timer abstraction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("the token does not correspond to a pending timer")]
    UnknownToken,
    #[error("offloaded task was cancelled before it completed")]
    Cancelled,
}
