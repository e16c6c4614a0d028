//! An accountable group anonymity core: a DC-net bulk round accompanied by a
//! cryptographic shuffle round that distributes per-round keys, plus a blame
//! subprotocol that turns a failed round into a signed, replayable accusation
//! instead of a silent stall.
//!
//! Every round-level component is generic over [`crypto::CryptoPort`], the way
//! `manul`'s rounds are generic over `SessionParameters` — this core fixes one
//! concrete instantiation, [`crypto::RsaCrypto`], but nothing downstream of
//! `CryptoPort` assumes it.

pub mod blame;
pub mod bulk;
pub mod config;
pub mod crypto;
pub mod dh;
pub mod error;
pub mod network;
pub mod protocol;
pub mod roster;
pub mod scheduler;
pub mod session;
pub mod shuffle;
pub mod wire;

pub use config::Config;
pub use crypto::{CryptoPort, RsaCrypto};
pub use error::{LocalError, RemoteError};
pub use protocol::RoundOutcome;
pub use roster::{NodeId, Roster};
pub use session::SessionController;
