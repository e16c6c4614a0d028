//! ShuffleRound: produce a permutation of N slot-cleartexts such that no
//! honest participant can link a cleartext back to its submitter, assuming at
//! least one server is honest.
//!
//! This models the round as a single synchronous computation over every
//! member's view at once, the way `manul::dev::run_sync` drives a protocol to
//! completion for tests: each phase in [`Phase`] is executed for every
//! participant before the next phase starts. A per-node, message-driven
//! incarnation of the same state machine lives behind [`crate::network::Network`]
//! in [`crate::session`]; this module is the part that's pure enough to unit-test
//! without a transport.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;

use tracing::warn;

use crate::crypto::{Ciphertext, CryptoPort, PublicKey, Randomness, SecretKey};
use crate::error::{LocalError, ProtocolViolation};
use crate::roster::NodeId;

/// One server's disposable keypair for a single round.
struct ServerKeys {
    inner_sk: SecretKey,
    inner_pk: PublicKey,
    outer_sk: SecretKey,
    outer_pk: PublicKey,
}

/// Parameters fixed for the duration of one shuffle round.
pub struct ShuffleParams {
    /// Servers, in topology order (first to shuffle first).
    pub topology_order: Vec<NodeId>,
    pub msg_length: usize,
    pub disposable_key_bits: usize,
}

/// A single member's contribution to DATA_SUBMISSION.
pub struct Submission {
    pub member: NodeId,
    /// Must be exactly `msg_length - 4` bytes or shorter: `msg_length` is fixed
    /// for the round, and submissions of other sizes are rejected.
    pub plaintext: Vec<u8>,
}

/// Test-only misbehavior injection, in place of `manul`'s combinator wrappers:
/// this core has a closed set of round kinds, so misbehavior is a plain struct
/// instead of a generic `MisbehavingRound` wrapper.
#[derive(Default, Clone, Copy)]
pub struct ShuffleFaults {
    /// This server corrupts one ciphertext's bytes after peeling its own layer.
    pub corrupt_shuffler: Option<NodeId>,
    /// This member submits a byte-identical ciphertext to another's (simulated
    /// by reusing the first submission's onion bytes verbatim).
    pub duplicate_submitter: Option<NodeId>,
}

/// The terminal output of a completed shuffle: decrypted plaintexts in their
/// final, permuted (and hence unlinkable) order.
pub type ShuffleOutcome = crate::protocol::RoundOutcome<Vec<Vec<u8>>>;

fn pad(mut plaintext: Vec<u8>, msg_length: usize) -> Result<Vec<u8>, LocalError> {
    if plaintext.len() + 4 > msg_length {
        return Err(LocalError::new("plaintext does not fit in msg_length"));
    }
    let len = plaintext.len() as u32;
    plaintext.resize(msg_length - 4, 0);
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(&plaintext);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, LocalError> {
    if padded.len() < 4 {
        return Err(LocalError::new("padded message too short"));
    }
    let len = u32::from_be_bytes(padded[0..4].try_into().unwrap()) as usize;
    padded
        .get(4..4 + len)
        .map(|s| s.to_vec())
        .ok_or_else(|| LocalError::new("padded message length prefix out of range"))
}

/// Onion-encrypts `plaintext` under `pks`, where the *last* key in `pks`
/// produces the outermost (final, most recently applied) wrapping, and
/// returns the ciphertext bytes alongside the per-layer randomness (inner
/// layer first), so a submitter can later recompute the exact same bytes for
/// VERIFICATION's inclusion check. The outer-layer randomness is retained
/// locally, generalized here to every layer, since both onions must be
/// reproducible for blame replay.
fn onion_encrypt(
    crypto: &impl CryptoPort,
    pks: &[&PublicKey],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<Randomness>), LocalError> {
    let mut bytes = plaintext.to_vec();
    let mut randomness = Vec::with_capacity(pks.len());
    for pk in pks {
        let (ct, r) = crypto
            .encrypt(pk, &bytes, None)
            .map_err(|e| LocalError::new(format!("onion layer encryption failed: {e}")))?;
        randomness.push(r);
        bytes = ct.to_bytes();
    }
    Ok((bytes, randomness))
}

/// Re-derives the same onion bytes deterministically from retained randomness,
/// for VERIFICATION's search of the broadcast set for a submitter's own
/// inner-encrypted message.
fn onion_encrypt_with_randomness(
    crypto: &impl CryptoPort,
    pks: &[&PublicKey],
    plaintext: &[u8],
    randomness: &[Randomness],
) -> Result<Vec<u8>, LocalError> {
    let mut bytes = plaintext.to_vec();
    for (pk, r) in pks.iter().zip(randomness) {
        let (ct, _) = crypto
            .encrypt(pk, &bytes, Some(r.clone()))
            .map_err(|e| LocalError::new(format!("onion layer re-encryption failed: {e}")))?;
        bytes = ct.to_bytes();
    }
    Ok(bytes)
}

fn onion_peel(crypto: &impl CryptoPort, sk: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>, ()> {
    let ct = Ciphertext::from_bytes(bytes).map_err(|_| ())?;
    crypto.decrypt(sk, &ct).map_err(|_| ())
}

/// Runs one complete shuffle round for every participating member at once.
///
/// `submissions` must include every roster member expected to contribute a
/// slot-cleartext: both clients and servers submit during a shuffle, since
/// the shuffled output seeds the following bulk round.
pub fn run_shuffle(
    crypto: &impl CryptoPort,
    params: &ShuffleParams,
    submissions: Vec<Submission>,
    faults: ShuffleFaults,
) -> Result<ShuffleOutcome, LocalError> {
    let n_servers = params.topology_order.len();
    if n_servers == 0 {
        return Err(LocalError::new("shuffle requires a non-empty server subgroup"));
    }

    // KEY_SHARING: every server generates a disposable inner/outer keypair.
    let mut server_keys: BTreeMap<NodeId, ServerKeys> = BTreeMap::new();
    for &id in &params.topology_order {
        let (inner_sk, inner_pk) = crypto
            .gen_keypair(params.disposable_key_bits)
            .map_err(|e| LocalError::new(format!("inner keypair generation failed: {e}")))?;
        let (outer_sk, outer_pk) = crypto
            .gen_keypair(params.disposable_key_bits)
            .map_err(|e| LocalError::new(format!("outer keypair generation failed: {e}")))?;
        server_keys.insert(id, ServerKeys { inner_sk, inner_pk, outer_sk, outer_pk });
    }

    // Key application order: last element is the outermost layer for both
    // onions. The reverse-topology ordering is applied uniformly to both the
    // inner and outer onion so that the server receiving DATA_SUBMISSION,
    // which must be able to peel immediately, always holds the outermost key.
    let key_order: Vec<NodeId> = params.topology_order.iter().rev().copied().collect();
    let inner_pks: Vec<&PublicKey> = key_order.iter().map(|id| &server_keys[id].inner_pk).collect();
    let outer_pks: Vec<&PublicKey> = key_order.iter().map(|id| &server_keys[id].outer_pk).collect();

    // DATA_SUBMISSION.
    let mut onion_bytes: Vec<Vec<u8>> = Vec::with_capacity(submissions.len());
    let mut origin_of: Vec<NodeId> = Vec::with_capacity(submissions.len());
    let mut inner_randomness_of: BTreeMap<NodeId, Vec<Randomness>> = BTreeMap::new();
    let mut inner_plaintext_of: BTreeMap<NodeId, Vec<u8>> = BTreeMap::new();

    for sub in &submissions {
        let padded = pad(sub.plaintext.clone(), params.msg_length)?;
        let (inner_bytes, inner_r) = onion_encrypt(crypto, &inner_pks, &padded)?;
        let (outer_bytes, _outer_r) = onion_encrypt(crypto, &outer_pks, &inner_bytes)?;
        inner_randomness_of.insert(sub.member, inner_r);
        inner_plaintext_of.insert(sub.member, padded);
        origin_of.push(sub.member);

        let final_bytes = if faults.duplicate_submitter == Some(sub.member) && !onion_bytes.is_empty() {
            onion_bytes[0].clone()
        } else {
            outer_bytes
        };
        onion_bytes.push(final_bytes);
    }

    // SHUFFLE: one server at a time, in topology order.
    let mut batch = onion_bytes;
    let mut bad_members: BTreeSet<NodeId> = BTreeSet::new();
    let mut no_go = false;

    for &server in &params.topology_order {
        let outer_sk = &server_keys[&server].outer_sk;
        let mut peeled = Vec::with_capacity(batch.len());
        for (idx, ct) in batch.iter().enumerate() {
            match onion_peel(crypto, outer_sk, ct) {
                Ok(p) => peeled.push(p),
                Err(_) => {
                    // A decryption failure charges the originator (or,
                    // once the batch has been permuted at least once, the
                    // previous hop, since the true originator is no longer
                    // recoverable locally).
                    let charged = origin_of.get(idx).copied().unwrap_or(server);
                    let violation = ProtocolViolation::BadCiphertextFrom(charged.0);
                    warn!(%violation, ?server, "onion layer failed to decrypt");
                    bad_members.insert(charged);
                    no_go = true;
                }
            }
        }

        // Duplicate-ciphertext check on this server's own input batch.
        let mut seen = BTreeSet::new();
        for (idx, ct) in batch.iter().enumerate() {
            if !seen.insert(ct.clone()) {
                let charged = origin_of.get(idx).copied().unwrap_or(server);
                let violation = ProtocolViolation::DuplicateCiphertext(charged.0);
                warn!(%violation, ?server, "duplicate ciphertext in this server's input batch");
                no_go = true;
            }
        }

        if faults.corrupt_shuffler == Some(server) {
            if let Some(first) = peeled.first_mut() {
                first.push(0xff);
            }
        }

        peeled.shuffle(&mut rand::thread_rng());
        batch = peeled;
    }

    if no_go || !bad_members.is_empty() {
        return Ok(crate::protocol::RoundOutcome::Failure { bad_members });
    }

    // VERIFICATION: every submitter searches the broadcast (fully outer-peeled)
    // batch for its own inner-encrypted message.
    let mut votes_go = true;
    for sub in &submissions {
        let randomness = &inner_randomness_of[&sub.member];
        let plaintext = &inner_plaintext_of[&sub.member];
        let mine = onion_encrypt_with_randomness(crypto, &inner_pks, plaintext, randomness)?;
        if !batch.iter().any(|ct| ct == &mine) {
            let violation = ProtocolViolation::ShuffleNoGo(sub.member.0);
            warn!(%violation, "submitter's inner ciphertext missing from the broadcast batch");
            votes_go = false;
            bad_members.insert(sub.member);
        }
    }
    if !votes_go {
        return Ok(crate::protocol::RoundOutcome::Failure { bad_members });
    }

    // PRIVATE_KEY_SHARING: every server reveals its inner private; verify it
    // matches the key announced at KEY_SHARING.
    for (&id, keys) in &server_keys {
        let revealed = SecretKey::from_der(&keys.inner_sk.to_der().map_err(|e| LocalError::new(e.to_string()))?)
            .map_err(|e| LocalError::new(e.to_string()))?;
        if revealed.public() != keys.inner_pk {
            let violation = ProtocolViolation::KeyMismatch(id.0);
            warn!(%violation, "revealed inner private key does not match the key announced at KEY_SHARING");
            bad_members.insert(id);
        }
    }
    if !bad_members.is_empty() {
        return Ok(crate::protocol::RoundOutcome::Failure { bad_members });
    }

    // DECRYPTION: peel inner layers in topology order (the order in which
    // privates were actually revealed; see DESIGN.md for why this core applies
    // the same peel order to both onions rather than reversing it for the
    // inner layer).
    let mut plaintexts = batch;
    for &server in &params.topology_order {
        let inner_sk = &server_keys[&server].inner_sk;
        let mut next = Vec::with_capacity(plaintexts.len());
        for ct in &plaintexts {
            match onion_peel(crypto, inner_sk, ct) {
                Ok(p) => next.push(p),
                Err(_) => return Ok(crate::protocol::unrecoverable_failure()),
            }
        }
        plaintexts = next;
    }

    let mut out = Vec::with_capacity(plaintexts.len());
    for padded in plaintexts {
        out.push(unpad(&padded)?);
    }
    Ok(crate::protocol::RoundOutcome::Success(out))
}
