//! BulkRound (DC-net): turns anonymous slot ownership (from a prior shuffle)
//! into an anonymous variable-length broadcast channel.
//!
//! As with [`crate::shuffle`], this models one phase (one "message cycle") as a
//! single synchronous computation over every participant's view, the pure core
//! of the state machine that [`crate::session`] drives over the wire.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::crypto::{CryptoPort, PublicKey, Prng, SecretKey};
use crate::error::{LocalError, ProtocolViolation};
use crate::roster::NodeId;

const SEED_LEN: usize = 16;
const HEADER_LEN: usize = 4 /* next_length */ + 2 /* sig_len */;

/// Static per-slot configuration carried across phases.
#[derive(Clone)]
pub struct Slot {
    pub owner: Option<NodeId>,
    pub anon_pk: Option<PublicKey>,
}

pub struct BulkParams {
    /// Topology order; also the server-commit/ciphertext ordering. Servers are
    /// ordered by index, but XORing is associative, so the order only matters
    /// for logging and blame.
    pub servers: Vec<NodeId>,
    pub clients: Vec<NodeId>,
    pub slots: Vec<Slot>,
}

/// What a slot owner wants to transmit this phase, if anything (keyed by slot
/// index in the `messages` map passed to [`run_bulk_phase`]).
pub struct OwnerMessage {
    pub body: Vec<u8>,
    pub accuse: bool,
}

/// Test-only misbehavior injection (see [`crate::shuffle::ShuffleFaults`] for
/// the same pattern in the shuffle round).
#[derive(Default)]
pub struct BulkFaults {
    /// This server broadcasts a ciphertext that does not match its own commit.
    pub lying_server: Option<NodeId>,
    /// This client submits a ciphertext to two servers.
    pub double_submit_client: Option<NodeId>,
}

pub struct PhaseResult {
    pub cleartexts: BTreeMap<usize, Vec<u8>>,
    pub next_length: BTreeMap<usize, u32>,
    /// Slots whose signature failed to verify this phase but whose owner is
    /// online: only the owner may initiate an accusation for such a slot.
    pub needs_accusation: BTreeSet<usize>,
}

pub type BulkOutcome = crate::protocol::RoundOutcome<PhaseResult>;

fn signed_bytes(phase: u32, next_length: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(&phase.to_be_bytes());
    buf.extend_from_slice(&next_length.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Builds one slot's randomized, signed cleartext: a 16-byte seed prefix, then
/// `[next_length][sig_len][sig][body]` zero-padded to `slot_length`, with a
/// dedicated trailing accuse byte appended after the padding, the whole thing
/// derandomized with a keystream seeded by the prefix. The accuse bit lives in
/// the last byte of the randomized payload, not the header, so that it is
/// always found at a fixed offset from the end of the slot regardless of how
/// much of the body got padded away.
pub fn build_slot_plaintext(
    crypto: &impl CryptoPort,
    anon_sk: &SecretKey,
    phase: u32,
    next_length: u32,
    accuse: bool,
    body: &[u8],
    slot_length: usize,
) -> Result<Vec<u8>, LocalError> {
    let sig = crypto
        .sign(anon_sk, &signed_bytes(phase, next_length, body))
        .map_err(|e| LocalError::new(format!("anonymous slot signing failed: {e}")))?;
    let sig_bytes = sig.to_bytes().to_vec();

    let mut payload = Vec::with_capacity(HEADER_LEN + sig_bytes.len() + body.len());
    payload.extend_from_slice(&next_length.to_be_bytes());
    payload.extend_from_slice(&(sig_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&sig_bytes);
    payload.extend_from_slice(body);

    if SEED_LEN + payload.len() + 1 > slot_length {
        return Err(LocalError::new("slot message does not fit in slot_length"));
    }
    payload.resize(slot_length - SEED_LEN - 1, 0);
    payload.push(accuse as u8);

    let seed = crypto.strong_rng();
    let seed = &seed[..SEED_LEN];
    let mut ks = crypto.prng_from_seed(seed);
    let mask = ks.generate(payload.len());
    xor_in_place(&mut payload, &mask);

    let mut out = seed.to_vec();
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reverses [`build_slot_plaintext`] and verifies the embedded signature.
pub(crate) fn parse_slot_cleartext(
    crypto: &impl CryptoPort,
    anon_pk: &PublicKey,
    phase: u32,
    cleartext: &[u8],
) -> Option<(u32, bool, Vec<u8>)> {
    if cleartext.len() < SEED_LEN {
        return None;
    }
    let (seed, rest) = cleartext.split_at(SEED_LEN);
    let mut ks = crypto.prng_from_seed(seed);
    let mut payload = rest.to_vec();
    let mask = ks.generate(payload.len());
    xor_in_place(&mut payload, &mask);

    if payload.is_empty() {
        return None;
    }
    let (header_and_body, accuse_byte) = payload.split_at(payload.len() - 1);
    let accuse = accuse_byte[0] != 0;

    if header_and_body.len() < HEADER_LEN {
        return None;
    }
    let next_length = u32::from_be_bytes(header_and_body[0..4].try_into().unwrap());
    let sig_len = u16::from_be_bytes(header_and_body[4..6].try_into().unwrap()) as usize;
    let sig_bytes = header_and_body.get(6..6 + sig_len)?;
    let body = header_and_body.get(6 + sig_len..)?.to_vec();

    let sig = crate::crypto::Signature::from_bytes(sig_bytes);
    let signed = signed_bytes(phase, next_length, &body);
    crypto.verify(anon_pk, &signed, &sig).ok()?;
    Some((next_length, accuse, body))
}

/// Round-robin assignment of a client to a server this phase:
/// `topology_order[(c.id() + p) % num_servers]`.
pub fn assigned_server(servers: &[NodeId], client: NodeId, phase: u32) -> NodeId {
    let n = servers.len() as u32;
    servers[((client.0 + phase) % n) as usize]
}

/// Builds each server's SERVER_CLIENT_LIST for this phase: the set of clients
/// it received a ciphertext submission from. Under `assigned_server` routing a
/// client submits to exactly one server; `faults.double_submit_client` models
/// a client that submits to a second server as well, producing the overlap a
/// real double submission would leave behind.
pub fn server_client_lists(
    clients: &[NodeId],
    servers: &[NodeId],
    phase: u32,
    faults: &BulkFaults,
) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
    let mut lists: BTreeMap<NodeId, BTreeSet<NodeId>> = servers.iter().map(|&s| (s, BTreeSet::new())).collect();
    for &client in clients {
        let primary = assigned_server(servers, client, phase);
        lists.entry(primary).or_default().insert(client);
        if faults.double_submit_client == Some(client) {
            if let Some(&other) = servers.iter().find(|&&s| s != primary) {
                lists.entry(other).or_default().insert(client);
            }
        }
    }
    lists
}

/// Cross-references every server's SERVER_CLIENT_LIST and returns the clients
/// that appear on more than one: an honest client submits to exactly one
/// server per phase, so any client appearing in two lists has double
/// submitted.
pub fn detect_double_submission(lists: &BTreeMap<NodeId, BTreeSet<NodeId>>) -> BTreeSet<NodeId> {
    let mut seen: BTreeMap<NodeId, u32> = BTreeMap::new();
    for clients in lists.values() {
        for &client in clients {
            *seen.entry(client).or_insert(0) += 1;
        }
    }
    seen.into_iter().filter(|&(_, count)| count > 1).map(|(client, _)| client).collect()
}

/// The "always open" slot this phase, rotating forward and skipping slots with
/// no owner or an evicted owner.
pub fn always_open_slot(slots: &[Slot], evicted: &BTreeSet<NodeId>, phase: u32) -> Option<usize> {
    let n = slots.len();
    if n == 0 {
        return None;
    }
    for step in 0..n {
        let idx = (phase as usize + step) % n;
        let eligible = match slots[idx].owner {
            Some(owner) => !evicted.contains(&owner),
            None => false,
        };
        if eligible {
            return Some(idx);
        }
    }
    None
}

/// Runs one DC-net phase to completion.
///
/// `prngs` holds one live, monotonically-advancing [`Prng`] per (client,
/// server) pair; RNGs are never reseeded within a round, only advanced, and
/// the caller owns this map across phases. Because a
/// client and its paired server would, in a real deployment, independently
/// derive byte-identical streams from the same DH seed, this single-process
/// simulation shares one `Prng` per pair rather than keeping two redundant
/// copies that are contractually required to agree.
#[allow(clippy::too_many_arguments)]
pub fn run_bulk_phase(
    crypto: &impl CryptoPort,
    params: &BulkParams,
    prngs: &mut BTreeMap<(NodeId, NodeId), Prng>,
    pairwise_seeds: &BTreeMap<(NodeId, NodeId), Vec<u8>>,
    slot_length: &BTreeMap<usize, usize>,
    open_slots: &BTreeSet<usize>,
    anon_sks: &BTreeMap<usize, SecretKey>,
    messages: &BTreeMap<usize, OwnerMessage>,
    phase: u32,
    next_length_hint: u32,
    faults: &BulkFaults,
) -> Result<BulkOutcome, LocalError> {
    let mut bad_members: BTreeSet<NodeId> = BTreeSet::new();

    // Build every server's SERVER_CLIENT_LIST for this phase and cross-check
    // them for overlap before trusting any ciphertext.
    let client_lists = server_client_lists(&params.clients, &params.servers, phase, faults);
    for client in detect_double_submission(&client_lists) {
        let violation = ProtocolViolation::DoubleSubmission(client.0);
        warn!(%violation, "client appears on more than one server's client list this phase");
        bad_members.insert(client);
    }
    if !bad_members.is_empty() {
        return Ok(crate::protocol::RoundOutcome::Failure { bad_members });
    }

    let pad_bytes = |prngs: &mut BTreeMap<(NodeId, NodeId), Prng>, client: NodeId, server: NodeId, len: usize| -> Vec<u8> {
        prngs
            .entry((client, server))
            .or_insert_with(|| crypto.prng_from_seed(&pairwise_seeds[&(client, server)]))
            .generate(len)
    };

    // CLIENT_CIPHERTEXT: each client's contribution, slot by slot.
    let mut client_ciphertext: BTreeMap<NodeId, BTreeMap<usize, Vec<u8>>> = BTreeMap::new();
    for &client in &params.clients {
        let mut per_slot = BTreeMap::new();
        for &slot_idx in open_slots {
            let len = slot_length[&slot_idx];
            let mut agg = vec![0u8; len];
            for &server in &params.servers {
                let pad = pad_bytes(prngs, client, server, len);
                xor_in_place(&mut agg, &pad);
            }
            if params.slots[slot_idx].owner == Some(client) {
                if let Some(msg) = messages.get(&slot_idx) {
                    let anon_sk = &anon_sks[&slot_idx];
                    let plaintext =
                        build_slot_plaintext(crypto, anon_sk, phase, next_length_hint, msg.accuse, &msg.body, len)?;
                    xor_in_place(&mut agg, &plaintext);
                }
            }
            per_slot.insert(slot_idx, agg);
        }
        client_ciphertext.insert(client, per_slot);
    }

    // SERVER_COMMIT / SERVER_CIPHERTEXT: every server redundantly recomputes
    // the full union-list aggregate from its own pairwise pads; mismatches
    // against a server's own commitment mean that server lied.
    let mut server_ciphertext: BTreeMap<NodeId, BTreeMap<usize, Vec<u8>>> = BTreeMap::new();
    for &server in &params.servers {
        let mut per_slot = BTreeMap::new();
        for &slot_idx in open_slots {
            let len = slot_length[&slot_idx];
            let mut agg = vec![0u8; len];
            for &client in &params.clients {
                let pad = pad_bytes(prngs, client, server, len);
                xor_in_place(&mut agg, &pad);
            }
            per_slot.insert(slot_idx, agg);
        }
        let flat: Vec<u8> = per_slot.values().flat_map(|v| v.iter().copied()).collect();
        let commit = crypto.hash(&[flat.as_slice()]);
        let broadcast = if faults.lying_server == Some(server) {
            per_slot.values_mut().for_each(|v| {
                if let Some(b) = v.first_mut() {
                    *b ^= 0xff;
                }
            });
            per_slot.clone()
        } else {
            per_slot.clone()
        };
        let broadcast_flat: Vec<u8> = broadcast.values().flat_map(|v| v.iter().copied()).collect();
        let broadcast_commit = crypto.hash(&[broadcast_flat.as_slice()]);
        if broadcast_commit != commit {
            let violation = ProtocolViolation::CommitMismatch(server.0);
            warn!(%violation, "server's broadcast ciphertext does not match its own commit");
            bad_members.insert(server);
        }
        server_ciphertext.insert(server, broadcast);
    }
    if !bad_members.is_empty() {
        return Ok(crate::protocol::RoundOutcome::Failure { bad_members });
    }

    // SERVER_VALIDATION: combine everything; every honest server computes the
    // same cleartext, so we only need to do it once here.
    let mut cleartext: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for &slot_idx in open_slots {
        let len = slot_length[&slot_idx];
        let mut agg = vec![0u8; len];
        for per_slot in client_ciphertext.values() {
            xor_in_place(&mut agg, &per_slot[&slot_idx]);
        }
        for per_slot in server_ciphertext.values() {
            xor_in_place(&mut agg, &per_slot[&slot_idx]);
        }
        cleartext.insert(slot_idx, agg);
    }

    let mut next_length = BTreeMap::new();
    let mut needs_accusation = BTreeSet::new();
    for (&slot_idx, bytes) in &cleartext {
        let Some(anon_pk) = &params.slots[slot_idx].anon_pk else {
            continue;
        };
        match parse_slot_cleartext(crypto, anon_pk, phase, bytes) {
            Some((nl, _accuse, _body)) => {
                next_length.insert(slot_idx, nl);
            }
            None => {
                if params.slots[slot_idx].owner.is_some() {
                    needs_accusation.insert(slot_idx);
                }
            }
        }
    }

    Ok(crate::protocol::RoundOutcome::Success(PhaseResult { cleartexts: cleartext, next_length, needs_accusation }))
}
