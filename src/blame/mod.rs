//! BlameEngine: two modes — shuffle blame by log replay, and bulk accusation
//! by pinpointing a single (user, server) conflict via alibis and a
//! Chaum-Pedersen proof of the pairwise DH shared secret.

use std::collections::BTreeSet;

use num_bigint::BigUint;
use num_traits::One;

use crate::crypto::{CryptoPort, Digest20, PublicKey, Signature};
use crate::dh::{DhPublicKey, group_params};
use crate::network::Log;
use crate::roster::NodeId;

/// One node's published disclosure at the start of BLAME.
pub struct Disclosure {
    pub node: NodeId,
    pub outer_private_der: Option<Vec<u8>>,
    pub log: Log,
    pub signature: Signature,
}

fn disclosure_digest(crypto: &impl CryptoPort, outer_private_der: Option<&[u8]>, log: &Log) -> Digest20 {
    let mut log_bytes = Vec::new();
    for (sender, body) in log.entries() {
        log_bytes.extend_from_slice(&sender.0.to_be_bytes());
        log_bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        log_bytes.extend_from_slice(body);
    }
    crypto.hash(&[outer_private_der.unwrap_or(&[]), log_bytes.as_slice()])
}

/// What a replay check needs to know about one server's announced key
/// material, to compare against what it discloses at BLAME time.
pub struct AnnouncedKeys {
    pub node: NodeId,
    pub outer_pub: PublicKey,
}

/// Runs shuffle blame: verifies every disclosure's signature and hash, flags
/// equivocation, then checks each disclosure's revealed outer private against
/// its announced public key. Returns the first bad member found, checking
/// disclosure consistency before the keys it discloses.
pub fn run_shuffle_blame(
    crypto: &impl CryptoPort,
    identity_pks: &std::collections::BTreeMap<NodeId, PublicKey>,
    disclosures: &[Disclosure],
    announced: &[AnnouncedKeys],
) -> Option<NodeId> {
    // Every node re-hashes every disclosure; equivocation is a disclosure whose
    // self-reported signature does not match the hash of the log it shipped.
    for d in disclosures {
        let digest = disclosure_digest(crypto, d.outer_private_der.as_deref(), &d.log);
        let Some(pk) = identity_pks.get(&d.node) else {
            return Some(d.node);
        };
        if crypto.verify(pk, &digest, &d.signature).is_err() {
            return Some(d.node);
        }
    }

    // Missing log entries: an honest disclosure's log must be non-empty once
    // KEY_SHARING has happened.
    for d in disclosures {
        if d.log.count() == 0 {
            return Some(d.node);
        }
    }

    // Outer private must correspond to the key announced at KEY_SHARING.
    for d in disclosures {
        let Some(der) = &d.outer_private_der else { continue };
        let Some(entry) = announced.iter().find(|a| a.node == d.node) else { continue };
        match crate::crypto::SecretKey::from_der(der) {
            Ok(sk) if sk.public() == entry.outer_pub => {}
            _ => return Some(d.node),
        }
    }

    None
}

/// A localized, proof-carrying bulk accusation: a claim that a specific
/// bit position in a specific phase was tampered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accusation {
    pub phase: u32,
    pub byte: usize,
    pub bit: u8,
}

/// Finds the first position where a bit the owner sent as 0 arrived as 1
/// Searches its own sent bytes against the received bytes for a position
/// where a 0 bit was flipped to 1.
pub fn find_accusation(sent: &[u8], received: &[u8], phase: u32) -> Option<Accusation> {
    for (byte_idx, (&s, &r)) in sent.iter().zip(received).enumerate() {
        let flipped = s ^ r;
        if flipped == 0 {
            continue;
        }
        for bit in 0..8u8 {
            let mask = 1u8 << bit;
            if flipped & mask != 0 && s & mask == 0 {
                return Some(Accusation { phase, byte: byte_idx, bit });
            }
        }
    }
    None
}

/// One party's claimed pad contribution at the accused bit position, one
/// claim per pairwise counterparty it shares a DH-seeded PRNG with. A client
/// claims a bit for every server it exchanged pads with that phase, and vice
/// versa, so an honest (client, server) pair's two claims about each other
/// always agree.
pub struct Alibi {
    pub party: NodeId,
    pub claims: std::collections::BTreeMap<NodeId, bool>,
}

/// Finds the unique (client, server) pair whose claims about each other
/// disagree: since both sides of a pairwise-seeded PRNG must derive the same
/// pad bit, any disagreement directly names the lying pair, with no need to
/// first narrow the implicated set down to two parties by other means. Scans
/// every pair once; with more than one genuine liar this returns the first
/// disagreement found, but a round only ever pinpoints one accusation at a
/// time so that is not a case this needs to resolve.
pub fn pinpoint_conflict(alibis: &[Alibi]) -> Option<(NodeId, NodeId)> {
    for (i, a) in alibis.iter().enumerate() {
        for b in &alibis[i + 1..] {
            if let (Some(&claim_a), Some(&claim_b)) = (a.claims.get(&b.party), b.claims.get(&a.party)) {
                if claim_a != claim_b {
                    return Some((a.party, b.party));
                }
            }
        }
    }
    None
}

/// A non-interactive Chaum-Pedersen proof that `claimed_shared = g^(a*b)` for
/// the prover's secret `a` and the verifier-supplied `g^b`.
#[derive(Debug, Clone)]
pub struct DhProof {
    pub t1: BigUint,
    pub t2: BigUint,
    pub response: BigUint,
}

fn challenge(crypto: &impl CryptoPort, g: &BigUint, g_a: &BigUint, g_b: &BigUint, g_ab: &BigUint, t1: &BigUint, t2: &BigUint) -> BigUint {
    let parts: Vec<Vec<u8>> = vec![
        g.to_bytes_be(),
        g_a.to_bytes_be(),
        g_b.to_bytes_be(),
        g_ab.to_bytes_be(),
        t1.to_bytes_be(),
        t2.to_bytes_be(),
    ];
    let slices: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    let digest = crypto.hash(&slices);
    BigUint::from_bytes_be(&digest)
}

/// Proves knowledge of `a` such that `g_a = g^a` and `claimed_shared = g_b^a`,
/// without an interactive challenge.
pub fn prove_shared_secret(crypto: &impl CryptoPort, a: &BigUint, g_b: &DhPublicKey, claimed_shared: &DhPublicKey) -> DhProof {
    let (p, g) = group_params();
    let g_a = g.modpow(a, &p);
    let mut rng = rand::rngs::OsRng;
    let v = {
        use rand::RngCore;
        let mut bytes = vec![0u8; p.to_bytes_be().len()];
        rng.fill_bytes(&mut bytes);
        BigUint::from_bytes_be(&bytes) % (&p - BigUint::one())
    };
    let t1 = g.modpow(&v, &p);
    let t2 = g_b.value().modpow(&v, &p);
    let c = challenge(crypto, &g, &g_a, g_b.value(), claimed_shared.value(), &t1, &t2) % (&p - BigUint::one());

    let p_minus_1 = &p - BigUint::one();
    let ca = (&c * a) % &p_minus_1;
    // `v` and `ca` are both already reduced mod (p-1); adding (p-1) before
    // subtracting keeps the intermediate value non-negative for `BigUint`.
    let response = (&v + &p_minus_1 - &ca) % &p_minus_1;
    DhProof { t1, t2, response }
}

/// Verifies a [`DhProof`]: `t1 ≡ g^r·(g^a)^c` and `t2 ≡ (g^b)^r·(g^ab)^c`.
pub fn verify_shared_secret(
    crypto: &impl CryptoPort,
    g_a: &DhPublicKey,
    g_b: &DhPublicKey,
    claimed_shared: &DhPublicKey,
    proof: &DhProof,
) -> bool {
    let (p, g) = group_params();
    let c = challenge(crypto, &g, g_a.value(), g_b.value(), claimed_shared.value(), &proof.t1, &proof.t2)
        % (&p - BigUint::one());

    let lhs1 = g.modpow(&proof.response, &p) * g_a.value().modpow(&c, &p) % &p;
    let ok1 = lhs1 == proof.t1;

    let lhs2 = g_b.value().modpow(&proof.response, &p) * claimed_shared.value().modpow(&c, &p) % &p;
    let ok2 = lhs2 == proof.t2;

    ok1 && ok2
}

/// Every honest node must derive the same
/// PRNG byte offset for the accused bit, since it depends on every phase's
/// `slot_length` up to the accusation.
pub fn accused_byte_offset(slot_lengths_by_phase: &[usize], accusation: &Accusation) -> usize {
    let prior: usize = slot_lengths_by_phase.iter().take(accusation.phase as usize).sum();
    prior + accusation.byte
}

/// Recomputes the pad bit a node would have contributed at `offset` from a
/// pairwise seed, so any party can build its own [`Alibi`] claims without
/// needing to have been the one who ran the bulk phase.
pub fn claimed_bit(crypto: &impl CryptoPort, seed: &[u8], offset: usize, bit: u8) -> bool {
    let stream = crypto.prng_from_seed(seed).generate(offset + 1);
    stream[offset] & (1 << bit) != 0
}

/// Re-derives the whole set of odd-member ids named by a bulk round's bad
/// outcome; kept trivial here since [`crate::bulk`] already returns a
/// `bad_members` set for server-side failures. This exists so the session
/// controller has one call path for both blame modes.
pub fn bad_members_from_bulk_failure(bad_members: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    bad_members.clone()
}
