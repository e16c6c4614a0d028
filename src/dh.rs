//! Diffie-Hellman key agreement over a fixed safe-prime group.
//!
//! Every participant carries a long-term DH keypair; pairwise shared secrets
//! seed the DC-net PRNGs and are the object proved about in the blame NIZK.

use num_bigint::BigUint;
use num_traits::{Num, One};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// RFC 3526 Group 5 (1536-bit MODP) prime, used as the fixed group for every DH
/// operation in this core. A production deployment would negotiate or configure
/// this; for our purposes a single well-known safe prime is sufficient and avoids
/// pulling in group-parameter generation.
const GROUP5_P_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E0",
    "88A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A43",
    "1B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C4",
    "2E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B",
    "1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69",
    "163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED52907",
    "7096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);
const GROUP_G: u64 = 2;

fn group_p() -> BigUint {
    BigUint::from_str_radix(GROUP5_P_HEX, 16).expect("hardcoded prime is valid hex")
}

fn group_g() -> BigUint {
    BigUint::from(GROUP_G)
}

/// A DH keypair: `public = g^secret mod p`.
#[derive(Clone, Serialize, Deserialize)]
pub struct DhKeypair {
    #[serde(with = "biguint_bytes")]
    secret: BigUint,
    #[serde(with = "biguint_bytes")]
    public: BigUint,
}

impl std::fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeypair").field("public", &self.public).finish()
    }
}

mod biguint_bytes {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        v.to_bytes_be().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

impl DhKeypair {
    pub fn generate() -> Self {
        let p = group_p();
        let mut rng = rand::rngs::OsRng;
        // Reject-resample a secret exponent strictly between 1 and p-1.
        let secret = loop {
            let mut bytes = vec![0u8; p.to_bytes_be().len()];
            rng.fill_bytes(&mut bytes);
            let candidate = BigUint::from_bytes_be(&bytes) % (&p - BigUint::one());
            if candidate > BigUint::one() {
                break candidate;
            }
        };
        let public = group_g().modpow(&secret, &p);
        Self { secret, public }
    }

    pub fn public(&self) -> DhPublicKey {
        DhPublicKey(self.public.clone())
    }

    pub fn secret(&self) -> &BigUint {
        &self.secret
    }

    /// The pairwise shared secret `their_public^secret mod p`, used to seed a
    /// DC-net PRNG for this (client, server) pair.
    pub fn shared_secret(&self, their_public: &DhPublicKey) -> BigUint {
        their_public.0.modpow(&self.secret, &group_p())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhPublicKey(#[serde(with = "biguint_bytes")] BigUint);

impl DhPublicKey {
    pub fn to_seed_bytes(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    pub fn from_value(v: BigUint) -> Self {
        Self(v)
    }
}

pub fn group_params() -> (BigUint, BigUint) {
    (group_p(), group_g())
}
