//! CryptoPort: a typed facade over the few primitives the protocol needs.
//!
//! The core never touches `rsa`/`aes`/`sha1` directly outside this module — every
//! other component is generic over [`CryptoPort`], the way `manul`'s rounds are
//! generic over `SessionParameters::Signer`/`Verifier`/`Digest`. [`RsaCrypto`] is the
//! concrete instantiation used by the session controller and by tests.

use aes::cipher::{KeyIvInit, StreamCipher};
use digest::Digest as _;
use rand::{rngs::OsRng, RngCore, SeedableRng};
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    signature::{RandomizedSigner, Verifier as _},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// A 20-byte digest, matching the original's SHA-1-sized hash.
pub type Digest20 = [u8; 20];

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;
type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// An asymmetric, signing-capable keypair.
///
/// `RsaPrivateKey` zeroizes its limbs on drop (the `rsa` crate builds on
/// `zeroize` internally), which is how this type satisfies the memory hygiene
/// requirement for inner/outer shuffle keys.
#[derive(Clone)]
pub struct SecretKey {
    inner: RsaPrivateKey,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn public(&self) -> PublicKey {
        PublicKey(RsaPublicKey::from(&self.inner))
    }

    /// DER encoding, used when a private disposable key must travel on the wire
    /// (shuffle's `PRIVATE_KEY_SHARING` phase, blame's key disclosure).
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        use rsa::pkcs8::EncodePrivateKey;
        Ok(self
            .inner
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Malformed(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self, CryptoError> {
        use rsa::pkcs8::DecodePrivateKey;
        RsaPrivateKey::from_pkcs8_der(bytes)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// The public half of a [`SecretKey`], serializable to bytes (DER) so that
/// deserializing and re-serializing round-trips byte-equal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_bytes")] RsaPublicKey);

mod pubkey_bytes {
    use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
    use rsa::RsaPublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &RsaPublicKey, s: S) -> Result<S::Ok, S::Error> {
        let der = key
            .to_public_key_der()
            .map_err(serde::ser::Error::custom)?;
        der.as_bytes().to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RsaPublicKey, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        RsaPublicKey::from_public_key_der(&bytes).map_err(serde::de::Error::custom)
    }
}

impl PublicKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        use rsa::pkcs8::EncodePublicKey;
        self.0.to_public_key_der().expect("valid key").as_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        use rsa::pkcs8::DecodePublicKey;
        RsaPublicKey::from_public_key_der(bytes)
            .map(Self)
            .map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// A detached signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn to_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Randomness used to make [`CryptoPort::encrypt`] deterministic for blame replay.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Randomness {
    session_key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

/// A hybrid (RSA-OAEP-wrapped AES-256-CTR) ciphertext.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ciphertext {
    wrapped_key: Vec<u8>,
    iv: [u8; AES_IV_LEN],
    body: Vec<u8>,
}

impl Ciphertext {
    /// A length-prefixed flat encoding, used by the shuffle round to treat a
    /// whole `Ciphertext` as the plaintext of the next onion layer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.wrapped_key.len() + AES_IV_LEN + 4 + self.body.len());
        buf.extend_from_slice(&(self.wrapped_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.wrapped_key);
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bad = || CryptoError::Malformed("truncated ciphertext encoding".into());
        if bytes.len() < 4 {
            return Err(bad());
        }
        let key_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut pos = 4;
        let wrapped_key = bytes.get(pos..pos + key_len).ok_or_else(bad)?.to_vec();
        pos += key_len;
        let iv: [u8; AES_IV_LEN] = bytes.get(pos..pos + AES_IV_LEN).ok_or_else(bad)?.try_into().unwrap();
        pos += AES_IV_LEN;
        let body_len = u32::from_be_bytes(bytes.get(pos..pos + 4).ok_or_else(bad)?.try_into().unwrap()) as usize;
        pos += 4;
        let body = bytes.get(pos..pos + body_len).ok_or_else(bad)?.to_vec();
        Ok(Self { wrapped_key, iv, body })
    }
}

/// An incremental hash accumulator: `update` without finalizing, `snapshot` to peek
/// the digest so far without destroying the accumulator.
#[derive(Clone, Default)]
pub struct IncrementalHash(Sha1);

impl IncrementalHash {
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn snapshot(&self) -> Digest20 {
        self.0.clone().finalize().into()
    }
}

/// The DC-net pad generator: a deterministic stream keyed by a seed, where two PRNGs
/// with equal seeds produce byte-equal streams regardless of how `generate` is
/// chunked; a pad stream is never reseeded mid-round.
pub struct Prng {
    inner: rand_chacha::ChaCha20Rng,
}

impl Prng {
    pub fn generate(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.inner.fill_bytes(&mut buf);
        buf
    }
}

impl std::fmt::Debug for Prng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Prng(..)")
    }
}

/// Typed facade over the primitives the protocol needs.
///
/// All operations are deterministic in their inputs; failures are reported as
/// [`CryptoError`], never as panics.
pub trait CryptoPort {
    fn gen_keypair(&self, bits: usize) -> Result<(SecretKey, PublicKey), CryptoError>;
    fn sign(&self, sk: &SecretKey, bytes: &[u8]) -> Result<Signature, CryptoError>;
    fn verify(&self, pk: &PublicKey, bytes: &[u8], sig: &Signature) -> Result<(), CryptoError>;

    /// If `randomness` is `Some`, encryption is fully deterministic. If `None`,
    /// randomness is sampled via [`Self::strong_rng`] and returned alongside the
    /// ciphertext so the caller can save it for blame replay.
    fn encrypt(
        &self,
        pk: &PublicKey,
        msg: &[u8],
        randomness: Option<Randomness>,
    ) -> Result<(Ciphertext, Randomness), CryptoError>;

    fn decrypt(&self, sk: &SecretKey, ct: &Ciphertext) -> Result<Vec<u8>, CryptoError>;

    /// Ordered concatenation hash.
    fn hash(&self, parts: &[&[u8]]) -> Digest20;

    fn incremental_hash(&self) -> IncrementalHash {
        IncrementalHash::default()
    }

    fn strong_rng(&self) -> Vec<u8>;

    /// `seed` is `K ‖ IV` bytes; successive `generate(len)` calls on the result are a
    /// function of `(seed, total bytes drawn so far)` only.
    fn prng_from_seed(&self, seed: &[u8]) -> Prng;
}

/// The concrete [`CryptoPort`]: RSA-OAEP/PKCS#1v1.5 + AES-256-CTR + SHA-1.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaCrypto;

impl CryptoPort for RsaCrypto {
    fn gen_keypair(&self, bits: usize) -> Result<(SecretKey, PublicKey), CryptoError> {
        let mut rng = OsRng;
        let sk = RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let pk = RsaPublicKey::from(&sk);
        Ok((SecretKey { inner: sk }, PublicKey(pk)))
    }

    fn sign(&self, sk: &SecretKey, bytes: &[u8]) -> Result<Signature, CryptoError> {
        let mut rng = OsRng;
        let signing_key = SigningKey::<Sha1>::new(sk.inner.clone());
        let sig = signing_key.sign_with_rng(&mut rng, bytes);
        Ok(Signature(sig.to_vec()))
    }

    fn verify(&self, pk: &PublicKey, bytes: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::<Sha1>::new(pk.0.clone());
        let signature = rsa::pkcs1v15::Signature::try_from(sig.0.as_slice())
            .map_err(|_| CryptoError::BadSignature)?;
        verifying_key
            .verify(bytes, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    fn encrypt(
        &self,
        pk: &PublicKey,
        msg: &[u8],
        randomness: Option<Randomness>,
    ) -> Result<(Ciphertext, Randomness), CryptoError> {
        let randomness = match randomness {
            Some(r) => r,
            None => {
                let mut session_key = [0u8; AES_KEY_LEN];
                let mut iv = [0u8; AES_IV_LEN];
                let mut rng = OsRng;
                rng.fill_bytes(&mut session_key);
                rng.fill_bytes(&mut iv);
                Randomness { session_key, iv }
            }
        };

        let mut body = msg.to_vec();
        let mut cipher = Aes256Ctr::new(&randomness.session_key.into(), &randomness.iv.into());
        cipher.apply_keystream(&mut body);

        // Deterministic key-wrapping: OAEP itself is randomized, so we feed it a
        // ChaCha20 stream seeded from the session key, making the whole encryption
        // a pure function of (pk, msg, randomness).
        let mut wrap_rng = seeded_rng(&randomness.session_key, &randomness.iv);
        let wrapped_key = pk
            .0
            .encrypt(&mut wrap_rng, Oaep::new::<sha2::Sha256>(), &randomness.session_key)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;

        Ok((
            Ciphertext {
                wrapped_key,
                iv: randomness.iv,
                body,
            },
            randomness,
        ))
    }

    fn decrypt(&self, sk: &SecretKey, ct: &Ciphertext) -> Result<Vec<u8>, CryptoError> {
        let session_key = sk
            .inner
            .decrypt(Oaep::new::<sha2::Sha256>(), &ct.wrapped_key)
            .map_err(|e| CryptoError::BadCiphertext(e.to_string()))?;
        if session_key.len() != AES_KEY_LEN {
            return Err(CryptoError::BadCiphertext("wrapped key has the wrong length".into()));
        }
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&session_key);

        let mut body = ct.body.clone();
        let mut cipher = Aes256Ctr::new(&key.into(), &ct.iv.into());
        cipher.apply_keystream(&mut body);
        Ok(body)
    }

    fn hash(&self, parts: &[&[u8]]) -> Digest20 {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn strong_rng(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 32];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    fn prng_from_seed(&self, seed: &[u8]) -> Prng {
        Prng {
            inner: rand_chacha::ChaCha20Rng::from_seed(derive_chacha_seed(seed)),
        }
    }
}

fn derive_chacha_seed(seed: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(seed).into()
}

fn seeded_rng(key: &[u8], iv: &[u8]) -> rand_chacha::ChaCha20Rng {
    let mut hasher = sha2::Sha256::new();
    hasher.update(b"oaep-wrap");
    hasher.update(key);
    hasher.update(iv);
    rand_chacha::ChaCha20Rng::from_seed(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let crypto = RsaCrypto;
        let (sk, pk) = crypto.gen_keypair(1024).unwrap();
        let sig = crypto.sign(&sk, b"hello").unwrap();
        crypto.verify(&pk, b"hello", &sig).unwrap();
        assert!(crypto.verify(&pk, b"goodbye", &sig).is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let crypto = RsaCrypto;
        let (sk, pk) = crypto.gen_keypair(1024).unwrap();
        let (ct, _) = crypto.encrypt(&pk, b"secret message", None).unwrap();
        let pt = crypto.decrypt(&sk, &ct).unwrap();
        assert_eq!(pt, b"secret message");
    }

    #[test]
    fn encrypt_is_deterministic_given_randomness() {
        let crypto = RsaCrypto;
        let (_sk, pk) = crypto.gen_keypair(1024).unwrap();
        let (ct1, r) = crypto.encrypt(&pk, b"onion layer", None).unwrap();
        let (ct2, _) = crypto.encrypt(&pk, b"onion layer", Some(r)).unwrap();
        assert_eq!(ct1.body, ct2.body);
        assert_eq!(ct1.wrapped_key, ct2.wrapped_key);
    }

    #[test]
    fn prng_is_deterministic_and_order_independent_of_chunking() {
        let crypto = RsaCrypto;
        let seed = b"some shared dh-derived seed material";
        let mut a = crypto.prng_from_seed(seed);
        let mut b = crypto.prng_from_seed(seed);

        let whole = a.generate(64);
        let mut parts = b.generate(20);
        parts.extend(b.generate(44));
        assert_eq!(whole, parts);
    }

    #[test]
    fn public_key_serialization_round_trips() {
        let crypto = RsaCrypto;
        let (_sk, pk) = crypto.gen_keypair(1024).unwrap();
        let bytes = pk.to_bytes();
        let pk2 = PublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(pk, pk2);
    }
}
