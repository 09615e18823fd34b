//! Cryptographic primitives: SLIP-21 derivation, symmetric AEAD, mnemonics.
//!
//! All key material used by the engine is derived deterministically from a
//! 32-byte owner secret via SLIP-0021, so any device holding the secret
//! derives the same identity and keys.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::{Error, Result};
use crate::random::RandomSource;

type HmacSha512 = Hmac<Sha512>;

/// Length of the XChaCha20-Poly1305 nonce prepended to every ciphertext.
pub const NONCE_LENGTH: usize = 24;

/// SLIP-0021 master node derivation domain.
const SLIP21_MASTER_KEY: &[u8] = b"Symmetric key seed";

/// A SLIP-0021 node: 64 bytes, of which the second half is the symmetric key.
#[derive(Clone)]
pub struct Slip21Node([u8; 64]);

impl Slip21Node {
    /// Derive the master node from a seed.
    pub fn master(seed: &[u8]) -> Self {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(SLIP21_MASTER_KEY)
            .expect("HMAC accepts any key length");
        mac.update(seed);
        let mut node = [0u8; 64];
        node.copy_from_slice(&mac.finalize().into_bytes());
        Self(node)
    }

    /// Derive a child node for `label`.
    pub fn child(&self, label: &[u8]) -> Self {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(&self.0[0..32])
            .expect("HMAC accepts any key length");
        mac.update(&[0u8]);
        mac.update(label);
        let mut node = [0u8; 64];
        node.copy_from_slice(&mac.finalize().into_bytes());
        Self(node)
    }

    /// The symmetric key of this node (32 bytes).
    pub fn key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[32..64]);
        key
    }
}

/// Derive the SLIP-21 symmetric key for a label path from a seed.
pub fn slip21_derive(seed: &[u8], labels: &[&[u8]]) -> [u8; 32] {
    let mut node = Slip21Node::master(seed);
    for label in labels {
        node = node.child(label);
    }
    node.key()
}

/// XChaCha20-Poly1305 seal/open with the nonce prepended to the ciphertext.
#[derive(Clone)]
pub struct SymmetricCrypto;

impl SymmetricCrypto {
    /// Seal `plaintext` under `key` with a random 24-byte nonce.
    ///
    /// Output layout: `nonce || ciphertext || tag`.
    pub fn seal(key: &[u8; 32], plaintext: &[u8], random: &dyn RandomSource) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(key.into());
        let mut nonce = [0u8; NONCE_LENGTH];
        random.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Unknown("AEAD encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload produced by [`SymmetricCrypto::seal`].
    pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LENGTH {
            return Err(Error::SymmetricCryptoDecrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let cipher = XChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::SymmetricCryptoDecrypt)
    }
}

/// Generate a fresh 12-word BIP-39 English mnemonic.
pub fn generate_mnemonic(random: &dyn RandomSource) -> String {
    let mut entropy = [0u8; 16];
    random.fill_bytes(&mut entropy);
    bip39::Mnemonic::from_entropy(&entropy)
        .expect("16 bytes is valid BIP-39 entropy")
        .to_string()
}

/// Parse and validate a BIP-39 English mnemonic.
pub fn parse_mnemonic(mnemonic: &str) -> Result<bip39::Mnemonic> {
    bip39::Mnemonic::parse_normalized(mnemonic)
        .map_err(|e| Error::InvalidMnemonic(e.to_string()))
}

/// Derive the 64-byte BIP-39 seed for a mnemonic (empty passphrase).
pub fn mnemonic_to_seed(mnemonic: &str) -> Result<[u8; 64]> {
    Ok(parse_mnemonic(mnemonic)?.to_seed(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    const ABANDON_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon about";

    #[test]
    fn slip21_is_deterministic_and_label_separated() {
        let seed = [7u8; 32];

        let a = slip21_derive(&seed, &[b"Evolu", b"OwnerIdBytes"]);
        let b = slip21_derive(&seed, &[b"Evolu", b"OwnerIdBytes"]);
        let c = slip21_derive(&seed, &[b"Evolu", b"OwnerEncryptionKey"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn slip21_depends_on_seed() {
        let a = slip21_derive(&[1u8; 32], &[b"Evolu"]);
        let b = slip21_derive(&[2u8; 32], &[b"Evolu"]);
        assert_ne!(a, b);
    }

    #[test]
    fn slip21_path_prefix_differs_from_leaf() {
        let seed = [9u8; 32];
        let parent = slip21_derive(&seed, &[b"a"]);
        let child = slip21_derive(&seed, &[b"a", b"b"]);
        assert_ne!(parent, child);
    }

    #[test]
    fn seal_open_roundtrip() {
        let random = SeededRandom::new(1);
        let key = [42u8; 32];

        let sealed = SymmetricCrypto::seal(&key, b"hello", &random).unwrap();
        assert_ne!(&sealed[NONCE_LENGTH..], b"hello");

        let opened = SymmetricCrypto::open(&key, &sealed).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let random = SeededRandom::new(1);
        let key = [42u8; 32];

        let mut sealed = SymmetricCrypto::seal(&key, b"hello", &random).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert_eq!(
            SymmetricCrypto::open(&key, &sealed),
            Err(Error::SymmetricCryptoDecrypt)
        );
    }

    #[test]
    fn open_rejects_wrong_key() {
        let random = SeededRandom::new(1);
        let sealed = SymmetricCrypto::seal(&[1u8; 32], b"hello", &random).unwrap();
        assert_eq!(
            SymmetricCrypto::open(&[2u8; 32], &sealed),
            Err(Error::SymmetricCryptoDecrypt)
        );
    }

    #[test]
    fn open_rejects_truncated_payload() {
        assert_eq!(
            SymmetricCrypto::open(&[0u8; 32], &[1, 2, 3]),
            Err(Error::SymmetricCryptoDecrypt)
        );
    }

    #[test]
    fn mnemonic_roundtrip() {
        let random = SeededRandom::new(3);
        let words = generate_mnemonic(&random);
        assert_eq!(words.split_whitespace().count(), 12);
        assert!(parse_mnemonic(&words).is_ok());
    }

    #[test]
    fn invalid_mnemonic_is_rejected() {
        assert!(matches!(
            parse_mnemonic("not a mnemonic at all"),
            Err(Error::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn abandon_mnemonic_seed_vector() {
        // Reference seed for the all-"abandon" mnemonic with empty passphrase.
        let seed = mnemonic_to_seed(ABANDON_MNEMONIC).unwrap();
        assert_eq!(
            hex::encode(&seed[0..32]),
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1"
        );
    }
}
