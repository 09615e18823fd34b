//! Cryptographic owner identities.
//!
//! An owner is whoever holds a 32-byte secret. Everything else — the public
//! id, the data encryption key, the write-authentication token — is derived
//! from that secret with SLIP-21, so identities are deterministic across
//! devices and nothing but the secret ever needs to be transferred.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{generate_mnemonic, mnemonic_to_seed, slip21_derive};
use crate::error::{Error, Result};
use crate::random::RandomSource;

/// SLIP-21 derivation labels. These are protocol constants; changing them
/// changes every derived identity.
const LABEL_APP: &[u8] = b"Evolu";
const LABEL_OWNER_ID: &[u8] = b"OwnerIdBytes";
const LABEL_ENCRYPTION_KEY: &[u8] = b"OwnerEncryptionKey";
const LABEL_WRITE_KEY: &[u8] = b"OwnerWriteKey";

/// Byte length of an owner id and of a write key.
pub const OWNER_ID_LENGTH: usize = 16;
pub const WRITE_KEY_LENGTH: usize = 16;

/// The root secret an owner identity is derived from.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct OwnerSecret(pub [u8; 32]);

impl OwnerSecret {
    /// 32 fresh random bytes.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; 32];
        random.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the secret from a BIP-39 mnemonic (first 32 bytes of the seed).
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let seed = mnemonic_to_seed(mnemonic)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&seed[0..32]);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for OwnerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OwnerSecret(..)")
    }
}

/// A public owner identifier: 16 bytes, shown URL-safe base64 (22 chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub [u8; OWNER_ID_LENGTH]);

impl OwnerId {
    /// Parse the 22-char text form back into bytes.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| Error::InvalidId(s.to_string()))?;
        let bytes: [u8; OWNER_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl Serialize for OwnerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OwnerId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Symmetric key sealing an owner's change records.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Rotatable write-authentication token presented to relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteKey(pub [u8; WRITE_KEY_LENGTH]);

impl WriteKey {
    /// A fresh random write key, used on rotation.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; WRITE_KEY_LENGTH];
        random.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// A fully derived owner identity.
///
/// `write_key` is `None` for read-only projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: OwnerId,
    pub encryption_key: EncryptionKey,
    pub write_key: Option<WriteKey>,
}

impl Owner {
    /// Derive the full identity from a secret.
    pub fn from_secret(secret: &OwnerSecret) -> Self {
        let id_bytes = slip21_derive(&secret.0, &[LABEL_APP, LABEL_OWNER_ID]);
        let mut id = [0u8; OWNER_ID_LENGTH];
        id.copy_from_slice(&id_bytes[0..OWNER_ID_LENGTH]);

        let encryption_key = slip21_derive(&secret.0, &[LABEL_APP, LABEL_ENCRYPTION_KEY]);

        let write_bytes = slip21_derive(&secret.0, &[LABEL_APP, LABEL_WRITE_KEY]);
        let mut write_key = [0u8; WRITE_KEY_LENGTH];
        write_key.copy_from_slice(&write_bytes[0..WRITE_KEY_LENGTH]);

        Self {
            id: OwnerId(id),
            encryption_key: EncryptionKey(encryption_key),
            write_key: Some(WriteKey(write_key)),
        }
    }
}

/// One component of a shard derivation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathComponent {
    Str(String),
    Int(i64),
}

impl PathComponent {
    /// The SLIP-21 label bytes for this component. Integers use a fixed
    /// 8-byte big-endian form so `1` and `"1"` cannot collide.
    fn to_label(&self) -> Vec<u8> {
        match self {
            PathComponent::Str(s) => s.as_bytes().to_vec(),
            PathComponent::Int(i) => i.to_be_bytes().to_vec(),
        }
    }
}

impl From<&str> for PathComponent {
    fn from(s: &str) -> Self {
        PathComponent::Str(s.to_string())
    }
}

impl From<i64> for PathComponent {
    fn from(i: i64) -> Self {
        PathComponent::Int(i)
    }
}

/// The coordinating owner of a database. Bears the mnemonic it was created
/// from so the host can show it to the user for backup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppOwner {
    pub owner: Owner,
    pub mnemonic: String,
    pub secret: OwnerSecret,
}

impl AppOwner {
    /// Create an app owner from an existing mnemonic.
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let secret = OwnerSecret::from_mnemonic(mnemonic)?;
        Ok(Self {
            owner: Owner::from_secret(&secret),
            mnemonic: mnemonic.to_string(),
            secret,
        })
    }

    /// Create a brand-new app owner with a random mnemonic.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mnemonic = generate_mnemonic(random);
        Self::from_mnemonic(&mnemonic).expect("generated mnemonic is valid")
    }
}

/// A deletable data partition derived from the app owner at a named path.
///
/// Deleting a shard owner (and its rows) is the only way to truly erase
/// replicated data.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOwner {
    pub owner: Owner,
    pub path: Vec<PathComponent>,
}

impl ShardOwner {
    /// Derive a shard owner from the app owner's encryption key at `path`.
    pub fn derive(app: &AppOwner, path: Vec<PathComponent>) -> Self {
        let labels: Vec<Vec<u8>> = path.iter().map(PathComponent::to_label).collect();
        let label_refs: Vec<&[u8]> = labels.iter().map(Vec::as_slice).collect();
        let secret = OwnerSecret(slip21_derive(&app.owner.encryption_key.0, &label_refs));
        Self {
            owner: Owner::from_secret(&secret),
            path,
        }
    }
}

/// A collaborative owner whose secret is shared among participants.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedOwner {
    pub owner: Owner,
    pub secret: OwnerSecret,
}

impl SharedOwner {
    /// Create a new shared owner from a random secret.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let secret = OwnerSecret::generate(random);
        Self {
            owner: Owner::from_secret(&secret),
            secret,
        }
    }

    /// Reconstruct a shared owner from a received secret.
    pub fn from_secret(secret: OwnerSecret) -> Self {
        Self {
            owner: Owner::from_secret(&secret),
            secret,
        }
    }

    /// The read-only projection to hand to followers.
    pub fn to_readonly(&self) -> SharedReadonlyOwner {
        SharedReadonlyOwner {
            id: self.owner.id,
            encryption_key: self.owner.encryption_key.clone(),
        }
    }
}

/// Read-only view of a shared owner: can decrypt, cannot write.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedReadonlyOwner {
    pub id: OwnerId,
    pub encryption_key: EncryptionKey,
}

impl From<SharedReadonlyOwner> for Owner {
    fn from(readonly: SharedReadonlyOwner) -> Self {
        Owner {
            id: readonly.id,
            encryption_key: readonly.encryption_key,
            write_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    const ABANDON_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon about";

    #[test]
    fn app_owner_is_deterministic() {
        let a = AppOwner::from_mnemonic(ABANDON_MNEMONIC).unwrap();
        let b = AppOwner::from_mnemonic(ABANDON_MNEMONIC).unwrap();

        assert_eq!(a.owner.id, b.owner.id);
        assert_eq!(a.owner.encryption_key, b.owner.encryption_key);
        assert_eq!(a.owner.write_key, b.owner.write_key);
        assert_eq!(a.owner.encryption_key.0.len(), 32);
        assert_eq!(a.owner.write_key.unwrap().0.len(), WRITE_KEY_LENGTH);
    }

    #[test]
    fn different_mnemonics_derive_different_owners() {
        let a = AppOwner::from_mnemonic(ABANDON_MNEMONIC).unwrap();
        let b = AppOwner::generate(&SeededRandom::new(99));
        assert_ne!(a.owner.id, b.owner.id);
    }

    #[test]
    fn id_keys_and_write_key_are_domain_separated() {
        let owner = AppOwner::from_mnemonic(ABANDON_MNEMONIC).unwrap().owner;
        let id = owner.id.0;
        let enc = owner.encryption_key.0;
        let write = owner.write_key.unwrap().0;

        assert_ne!(&enc[0..16], &id[..]);
        assert_ne!(&enc[0..16], &write[..]);
        assert_ne!(id, write);
    }

    #[test]
    fn owner_id_text_roundtrip() {
        let owner = AppOwner::generate(&SeededRandom::new(4)).owner;
        let text = owner.id.to_string();
        assert_eq!(text.len(), 22);
        assert_eq!(OwnerId::parse(&text).unwrap(), owner.id);
        assert!(OwnerId::parse("too short").is_err());
    }

    #[test]
    fn shard_owner_depends_on_path() {
        let app = AppOwner::generate(&SeededRandom::new(5));

        let photos = ShardOwner::derive(&app, vec!["photos".into()]);
        let notes = ShardOwner::derive(&app, vec!["notes".into()]);
        let photos_again = ShardOwner::derive(&app, vec!["photos".into()]);

        assert_eq!(photos.owner, photos_again.owner);
        assert_ne!(photos.owner.id, notes.owner.id);
        assert_ne!(photos.owner.id, app.owner.id);
    }

    #[test]
    fn shard_path_int_and_string_do_not_collide() {
        let app = AppOwner::generate(&SeededRandom::new(6));
        let by_int = ShardOwner::derive(&app, vec![1i64.into()]);
        let by_str = ShardOwner::derive(&app, vec!["1".into()]);
        assert_ne!(by_int.owner.id, by_str.owner.id);
    }

    #[test]
    fn shared_owner_readonly_projection() {
        let shared = SharedOwner::generate(&SeededRandom::new(7));
        let readonly = shared.to_readonly();

        assert_eq!(readonly.id, shared.owner.id);
        assert_eq!(readonly.encryption_key, shared.owner.encryption_key);

        let as_owner: Owner = readonly.into();
        assert_eq!(as_owner.write_key, None);
    }

    #[test]
    fn shared_owner_reconstructs_from_secret() {
        let random = SeededRandom::new(8);
        let original = SharedOwner::generate(&random);
        let copy = SharedOwner::from_secret(original.secret.clone());
        assert_eq!(original.owner, copy.owner);
    }
}
