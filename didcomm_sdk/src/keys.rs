//! Local Ed25519 keys used for envelope encryption and decryption.
//!
//! The heavy key store (hardware wallets, secure enclaves) is an external
//! collaborator; this module only covers in-process keys generated for
//! connections, invitations and routing.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use zeroize::Zeroizing;

/// A local Ed25519 key pair, identified by its base58 verkey.
///
/// The signing key zeroizes its secret material on drop.
#[derive(Clone)]
pub struct LocalKey {
    verkey: String,
    signing_key: SigningKey,
}

impl LocalKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Derive a key deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verkey = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        Self {
            verkey,
            signing_key,
        }
    }

    /// The base58-encoded public verification key.
    pub fn verkey(&self) -> &str {
        &self.verkey
    }

    /// The raw 32-byte public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The X25519 secret corresponding to this Ed25519 key, used for
    /// envelope key agreement.
    pub(crate) fn agreement_secret(&self) -> crypto_box::SecretKey {
        crypto_box::SecretKey::from(self.signing_key.to_scalar_bytes())
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKey").field("verkey", &self.verkey).finish()
    }
}

/// The set of local keys an agent can decrypt with, indexed by verkey.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: Arc<RwLock<HashMap<String, LocalKey>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Default::default()
    }

    /// Generate a new key and add it to the ring.
    pub fn create_key(&self) -> LocalKey {
        let key = LocalKey::generate();
        self.add(key.clone());
        key
    }

    pub fn add(&self, key: LocalKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(key.verkey().to_string(), key);
        }
    }

    pub fn get(&self, verkey: &str) -> Option<LocalKey> {
        self.keys.read().ok()?.get(verkey).cloned()
    }

    pub fn contains(&self, verkey: &str) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(verkey))
            .unwrap_or(false)
    }

    /// Snapshot of all keys, for envelope unpacking.
    pub fn all(&self) -> Vec<LocalKey> {
        self.keys
            .read()
            .map(|keys| keys.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verkey_is_base58_of_public_key() {
        let key = LocalKey::from_seed([7u8; 32]);
        let decoded = bs58::decode(key.verkey()).into_vec().unwrap();
        assert_eq!(decoded, key.public_bytes());
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = LocalKey::from_seed([1u8; 32]);
        let b = LocalKey::from_seed([1u8; 32]);
        assert_eq!(a.verkey(), b.verkey());
    }

    #[test]
    fn key_ring_lookup() {
        let ring = KeyRing::new();
        let key = ring.create_key();

        assert!(ring.contains(key.verkey()));
        assert_eq!(ring.get(key.verkey()).unwrap().verkey(), key.verkey());
        assert_eq!(ring.all().len(), 1);
        assert!(!ring.contains("unknown"));
    }
}
