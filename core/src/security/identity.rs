//! Seed handling and deterministic key derivation.
//!
//! Every long-term key a peer owns is derived from a single 32-byte seed:
//! an Ed25519 signing key for session handshakes, an X25519 key for the
//! message envelope, and the transport identity (the signing key in the
//! transport's native form, whose public half is the peer's remote
//! identifier). The seed never leaves the process.

use std::path::Path;

use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Seed length in bytes.
pub const SEED_LEN: usize = 32;

/// KeyId length in bytes.
pub const KEY_ID_LEN: usize = 8;

/// HKDF label separating the KEM key from the signing key.
const KEM_DERIVE_INFO: &[u8] = b"skein kem v1";

/// Errors from seed handling and key derivation.
#[derive(Debug)]
pub enum IdentityError {
    /// Seed input was not exactly [`SEED_LEN`] bytes.
    BadSeedLength(usize),
    /// Seed file could not be read or written.
    Io(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::BadSeedLength(n) => write!(f, "invalid seed size: {}", n),
            IdentityError::Io(e) => write!(f, "seed file error: {}", e),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Short fingerprint of a peer's KEM public key.
///
/// The 8-byte prefix of SHA-256 over the serialized X25519 public key.
/// This form is used everywhere on the wire; decoders reject any other
/// width.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Fingerprint a KEM public key.
    pub fn from_kem_public(kem_public: &[u8; 32]) -> Self {
        let hash = Sha256::digest(kem_public);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&hash[..KEY_ID_LEN]);
        KeyId(id)
    }

    pub fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        KeyId(bytes)
    }

    /// Parse from a wire field; anything but 8 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; KEY_ID_LEN] = bytes.try_into().ok()?;
        Some(KeyId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// All key material derived from one seed.
///
/// Derivation is deterministic: the same seed yields byte-identical keys
/// on every run and platform.
#[derive(Clone)]
pub struct DerivedKeys {
    /// Ed25519 signing key for Hello signatures.
    pub signing: SigningKey,
    /// X25519 secret for the message envelope.
    pub kem_secret: StaticSecret,
    /// Serialized X25519 public key, as published in the roster.
    pub kem_public: [u8; 32],
    /// Fingerprint of `kem_public`.
    pub key_id: KeyId,
    /// The signing key in the transport's native form.
    pub transport: iroh::SecretKey,
    /// Remote identifier derived from the transport public key.
    pub node_id: iroh::NodeId,
}

// Custom Debug to avoid exposing secret key material in logs.
impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("signing", &"[REDACTED]")
            .field("kem_secret", &"[REDACTED]")
            .field("kem_public", &hex::encode(self.kem_public))
            .field("key_id", &self.key_id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl DerivedKeys {
    /// Serialized Ed25519 public key.
    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }
}

/// Derive all keys from a 32-byte seed.
///
/// The signing key is the seed itself in Ed25519 form; the KEM secret is
/// HKDF-expanded from the seed under a dedicated label so the two keys
/// stay independent; the transport identity reuses the signing key bytes.
pub fn derive(seed: &[u8]) -> Result<DerivedKeys, IdentityError> {
    let seed: &[u8; SEED_LEN] = seed
        .try_into()
        .map_err(|_| IdentityError::BadSeedLength(seed.len()))?;

    let signing = SigningKey::from_bytes(seed);

    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut kem_seed = [0u8; 32];
    hk.expand(KEM_DERIVE_INFO, &mut kem_seed)
        .unwrap(); // 32 bytes never exceeds the HKDF output bound

    let kem_secret = StaticSecret::from(kem_seed);
    let kem_public = X25519PublicKey::from(&kem_secret).to_bytes();
    let key_id = KeyId::from_kem_public(&kem_public);

    let transport = iroh::SecretKey::from_bytes(&signing.to_bytes());
    let node_id = transport.public();

    Ok(DerivedKeys {
        signing,
        kem_secret,
        kem_public,
        key_id,
        transport,
        node_id,
    })
}

/// Generate a fresh random seed.
pub fn generate_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    seed
}

/// Write a seed to `path` with owner-only permissions.
pub fn save_seed(path: &Path, seed: &[u8; SEED_LEN]) -> Result<(), IdentityError> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| IdentityError::Io(e.to_string()))?;
        file.write_all(seed)
            .map_err(|e| IdentityError::Io(e.to_string()))
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, seed).map_err(|e| IdentityError::Io(e.to_string()))
    }
}

/// Read a seed from `path`, validating its length.
pub fn load_seed(path: &Path) -> Result<[u8; SEED_LEN], IdentityError> {
    let bytes = std::fs::read(path).map_err(|e| IdentityError::Io(e.to_string()))?;
    let seed: [u8; SEED_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadSeedLength(bytes.len()))?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let seed = [0xAAu8; 32];

        let a = derive(&seed).unwrap();
        let b = derive(&seed).unwrap();

        assert_eq!(a.signing.to_bytes(), b.signing.to_bytes());
        assert_eq!(a.kem_secret.to_bytes(), b.kem_secret.to_bytes());
        assert_eq!(a.kem_public, b.kem_public);
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.node_id, b.node_id);
    }

    #[test]
    fn test_derive_rejects_bad_seed_length() {
        match derive(&[1u8; 16]) {
            Err(IdentityError::BadSeedLength(16)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match derive(&[]) {
            Err(IdentityError::BadSeedLength(0)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = derive(&[1u8; 32]).unwrap();
        let b = derive(&[2u8; 32]).unwrap();

        assert_ne!(a.kem_public, b.kem_public);
        assert_ne!(a.key_id, b.key_id);
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn test_signing_and_kem_keys_are_independent() {
        let keys = derive(&[7u8; 32]).unwrap();
        assert_ne!(keys.signing.to_bytes(), keys.kem_secret.to_bytes());
    }

    #[test]
    fn test_key_id_is_sha256_prefix() {
        let keys = derive(&[3u8; 32]).unwrap();
        let hash = Sha256::digest(keys.kem_public);
        assert_eq!(keys.key_id.as_bytes(), &hash[..KEY_ID_LEN]);
    }

    #[test]
    fn test_key_id_from_slice_rejects_wrong_width() {
        assert!(KeyId::from_slice(&[1]).is_none());
        assert!(KeyId::from_slice(&[0u8; 7]).is_none());
        assert!(KeyId::from_slice(&[0u8; 9]).is_none());
        assert!(KeyId::from_slice(&[0u8; 8]).is_some());
    }

    #[test]
    fn test_transport_identity_matches_signing_key() {
        let keys = derive(&[9u8; 32]).unwrap();
        // The transport secret is the Ed25519 signing key re-wrapped, so the
        // NodeId is the signing public key.
        assert_eq!(keys.node_id.as_bytes(), &keys.signing_public());
    }

    #[test]
    fn test_seed_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.key");
        let seed = generate_seed();

        save_seed(&path, &seed).unwrap();
        let loaded = load_seed(&path).unwrap();
        assert_eq!(seed, loaded);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_seed_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.key");
        std::fs::write(&path, [0u8; 12]).unwrap();

        match load_seed(&path) {
            Err(IdentityError::BadSeedLength(12)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_debug_does_not_expose_secrets() {
        let keys = derive(&[5u8; 32]).unwrap();
        let debug_output = format!("{:?}", keys);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(&hex::encode([5u8; 32])));
    }
}
