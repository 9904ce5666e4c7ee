//! One-request/one-response message envelope.
//!
//! HPKE-style sealing over X25519 + HKDF-SHA256 + AES-128-GCM. A request
//! is encrypted under a fresh random request secret, which is then
//! key-wrapped to the recipient's KEM public key (ephemeral Diffie-Hellman,
//! salted with the recipient's 8-byte KeyId). The same request secret is
//! the shared context for the reply: the receiver seals its response with
//! keys expanded from it, and the sender's [`ResponseOpener`] holds it to
//! open exactly one response.
//!
//! The media type of each direction is bound as AEAD associated data, so a
//! ciphertext presented under a different media type fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::security::identity::KeyId;

/// Length of the request secret shared between sealer and opener.
const REQUEST_SECRET_LEN: usize = 32;

/// Length of an encapsulated key: ephemeral public key plus the wrapped
/// request secret (secret + GCM tag).
pub const ENCAP_KEY_LEN: usize = 32 + REQUEST_SECRET_LEN + 16;

const REQUEST_KEY_INFO: &[u8] = b"skein env request key v1";
const REQUEST_NONCE_INFO: &[u8] = b"skein env request nonce v1";
const RESPONSE_KEY_INFO: &[u8] = b"skein env response key v1";
const RESPONSE_NONCE_INFO: &[u8] = b"skein env response nonce v1";
const WRAP_KEY_INFO: &[u8] = b"skein env wrap key v1";
const WRAP_NONCE_INFO: &[u8] = b"skein env wrap nonce v1";

/// Errors from sealing or opening envelopes.
#[derive(Debug)]
pub enum EnvelopeError {
    /// Encapsulated key field has the wrong length.
    BadEncapsulatedKey(usize),
    /// Encryption failed.
    SealFailed,
    /// Authentication or decryption failed (tampering, wrong recipient
    /// key, or mismatched media type).
    OpenFailed,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::BadEncapsulatedKey(n) => {
                write!(f, "bad encapsulated key length: {}", n)
            }
            EnvelopeError::SealFailed => write!(f, "envelope seal failed"),
            EnvelopeError::OpenFailed => write!(f, "envelope open failed"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Request secret shared by a sealer and its matched opener.
///
/// Zeroed from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct RequestSecret([u8; REQUEST_SECRET_LEN]);

/// HKDF-SHA256(salt, secret) expanded into an AES-128 key and GCM nonce
/// under two distinct labels.
fn derive_key_nonce(
    secret: &[u8],
    salt: Option<&[u8]>,
    key_info: &[u8],
    nonce_info: &[u8],
) -> ([u8; 16], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(salt, secret);

    let mut key = [0u8; 16];
    hk.expand(key_info, &mut key).unwrap(); // output below digest size, infallible

    let mut nonce = [0u8; 12];
    hk.expand(nonce_info, &mut nonce).unwrap();

    (key, nonce)
}

fn seal(key: &[u8; 16], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EnvelopeError::SealFailed)
}

fn open(key: &[u8; 16], nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EnvelopeError::OpenFailed)
}

/// Seals one request plaintext; may be encapsulated to several recipients.
///
/// The ciphertext is produced up front; [`RequestSealer::encapsulate`]
/// wraps the request secret to one recipient and yields the matching
/// [`ResponseOpener`].
pub struct RequestSealer {
    secret: RequestSecret,
    ciphertext: Vec<u8>,
}

impl RequestSealer {
    pub fn new(plaintext: &[u8], media_type: &[u8]) -> Result<Self, EnvelopeError> {
        let mut secret = [0u8; REQUEST_SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);

        let (key, nonce) =
            derive_key_nonce(&secret, None, REQUEST_KEY_INFO, REQUEST_NONCE_INFO);
        let ciphertext = seal(&key, &nonce, plaintext, media_type)?;

        Ok(Self {
            secret: RequestSecret(secret),
            ciphertext,
        })
    }

    /// The sealed request bytes.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Wrap the request secret to a recipient.
    ///
    /// Returns the encapsulated key to send alongside the ciphertext and
    /// the opener for that recipient's single response.
    pub fn encapsulate(
        &self,
        recipient_key_id: &KeyId,
        recipient_kem_public: &[u8; 32],
    ) -> Result<(Vec<u8>, ResponseOpener), EnvelopeError> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient_kem_public));

        let (wrap_key, wrap_nonce) = derive_key_nonce(
            shared.as_bytes(),
            Some(recipient_key_id.as_bytes()),
            WRAP_KEY_INFO,
            WRAP_NONCE_INFO,
        );
        let wrapped = seal(
            &wrap_key,
            &wrap_nonce,
            &self.secret.0,
            recipient_key_id.as_bytes(),
        )?;

        let mut encap = Vec::with_capacity(ENCAP_KEY_LEN);
        encap.extend_from_slice(ephemeral_public.as_bytes());
        encap.extend_from_slice(&wrapped);

        Ok((
            encap,
            ResponseOpener {
                secret: self.secret.clone(),
            },
        ))
    }
}

/// Opens the single response matched to one encapsulation.
pub struct ResponseOpener {
    secret: RequestSecret,
}

impl ResponseOpener {
    /// Open the response ciphertext; consumes the opener.
    pub fn open(self, ciphertext: &[u8], media_type: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (key, nonce) =
            derive_key_nonce(&self.secret.0, None, RESPONSE_KEY_INFO, RESPONSE_NONCE_INFO);
        open(&key, &nonce, ciphertext, media_type)
    }
}

/// Receiver side: opens any number of requests addressed to one KEM key.
pub struct MultiRequestReceiver {
    key_id: KeyId,
    kem_secret: StaticSecret,
}

impl MultiRequestReceiver {
    pub fn new(key_id: KeyId, kem_secret: StaticSecret) -> Self {
        Self { key_id, kem_secret }
    }

    /// Unwrap one request: recover the request secret from the
    /// encapsulated key, then decrypt the request ciphertext.
    pub fn new_request_opener(
        &self,
        encap_key: &[u8],
        ciphertext: &[u8],
        media_type: &[u8],
    ) -> Result<RequestOpener, EnvelopeError> {
        if encap_key.len() != ENCAP_KEY_LEN {
            return Err(EnvelopeError::BadEncapsulatedKey(encap_key.len()));
        }

        let ephemeral_public: [u8; 32] = encap_key[..32]
            .try_into()
            .map_err(|_| EnvelopeError::BadEncapsulatedKey(encap_key.len()))?;
        let wrapped = &encap_key[32..];

        let shared = self
            .kem_secret
            .diffie_hellman(&X25519PublicKey::from(ephemeral_public));

        let (wrap_key, wrap_nonce) = derive_key_nonce(
            shared.as_bytes(),
            Some(self.key_id.as_bytes()),
            WRAP_KEY_INFO,
            WRAP_NONCE_INFO,
        );
        let secret_bytes = open(&wrap_key, &wrap_nonce, wrapped, self.key_id.as_bytes())?;
        let secret: [u8; REQUEST_SECRET_LEN] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::OpenFailed)?;

        let (key, nonce) = derive_key_nonce(&secret, None, REQUEST_KEY_INFO, REQUEST_NONCE_INFO);
        let plaintext = open(&key, &nonce, ciphertext, media_type)?;

        Ok(RequestOpener {
            secret: RequestSecret(secret),
            plaintext,
        })
    }
}

/// An opened request, carrying the context to seal its one response.
pub struct RequestOpener {
    secret: RequestSecret,
    plaintext: Vec<u8>,
}

impl RequestOpener {
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// Seal the reply under the shared request context; consumes the
    /// opener so each request is answered at most once.
    pub fn seal_response(self, reply: &[u8], media_type: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (key, nonce) =
            derive_key_nonce(&self.secret.0, None, RESPONSE_KEY_INFO, RESPONSE_NONCE_INFO);
        seal(&key, &nonce, reply, media_type)
    }
}
