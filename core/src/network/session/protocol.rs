//! Session wire format and handshake verification.
//!
//! A session starts with the responder's 32-byte Challenge, answered by a
//! signed Hello binding the sender's nickname, KeyId, Ed25519 public key
//! and KEM public key to that challenge. After that, Requests and
//! Responses are multiplexed by correlation id; Goodbye announces orderly
//! teardown.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::data::peer_table::PeerTable;
use crate::network::session::SessionError;
use crate::network::wire::{PayloadReader, PayloadWriter, WireError};
use crate::security::identity::{KeyId, KEY_ID_LEN};

/// Protocol identifier for peer-to-peer session streams.
pub const MSG_ALPN: &[u8] = b"skein/msg/1.0.0";

// Message type tags (independent from the discovery tags).
pub const MSG_CHALLENGE: u8 = 1;
pub const MSG_HELLO: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_RESPONSE: u8 = 4;
pub const MSG_GOODBYE: u8 = 5;

/// Challenge payload length.
pub const CHALLENGE_LEN: usize = 32;

/// Media type for sealed request plaintexts.
pub const REQUEST_MEDIA_TYPE: &[u8] = b"text/plain; purpose=req";
/// Media type for sealed response plaintexts.
pub const RESPONSE_MEDIA_TYPE: &[u8] = b"text/plain; purpose=resp";

/// ASCII prefix marking a fan-out notification rather than a direct
/// message.
pub const BROADCAST_TAG: &str = "[BROADCAST]";

/// Signed identity announcement answering a Challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub sender: String,
    pub key_id: KeyId,
    pub ed_public: [u8; 32],
    pub kem_public: [u8; 32],
    pub signature: [u8; 64],
}

impl Hello {
    /// Build and sign a Hello for `challenge`.
    pub fn signed(
        signing: &SigningKey,
        sender: &str,
        key_id: KeyId,
        kem_public: [u8; 32],
        challenge: &[u8],
    ) -> Self {
        let ed_public = signing.verifying_key().to_bytes();
        let input = hello_sign_input(challenge, sender, &key_id, &ed_public, &kem_public);
        let signature = signing.sign(&input).to_bytes();
        Hello {
            sender: sender.to_string(),
            key_id,
            ed_public,
            kem_public,
            signature,
        }
    }
}

/// The byte string a Hello signature covers:
/// `challenge || sender || 0x00 || keyId || edPub || kemPub`.
pub fn hello_sign_input(
    challenge: &[u8],
    sender: &str,
    key_id: &KeyId,
    ed_public: &[u8; 32],
    kem_public: &[u8; 32],
) -> Vec<u8> {
    let mut input =
        Vec::with_capacity(challenge.len() + sender.len() + 1 + KEY_ID_LEN + 32 + 32);
    input.extend_from_slice(challenge);
    input.extend_from_slice(sender.as_bytes());
    input.push(0);
    input.extend_from_slice(key_id.as_bytes());
    input.extend_from_slice(ed_public);
    input.extend_from_slice(kem_public);
    input
}

/// Verify a Hello against the challenge it answers.
///
/// Checks the Ed25519 signature over the sign input; if the roster has an
/// entry for the sender, additionally requires its KeyId and KEM public
/// key to match byte-for-byte.
pub fn verify_hello(
    challenge: &[u8],
    hello: &Hello,
    table: Option<&PeerTable>,
) -> Result<(), SessionError> {
    let verifying = VerifyingKey::from_bytes(&hello.ed_public)
        .map_err(|_| SessionError::IdentityMismatch(format!("bad public key for {}", hello.sender)))?;

    let input = hello_sign_input(
        challenge,
        &hello.sender,
        &hello.key_id,
        &hello.ed_public,
        &hello.kem_public,
    );
    let signature = Signature::from_bytes(&hello.signature);
    verifying
        .verify(&input, &signature)
        .map_err(|_| SessionError::IdentityMismatch(format!("invalid signature for {}", hello.sender)))?;

    if let Some(table) = table {
        if let Some(known) = table.get(&hello.sender) {
            if known.key_id != hello.key_id {
                return Err(SessionError::IdentityMismatch(format!(
                    "key id mismatch for {}: got {} want {}",
                    hello.sender, hello.key_id, known.key_id
                )));
            }
            if known.kem_public != hello.kem_public {
                return Err(SessionError::IdentityMismatch(format!(
                    "kem public key mismatch for {}",
                    hello.sender
                )));
            }
        }
    }

    Ok(())
}

/// Encrypted request addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u64,
    pub recipient_key_id: KeyId,
    pub encap_key: Vec<u8>,
    pub media_type: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypted response correlated to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: u64,
    pub media_type: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Orderly session termination, carrying the sender's nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sender: String,
}

pub fn encode_hello(h: &Hello) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(h.sender.as_bytes())
        .blob(h.key_id.as_bytes())
        .blob(&h.ed_public)
        .blob(&h.kem_public)
        .blob(&h.signature);
    w.into_bytes()
}

pub fn decode_hello(payload: &[u8]) -> Result<Hello, WireError> {
    let mut r = PayloadReader::new(payload);
    let sender = r.string()?;
    let key_id = KeyId::from_slice(r.fixed_blob("key id", KEY_ID_LEN)?)
        .ok_or(WireError::BadFieldLength("key id", KEY_ID_LEN))?;
    let ed_public: [u8; 32] = r
        .fixed_blob("ed25519 public key", 32)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let kem_public: [u8; 32] = r
        .fixed_blob("kem public key", 32)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let signature: [u8; 64] = r
        .fixed_blob("signature", 64)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    Ok(Hello {
        sender,
        key_id,
        ed_public,
        kem_public,
        signature,
    })
}

pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(&req.request_id.to_be_bytes())
        .blob(req.recipient_key_id.as_bytes())
        .blob(&req.encap_key)
        .blob(&req.media_type)
        .blob(&req.ciphertext);
    w.into_bytes()
}

pub fn decode_request(payload: &[u8]) -> Result<Request, WireError> {
    let mut r = PayloadReader::new(payload);
    let id_bytes: [u8; 8] = r
        .fixed_blob("request id", 8)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let request_id = u64::from_be_bytes(id_bytes);
    let recipient_key_id = KeyId::from_slice(r.fixed_blob("key id", KEY_ID_LEN)?)
        .ok_or(WireError::BadFieldLength("key id", KEY_ID_LEN))?;
    let encap_key = r.blob()?.to_vec();
    let media_type = r.blob()?.to_vec();
    let ciphertext = r.blob()?.to_vec();
    Ok(Request {
        request_id,
        recipient_key_id,
        encap_key,
        media_type,
        ciphertext,
    })
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(&resp.request_id.to_be_bytes())
        .blob(&resp.media_type)
        .blob(&resp.ciphertext);
    w.into_bytes()
}

pub fn decode_response(payload: &[u8]) -> Result<Response, WireError> {
    let mut r = PayloadReader::new(payload);
    let id_bytes: [u8; 8] = r
        .fixed_blob("response id", 8)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let request_id = u64::from_be_bytes(id_bytes);
    let media_type = r.blob()?.to_vec();
    let ciphertext = r.blob()?.to_vec();
    Ok(Response {
        request_id,
        media_type,
        ciphertext,
    })
}

pub fn encode_goodbye(g: &Goodbye) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(g.sender.as_bytes());
    w.into_bytes()
}

pub fn decode_goodbye(payload: &[u8]) -> Result<Goodbye, WireError> {
    let mut r = PayloadReader::new(payload);
    let sender = r.string()?;
    Ok(Goodbye { sender })
}
