//! Signed, authenticated-encryption envelopes.
//!
//! # Envelope Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────┬──────────────────┐
//! │ signature 64 │  nonce 24    │   tag 16   │   ciphertext     │
//! └──────────────┴──────────────┴────────────┴──────────────────┘
//!                └──────── signed by the sender's identity ────┘
//! ```
//!
//! The box key is HKDF-SHA256 over the X25519 agreement between the local
//! ephemeral secret and the peer's ephemeral public key. Opening verifies the
//! signature before anything is decrypted.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Tag, XChaCha20Poly1305, XNonce};
use ed25519_dalek::SIGNATURE_LENGTH;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::{NodeIdentity, PeerIdentity};
use crate::error::{ProtocolError, Result};

/// XChaCha20 nonce length.
pub const NONCE_LENGTH: usize = 24;

/// Poly1305 tag length.
pub const TAG_LENGTH: usize = 16;

/// Bytes an envelope adds on top of its plaintext.
pub const ENVELOPE_OVERHEAD: usize = SIGNATURE_LENGTH + NONCE_LENGTH + TAG_LENGTH;

const ENVELOPE_INFO: &[u8] = b"meshgate/envelope/v1";

/// A message body, either structured (MessagePack on the wire) or raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured value, packed before encryption.
    Packed(Value),
    /// Bytes passed through untouched.
    Raw(Vec<u8>),
}

impl Payload {
    /// The empty structured value.
    pub fn null() -> Self {
        Payload::Packed(Value::Null)
    }

    /// Whether this body is packed on the wire.
    pub fn is_packed(&self) -> bool {
        matches!(self, Payload::Packed(_))
    }

    /// Serializes to the bytes that get encrypted.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Packed(value) => Ok(rmp_serde::to_vec(value)?),
            Payload::Raw(bytes) => Ok(bytes.clone()),
        }
    }

    /// Parses decrypted bytes.
    pub fn from_bytes(bytes: Vec<u8>, packed: bool) -> Result<Self> {
        if packed {
            Ok(Payload::Packed(rmp_serde::from_slice(&bytes)?))
        } else {
            Ok(Payload::Raw(bytes))
        }
    }

    /// Structured view; raw bodies are exposed as an array of byte values.
    pub fn as_value(&self) -> Value {
        match self {
            Payload::Packed(value) => value.clone(),
            Payload::Raw(bytes) => Value::from(bytes.clone()),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Packed(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

/// Derives a 32-byte symmetric key from a Diffie-Hellman output.
pub(crate) fn derive_key(shared: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| ProtocolError::Encryption(format!("key derivation failed: {}", e)))?;
    Ok(okm)
}

/// Encrypts into `nonce || tag || ciphertext`.
pub(crate) fn seal_box(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LENGTH + TAG_LENGTH + buffer.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Decrypts `nonce || tag || ciphertext`.
pub(crate) fn open_box(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(ProtocolError::Deserialization(format!(
            "box too short: {} bytes",
            sealed.len()
        )));
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
    let (nonce, rest) = sealed.split_at(NONCE_LENGTH);
    let (tag, ciphertext) = rest.split_at(TAG_LENGTH);

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            b"",
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))?;
    Ok(buffer)
}

/// Encrypts and signs raw bytes.
pub fn seal(
    identity: &NodeIdentity,
    peer_public: &X25519PublicKey,
    local_secret: &StaticSecret,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let shared = local_secret.diffie_hellman(peer_public);
    let key = derive_key(shared.as_bytes(), ENVELOPE_INFO)?;
    let sealed = seal_box(&key, plaintext)?;
    Ok(identity.sign_prefixed(&sealed))
}

/// Verifies and decrypts an envelope produced by [`seal`].
pub fn open(
    peer: &PeerIdentity,
    peer_public: &X25519PublicKey,
    local_secret: &StaticSecret,
    envelope: &[u8],
) -> Result<Vec<u8>> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(ProtocolError::Deserialization(format!(
            "envelope too short: {} bytes, need at least {}",
            envelope.len(),
            ENVELOPE_OVERHEAD
        )));
    }
    let sealed = peer.open_prefixed(envelope)?;
    let shared = local_secret.diffie_hellman(peer_public);
    let key = derive_key(shared.as_bytes(), ENVELOPE_INFO)?;
    open_box(&key, sealed)
}

/// Encrypts a payload, packing it first when it is structured.
pub fn encrypt(
    identity: &NodeIdentity,
    peer_public: &X25519PublicKey,
    local_secret: &StaticSecret,
    payload: &Payload,
) -> Result<Vec<u8>> {
    seal(identity, peer_public, local_secret, &payload.to_bytes()?)
}

/// Opens an envelope and unpacks it when `packed` is set.
pub fn decrypt(
    peer: &PeerIdentity,
    peer_public: &X25519PublicKey,
    local_secret: &StaticSecret,
    envelope: &[u8],
    packed: bool,
) -> Result<Payload> {
    let plaintext = open(peer, peer_public, local_secret, envelope)?;
    Payload::from_bytes(plaintext, packed)
}
