//! Hybrid encryption for payloads addressed to a node's long-term identity.
//!
//! A random session key is sealed to the recipient (X25519 against the
//! Montgomery form of its Ed25519 key) and signed by the sender. The payload
//! itself is encrypted with AES-256-GCM under that session key.
//!
//! ```text
//! ┌───────────────────────── key block (168) ─────────────────────────┐
//! │ signature 64 │ ephemeral 32 │ nonce 24 │ tag 16 │ sealed key 32    │
//! └───────────────────────────────────────────────────────────────────┘
//! ┌──────────── payload ────────────┐
//! │ nonce 12 │ tag 16 │ ciphertext  │
//! └─────────────────────────────────┘
//! ```

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use ed25519_dalek::SIGNATURE_LENGTH;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{EphemeralKeys, NodeIdentity, PeerIdentity, KEY_LENGTH};
use crate::envelope::{derive_key, open_box, seal_box, Payload, NONCE_LENGTH, TAG_LENGTH};
use crate::error::{ProtocolError, Result};

/// Size of the sealed session key block at the start of every hybrid message.
pub const KEY_BLOCK_LENGTH: usize =
    SIGNATURE_LENGTH + KEY_LENGTH + NONCE_LENGTH + TAG_LENGTH + KEY_LENGTH;

const GCM_NONCE_LENGTH: usize = 12;
const GCM_TAG_LENGTH: usize = 16;
const KEY_WRAP_INFO: &[u8] = b"meshgate/hybrid/v1";

/// Encrypts `payload` for `recipient`, signed by `sender`.
pub fn seal_hybrid(
    sender: &NodeIdentity,
    recipient: &PeerIdentity,
    payload: &Payload,
) -> Result<Vec<u8>> {
    let mut session_key = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut session_key);

    let ephemeral = EphemeralKeys::generate();
    let shared = ephemeral
        .secret()
        .diffie_hellman(&recipient.exchange_public());
    let wrap_key = derive_key(shared.as_bytes(), KEY_WRAP_INFO)?;

    let mut unsigned = Vec::with_capacity(KEY_BLOCK_LENGTH - SIGNATURE_LENGTH);
    unsigned.extend_from_slice(ephemeral.public().as_bytes());
    unsigned.extend_from_slice(&seal_box(&wrap_key, &session_key)?);
    let block = sender.sign_prefixed(&unsigned);
    debug_assert_eq!(block.len(), KEY_BLOCK_LENGTH);

    let cipher = Aes256Gcm::new_from_slice(&session_key)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
    let mut nonce = [0u8; GCM_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let mut buffer = payload.to_bytes()?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let mut out =
        Vec::with_capacity(KEY_BLOCK_LENGTH + GCM_NONCE_LENGTH + GCM_TAG_LENGTH + buffer.len());
    out.extend_from_slice(&block);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Verifies the sender, recovers the session key, then decrypts the payload.
pub fn open_hybrid(
    recipient: &NodeIdentity,
    sender: &PeerIdentity,
    data: &[u8],
    packed: bool,
) -> Result<Payload> {
    if data.len() < KEY_BLOCK_LENGTH + GCM_NONCE_LENGTH + GCM_TAG_LENGTH {
        return Err(ProtocolError::Deserialization(format!(
            "hybrid message too short: {} bytes",
            data.len()
        )));
    }
    let (block, body) = data.split_at(KEY_BLOCK_LENGTH);
    let unsigned = sender.open_prefixed(block)?;
    let (ephemeral, sealed_key) = unsigned.split_at(KEY_LENGTH);

    let mut ephemeral_bytes = [0u8; KEY_LENGTH];
    ephemeral_bytes.copy_from_slice(ephemeral);
    let shared = recipient
        .exchange_secret()
        .diffie_hellman(&X25519PublicKey::from(ephemeral_bytes));
    let wrap_key = derive_key(shared.as_bytes(), KEY_WRAP_INFO)?;
    let session_key = open_box(&wrap_key, sealed_key)?;

    let cipher = Aes256Gcm::new_from_slice(&session_key)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
    let (nonce, rest) = body.split_at(GCM_NONCE_LENGTH);
    let (tag, ciphertext) = rest.split_at(GCM_TAG_LENGTH);
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))?;

    Payload::from_bytes(buffer, packed)
}
