//! Long-term identities, ephemeral exchange keys and the digests used on the wire.
//!
//! Every node and user owns an Ed25519 signing identity. Connections add a
//! fresh X25519 key pair whose public half travels signed by the long-term
//! key. Users are named on the wire by their [`RealUser`] digest, never by
//! their plain username.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_224, Sha3_256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Length of a real user identifier (SHA3-224 output).
pub const REAL_USER_LENGTH: usize = 28;

/// Length of a raw key (Ed25519 public/secret or X25519 public).
pub const KEY_LENGTH: usize = 32;

/// Length of a signed ephemeral key: signature followed by the X25519 public key.
pub const SIGNED_KEY_LENGTH: usize = SIGNATURE_LENGTH + KEY_LENGTH;

/// Hashed form of a username as exchanged before authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RealUser([u8; REAL_USER_LENGTH]);

impl RealUser {
    /// Derives the identifier for a username.
    pub fn from_username(username: &str) -> Self {
        let digest = Sha3_224::digest(username.as_bytes());
        let mut out = [0u8; REAL_USER_LENGTH];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Wraps bytes read from the wire.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; REAL_USER_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::HandshakeFailed(format!(
                "real user must be {} bytes, got {}",
                REAL_USER_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; REAL_USER_LENGTH] {
        &self.0
    }

    /// Lowercase hex form, used for store lookups and key file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for RealUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex SHA3-224 digest of a name.
///
/// Peer node keys are filed under the digest of their network address.
pub fn name_digest(name: &str) -> String {
    hex::encode(Sha3_224::digest(name.as_bytes()))
}

/// Hex SHA3-256 digest of a hex-encoded bearer token.
///
/// Tokens are stored and scoped by this digest only.
pub fn token_hash(token: &str) -> Result<String> {
    let raw = hex::decode(token)
        .map_err(|e| ProtocolError::Deserialization(format!("token is not valid hex: {}", e)))?;
    Ok(hex::encode(Sha3_256::digest(&raw)))
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// The identity of the local node or user, including the secret key.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl NodeIdentity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Creates an identity from raw secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Creates an identity from the contents of a secret key file.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    /// Returns the secret key bytes.
    ///
    /// **Security Warning**: only use this for writing the key file.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the public half as a peer identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.verifying_key,
        }
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Returns `signature || message`.
    pub fn sign_prefixed(&self, message: &[u8]) -> Vec<u8> {
        let signature = self.sign(message);
        let mut out = Vec::with_capacity(SIGNATURE_LENGTH + message.len());
        out.extend_from_slice(signature.as_bytes());
        out.extend_from_slice(message);
        out
    }

    /// X25519 secret corresponding to this signing key, used to open sealed session keys.
    pub fn exchange_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Short hex fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.to_peer_identity().fingerprint()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public identity of a remote user or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
}

impl PeerIdentity {
    /// Creates a PeerIdentity from public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Creates a PeerIdentity from the contents of a key file.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_public_key_bytes(&arr)
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Verifies a signature against a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Verifies `signature || message` and returns the message.
    pub fn open_prefixed<'a>(&self, signed: &'a [u8]) -> Result<&'a [u8]> {
        if signed.len() < SIGNATURE_LENGTH {
            return Err(ProtocolError::InvalidSignature(format!(
                "signed data too short: {} bytes",
                signed.len()
            )));
        }
        let (sig, message) = signed.split_at(SIGNATURE_LENGTH);
        let mut arr = [0u8; SIGNATURE_LENGTH];
        arr.copy_from_slice(sig);
        self.verify(message, &Signature(arr))?;
        Ok(message)
    }

    /// X25519 public key corresponding to this verifying key.
    pub fn exchange_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.verifying_key.to_montgomery().to_bytes())
    }

    /// Short hex fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        use sha2::Sha256;
        let digest = Sha256::digest(self.verifying_key.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Per-connection X25519 key pair. Never persisted.
pub struct EphemeralKeys {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeys {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half.
    pub fn public(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Secret half.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Public key signed with the long-term identity (`signature || key`, 96 bytes).
    pub fn signed_public(&self, identity: &NodeIdentity) -> Vec<u8> {
        identity.sign_prefixed(self.public.as_bytes())
    }
}

impl std::fmt::Debug for EphemeralKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeys")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Verifies a signed ephemeral key and returns the X25519 public key it carries.
pub fn open_signed_key(peer: &PeerIdentity, signed: &[u8]) -> Result<X25519PublicKey> {
    if signed.len() != SIGNED_KEY_LENGTH {
        return Err(ProtocolError::HandshakeFailed(format!(
            "signed key must be {} bytes, got {}",
            SIGNED_KEY_LENGTH,
            signed.len()
        )));
    }
    let key = peer.open_prefixed(signed)?;
    let mut arr = [0u8; KEY_LENGTH];
    arr.copy_from_slice(key);
    Ok(X25519PublicKey::from(arr))
}
