//! Per-connection key agreement state.
//!
//! ```text
//! Uninitialized ─▶ EphemeralKeyGenerated ─▶ UsernameShared ─▶ KeyShared ─▶ Established
//!                                           (client only)
//! ```
//!
//! A session only seals or opens envelopes once it holds the local ephemeral
//! secret, the peer's ephemeral public key and the peer's verification key.

use std::sync::Arc;

use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{EphemeralKeys, NodeIdentity, PeerIdentity};
use crate::envelope::{self, Payload};
use crate::error::{ProtocolError, Result};

/// Progress of the identity exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Nothing generated or exchanged yet.
    Uninitialized,
    /// Local ephemeral key pair exists.
    EphemeralKeyGenerated,
    /// Client has sent its real user identifier.
    UsernameShared,
    /// Local signed ephemeral key has been sent.
    KeyShared,
    /// Both sides' keys are known; envelopes may flow.
    Established,
}

/// Which end of the connection this session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out and speaks first.
    Client,
    /// Accepts connections.
    Server,
}

/// Keys and progress of one connection's handshake.
pub struct Session {
    role: Role,
    state: HandshakeState,
    identity: Arc<NodeIdentity>,
    local: Option<EphemeralKeys>,
    peer: Option<PeerIdentity>,
    peer_public: Option<X25519PublicKey>,
}

impl Session {
    pub fn new(role: Role, identity: Arc<NodeIdentity>) -> Self {
        Self {
            role,
            state: HandshakeState::Uninitialized,
            identity,
            local: None,
            peer: None,
            peer_public: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Peer's long-term identity once known.
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn has_local_keys(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    fn advance(&mut self, to: HandshakeState) {
        if to > self.state {
            self.state = to;
        }
        if self.local.is_some() && self.peer.is_some() && self.peer_public.is_some() {
            self.state = HandshakeState::Established;
        }
    }

    /// Generates the local ephemeral key pair. Existing keys are kept unless `replace` is set.
    pub fn generate_keys(&mut self, replace: bool) {
        if self.local.is_none() || replace {
            self.local = Some(EphemeralKeys::generate());
        }
        self.advance(HandshakeState::EphemeralKeyGenerated);
    }

    /// Local ephemeral public key signed by the long-term identity.
    pub fn signed_local_key(&mut self) -> Vec<u8> {
        let keys = self.local.get_or_insert_with(EphemeralKeys::generate);
        let signed = keys.signed_public(&self.identity);
        self.advance(HandshakeState::EphemeralKeyGenerated);
        signed
    }

    pub fn mark_username_shared(&mut self) {
        self.advance(HandshakeState::UsernameShared);
    }

    pub fn mark_key_shared(&mut self) {
        self.advance(HandshakeState::KeyShared);
    }

    /// Records the peer's verified keys.
    pub fn set_peer(&mut self, peer: PeerIdentity, peer_public: X25519PublicKey) {
        self.peer = Some(peer);
        self.peer_public = Some(peer_public);
        self.advance(self.state);
    }

    fn keys(&self) -> Result<(&EphemeralKeys, &PeerIdentity, &X25519PublicKey)> {
        if !self.is_established() {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        match (&self.local, &self.peer, &self.peer_public) {
            (Some(local), Some(peer), Some(public)) => Ok((local, peer, public)),
            _ => Err(ProtocolError::HandshakeIncomplete),
        }
    }

    /// Encrypts and signs a payload for the peer.
    pub fn seal(&self, payload: &Payload) -> Result<Vec<u8>> {
        let (local, _, peer_public) = self.keys()?;
        envelope::encrypt(&self.identity, peer_public, local.secret(), payload)
    }

    /// Verifies and decrypts a payload from the peer.
    pub fn open(&self, data: &[u8], packed: bool) -> Result<Payload> {
        let (local, peer, peer_public) = self.keys()?;
        envelope::decrypt(peer, peer_public, local.secret(), data, packed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer.as_ref().map(PeerIdentity::fingerprint))
            .finish()
    }
}
