//! A framed, encrypted conversation over one byte stream.
//!
//! The same type serves both roles. Clients complete the handshake lazily on
//! their first read or write; servers drive each step explicitly so they can
//! consult their user directory in between.
//!
//! ## Wire sequence
//!
//! ```text
//! client                                   server
//!   │ ── [real user: 28] ─────────────────▶ │
//!   │ ── [signed ephemeral key: 96] ──────▶ │
//!   │ ◀───────── [signed ephemeral key: 96] │
//!   │ ── [envelope(headers)] ─────────────▶ │
//!   │ ── [envelope(body)] ────────────────▶ │
//!   │ ◀────────────── [envelope(headers)]── │
//!   │ ◀────────────── [envelope(body)] ──── │
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::{
    open_signed_key, NodeIdentity, PeerIdentity, RealUser, REAL_USER_LENGTH, SIGNED_KEY_LENGTH,
};
use crate::envelope::Payload;
use crate::error::{ProtocolError, Result};
use crate::framing::{
    FrameCodec, FramedStream, DEFAULT_DELIMITER, MAX_FRAME_SIZE, MAX_HEADERS_SIZE, READ_CHUNK_SIZE,
};
use crate::headers::Headers;
use crate::request::keys;
use crate::session::{HandshakeState, Role, Session};

/// Default receive timeout (seconds).
pub const RECV_TIMEOUT_SECS: u64 = 120;

/// Sizes, limits and timeouts of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireConfig {
    pub delimiter: Vec<u8>,
    pub read_chunk_size: usize,
    /// Maximum size of a header envelope.
    pub headers_max: usize,
    /// Maximum size of a body envelope.
    pub body_max: usize,
    /// Exact size of the real user frame.
    pub user_length: usize,
    /// Exact size of the signed ephemeral key frame.
    pub public_key_length: usize,
    /// `None` waits forever.
    pub recv_timeout: Option<Duration>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_vec(),
            read_chunk_size: READ_CHUNK_SIZE,
            headers_max: MAX_HEADERS_SIZE,
            body_max: MAX_FRAME_SIZE,
            user_length: REAL_USER_LENGTH,
            public_key_length: SIGNED_KEY_LENGTH,
            recv_timeout: Some(Duration::from_secs(RECV_TIMEOUT_SECS)),
        }
    }
}

/// One side of an encrypted conversation.
pub struct Connection<S> {
    stream: FramedStream<S>,
    session: Session,
    config: WireConfig,
    real_user: Option<RealUser>,
    server_key: Option<PeerIdentity>,
    username_shared: bool,
    key_shared: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, role: Role, identity: Arc<NodeIdentity>, config: WireConfig) -> Self {
        let codec = FrameCodec::new(&config.delimiter);
        Self {
            stream: FramedStream::with_codec(stream, codec, config.read_chunk_size),
            session: Session::new(role, identity),
            config,
            real_user: None,
            server_key: None,
            username_shared: false,
            key_shared: false,
        }
    }

    /// Client side: `identity` is the user's key, `server_key` the node it expects to reach.
    pub fn client(
        stream: S,
        identity: Arc<NodeIdentity>,
        username: &str,
        server_key: PeerIdentity,
        config: WireConfig,
    ) -> Self {
        let mut conn = Self::new(stream, Role::Client, identity, config);
        conn.real_user = Some(RealUser::from_username(username));
        conn.server_key = Some(server_key);
        conn.session.generate_keys(false);
        conn
    }

    /// Server side of an accepted stream.
    pub fn server(stream: S, identity: Arc<NodeIdentity>, config: WireConfig) -> Self {
        Self::new(stream, Role::Server, identity, config)
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn state(&self) -> HandshakeState {
        self.session.state()
    }

    pub fn config(&self) -> &WireConfig {
        &self.config
    }

    /// The connecting user's identifier (own on the client, peer's on the server).
    pub fn real_user(&self) -> Option<&RealUser> {
        self.real_user.as_ref()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    async fn read_exact_frame(&mut self, expected: usize, what: &str) -> Result<Vec<u8>> {
        let frame = self
            .stream
            .read_frame(expected, self.config.recv_timeout)
            .await?;
        if frame.len() != expected {
            return Err(ProtocolError::HandshakeFailed(format!(
                "{} must be {} bytes, got {}",
                what,
                expected,
                frame.len()
            )));
        }
        Ok(frame)
    }

    // Handshake steps

    /// Sends the real user identifier. Later calls do nothing.
    pub async fn share_username(&mut self) -> Result<()> {
        if self.username_shared {
            return Ok(());
        }
        let real_user = self
            .real_user
            .ok_or_else(|| ProtocolError::HandshakeFailed("no username configured".to_string()))?;
        self.stream.write_frame(real_user.as_bytes()).await?;
        self.username_shared = true;
        self.session.mark_username_shared();
        Ok(())
    }

    /// Sends the signed local ephemeral key, generating it if needed. Later calls do nothing.
    pub async fn share_key(&mut self) -> Result<()> {
        if self.key_shared {
            return Ok(());
        }
        let signed = self.session.signed_local_key();
        self.stream.write_frame(&signed).await?;
        self.key_shared = true;
        self.session.mark_key_shared();
        Ok(())
    }

    /// Server: reads the client's real user identifier.
    pub async fn read_real_user(&mut self) -> Result<RealUser> {
        let frame = self
            .read_exact_frame(self.config.user_length, "real user")
            .await?;
        let real_user = RealUser::from_slice(&frame)?;
        self.real_user = Some(real_user);
        Ok(real_user)
    }

    /// Reads the peer's signed ephemeral key and verifies it against `peer`.
    pub async fn read_peer_key(&mut self, peer: PeerIdentity) -> Result<()> {
        let frame = self
            .read_exact_frame(self.config.public_key_length, "signed key")
            .await?;
        let peer_public = open_signed_key(&peer, &frame)?;
        self.session.set_peer(peer, peer_public);
        Ok(())
    }

    /// Client: runs whatever handshake steps are still outstanding.
    pub async fn complete_handshake(&mut self) -> Result<()> {
        if self.session.role() != Role::Client || self.session.is_established() {
            return Ok(());
        }
        self.share_username().await?;
        self.share_key().await?;
        let server_key = self
            .server_key
            .ok_or_else(|| ProtocolError::HandshakeFailed("no server key configured".to_string()))?;
        self.read_peer_key(server_key).await
    }

    // Steady state

    /// Sends headers and body as two envelopes.
    pub async fn write_message(&mut self, headers: &Headers, body: &Payload) -> Result<()> {
        self.complete_handshake().await?;
        let sealed_headers = self.session.seal(&Payload::Packed(headers.to_value()))?;
        let sealed_body = self.session.seal(body)?;
        self.stream.write_frame(&sealed_headers).await?;
        self.stream.write_frame(&sealed_body).await
    }

    /// Receives headers and body.
    ///
    /// The body's packing follows the `is_packed` header, or `default_packed` without one.
    /// A body that verifies but does not unpack yields [`ProtocolError::MalformedBody`]
    /// after both frames were consumed, so the conversation can go on.
    pub async fn read_message(&mut self, default_packed: bool) -> Result<(Headers, Payload)> {
        self.complete_handshake().await?;
        let frame = self
            .stream
            .read_frame(self.config.headers_max, self.config.recv_timeout)
            .await?;
        let headers = match self.session.open(&frame, true)? {
            Payload::Packed(value) => Headers::from_value(value)?,
            Payload::Raw(_) => {
                return Err(ProtocolError::Deserialization(
                    "headers must be packed".to_string(),
                ))
            }
        };
        let packed = headers
            .get_bool(keys::IS_PACKED)
            .unwrap_or(default_packed);

        let frame = self
            .stream
            .read_frame(self.config.body_max, self.config.recv_timeout)
            .await?;
        let body = match self.session.open(&frame, false)? {
            Payload::Raw(bytes) if packed => Payload::from_bytes(bytes, true)
                .map_err(|err| ProtocolError::MalformedBody(err.to_string()))?,
            body => body,
        };
        Ok((headers, body))
    }

    /// Closes the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("real_user", &self.real_user)
            .finish()
    }
}
