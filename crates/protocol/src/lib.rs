//! # Meshgate Protocol Library
//!
//! Wire protocol shared by meshgate nodes and their clients.
//!
//! ## Overview
//!
//! - **Identities**: Ed25519 long-term keys, per-connection X25519 keys, real user digests
//! - **Envelopes**: signed XChaCha20-Poly1305 boxes, plus hybrid AES-GCM for node-to-node payloads
//! - **Framing**: length-prefixed, delimiter-terminated frames with size limits and timeouts
//! - **Headers**: typed request/response metadata and the routing fields of a request
//! - **Connections**: the handshake state machine for both roles, and an outbound client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Headers + Body (MessagePack)      │  headers always packed
//! ├─────────────────────────────────────────┤
//! │        Envelope (sign + encrypt)        │  Ed25519, X25519, XChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │                Framing                  │  u32 length, payload, "\r\n\r\n"
//! ├─────────────────────────────────────────┤
//! │                  TCP                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameCodec, NodeIdentity, RealUser};
//!
//! let identity = NodeIdentity::generate();
//! println!("node fingerprint: {}", identity.fingerprint());
//!
//! let user = RealUser::from_username("alice");
//! let codec = FrameCodec::default();
//! let frame = codec.encode(user.as_bytes()).unwrap();
//! let (payload, _) = codec.decode(&frame, 28).unwrap();
//! assert_eq!(payload, user.as_bytes());
//! ```

pub mod client;
pub mod connection;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod headers;
pub mod hybrid;
pub mod request;
pub mod session;
pub mod status;

pub use client::{connect_with_retry, Client, ClientConfig, Response};
pub use connection::{Connection, WireConfig};
pub use crypto::{
    name_digest, token_hash, EphemeralKeys, NodeIdentity, PeerIdentity, RealUser, Signature,
    KEY_LENGTH, REAL_USER_LENGTH, SIGNED_KEY_LENGTH,
};
pub use envelope::{decrypt, encrypt, Payload, ENVELOPE_OVERHEAD};
pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, FramedStream, DEFAULT_DELIMITER, MAX_FRAME_SIZE, MAX_HEADERS_SIZE};
pub use headers::{Expect, HeaderError, Headers, StrDict, ValueKind};
pub use hybrid::{open_hybrid, seal_hybrid};
pub use request::{Node, Request, RequestHeaders};
pub use session::{HandshakeState, Role, Session};
