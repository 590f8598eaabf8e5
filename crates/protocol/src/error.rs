//! Error types for the protocol crate.

use thiserror::Error;

use crate::headers::HeaderError;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed (authentication tag mismatch or truncated box).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// No verification key is on file for the peer.
    #[error("public key not found: {path}")]
    PublicKeyNotFound {
        /// Location that was searched.
        path: String,
    },

    // Handshake errors
    /// The identity exchange could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to seal or open an envelope before the session was established.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame trailer did not match the configured delimiter.
    #[error("invalid frame delimiter: expected {expected:?}, got {got:?}")]
    InvalidDelimiter {
        /// Expected delimiter bytes.
        expected: Vec<u8>,
        /// Bytes actually found after the payload.
        got: Vec<u8>,
    },

    // Request errors
    /// A request arrived without one of its routing fields.
    #[error("missing request field: {0}")]
    MissingRoute(&'static str),

    /// A header failed validation.
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// An authentic body that does not unpack into a structured value.
    #[error("malformed body: {0}")]
    MalformedBody(String),

    // Connection errors
    /// Connection was closed by the peer.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Returns true when the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed(_))
    }

    /// Returns true when only the current request failed and the stream is still in sync.
    pub fn is_request_error(&self) -> bool {
        matches!(self, ProtocolError::MalformedBody(_))
    }

    /// Returns true for failures caused by the peer or the network rather than by this node.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidSignature(_)
                | ProtocolError::Decryption(_)
                | ProtocolError::PublicKeyNotFound { .. }
                | ProtocolError::Timeout(_)
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::InvalidDelimiter { .. }
                | ProtocolError::HandshakeFailed(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProtocolError::Timeout(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_signature_error_display() {
        let err = ProtocolError::InvalidSignature("signature verification failed".to_string());
        assert_eq!(
            err.to_string(),
            "invalid signature: signature verification failed"
        );
    }

    #[test]
    fn test_public_key_not_found_display() {
        let err = ProtocolError::PublicKeyNotFound {
            path: "data/pubkeys/abcd".to_string(),
        };
        assert_eq!(err.to_string(), "public key not found: data/pubkeys/abcd");
    }

    #[test]
    fn test_handshake_incomplete_error_display() {
        let err = ProtocolError::HandshakeIncomplete;
        assert_eq!(
            err.to_string(),
            "handshake incomplete: cannot perform operation before handshake is finished"
        );
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_missing_route_display() {
        let err = ProtocolError::MissingRoute("action");
        assert_eq!(err.to_string(), "missing request field: action");
    }

    #[test]
    fn test_header_error_is_transparent() {
        let err: ProtocolError = HeaderError::Type {
            key: "force".to_string(),
            expected: "bool".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "header 'force' must be of type bool");
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(protocol_err.is_disconnect());
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_operational_classification() {
        assert!(ProtocolError::InvalidSignature("x".into()).is_operational());
        assert!(ProtocolError::Timeout("x".into()).is_operational());
        assert!(!ProtocolError::HandshakeIncomplete.is_operational());
        assert!(!ProtocolError::ConnectionClosed("x".into()).is_operational());
        assert!(ProtocolError::MalformedBody("x".into()).is_request_error());
        assert!(!ProtocolError::Decryption("x".into()).is_request_error());
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
