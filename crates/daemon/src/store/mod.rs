//! User, token and network records consulted while serving requests.
//!
//! The dispatcher only sees the [`Store`] trait. Two backends exist:
//! [`MemoryStore`] for tests and throwaway nodes, and [`SqliteStore`] backed
//! by a small pool of SQLite connections.

mod memory;
mod sqlite;

use async_trait::async_trait;
use protocol::{status, RealUser};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Length in bytes of issued tokens before hex encoding.
pub const TOKEN_BYTES: usize = 32;

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),

    /// The connection pool was shut down.
    #[error("store pool is closed")]
    PoolClosed,

    /// Referenced record does not exist.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Record already exists.
    #[error("{kind} already exists: {key}")]
    Duplicate { kind: &'static str, key: String },

    /// The user already holds as many tokens as allowed.
    #[error("token limit of {limit} reached for user {userid}")]
    TokenLimit { userid: i64, limit: i64 },

    /// Invalid path for the database file.
    #[error("invalid database path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    /// Status code reported to the peer.
    pub fn status_code(&self) -> i64 {
        match self {
            StoreError::TokenLimit { .. } => status::ETOKLIMIT,
            _ => status::ESERVER,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A peer node able to serve some services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: i64,
    pub address: String,
    pub port: u16,
}

impl NetworkRecord {
    /// `address:port` form used to connect.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Lookups required while authenticating and routing requests.
///
/// Tokens are always addressed by their hash, never by the bearer value.
#[async_trait]
pub trait Store: Send + Sync {
    /// Username whose digest is `real_user`.
    async fn hash2user(&self, real_user: &RealUser) -> StoreResult<Option<String>>;

    /// Numeric id of `username`.
    async fn extract_userid(&self, username: &str) -> StoreResult<Option<i64>>;

    /// Whether the user is flagged as a guest. Unknown users count as guests.
    async fn is_guest_user(&self, userid: i64) -> StoreResult<bool>;

    async fn token_exists(&self, token_hash: &str) -> StoreResult<bool>;

    /// Whether the token is past its expiry. Tokens without expiry never expire.
    async fn is_expired(&self, token_hash: &str) -> StoreResult<bool>;

    async fn delete_token(&self, token_hash: &str) -> StoreResult<()>;

    /// Regular expression of the services a token may reach.
    async fn get_services_allowed(&self, token_hash: &str) -> StoreResult<Option<String>>;

    /// Ids of the networks serving `service`, best priority first.
    async fn service2id(&self, service: &str) -> StoreResult<Vec<i64>>;

    async fn id2network(&self, networkid: i64) -> StoreResult<Option<NetworkRecord>>;

    /// Id of the network registered at `address:port`.
    async fn extract_networkid(&self, address: &str, port: u16) -> StoreResult<Option<i64>>;

    /// Token this node presents to the network.
    async fn get_network_token(&self, networkid: i64) -> StoreResult<Option<String>>;
}

/// Generates a fresh bearer token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current time as a unix timestamp.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_hash() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(protocol::token_hash(&token).is_ok());
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_network_endpoint() {
        let network = NetworkRecord {
            id: 1,
            address: "10.0.0.2".to_string(),
            port: 17000,
        };
        assert_eq!(network.endpoint(), "10.0.0.2:17000");
    }
}
