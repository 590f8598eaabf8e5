//! Key files on disk.
//!
//! Every key file holds a raw 32-byte Ed25519 key. Verification keys of users
//! live under `<init_path>/<user_data>/<hex real user>`, those of peer nodes
//! under `<init_path>/<server_data>/<sha3-224 of address:port>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{name_digest, NodeIdentity, PeerIdentity, ProtocolError, RealUser};
use tracing::info;

use crate::config::Config;

/// Directory of verification keys for users and peer nodes.
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    user_dir: PathBuf,
    server_dir: PathBuf,
}

impl KeyDirectory {
    pub fn new(user_dir: impl Into<PathBuf>, server_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_dir: user_dir.into(),
            server_dir: server_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.user_keys_dir(), config.server_keys_dir())
    }

    pub fn user_key_path(&self, real_user: &RealUser) -> PathBuf {
        self.user_dir.join(real_user.to_hex())
    }

    pub fn server_key_path(&self, endpoint: &str) -> PathBuf {
        self.server_dir.join(name_digest(endpoint))
    }

    /// Verification key of the user behind `real_user`.
    pub async fn load_user_key(&self, real_user: &RealUser) -> protocol::Result<PeerIdentity> {
        load_peer_key(&self.user_key_path(real_user)).await
    }

    /// Verification key of the node at `endpoint`.
    pub async fn load_server_key(&self, endpoint: &str) -> protocol::Result<PeerIdentity> {
        load_peer_key(&self.server_key_path(endpoint)).await
    }

    /// Stores `key` as the verification key of `username`.
    pub async fn install_user_key(&self, username: &str, key: &PeerIdentity) -> Result<PathBuf> {
        let path = self.user_key_path(&RealUser::from_username(username));
        write_key(&path, &key.public_key_bytes()).await?;
        Ok(path)
    }

    /// Stores `key` as the verification key of the node at `endpoint`.
    pub async fn install_server_key(&self, endpoint: &str, key: &PeerIdentity) -> Result<PathBuf> {
        let path = self.server_key_path(endpoint);
        write_key(&path, &key.public_key_bytes()).await?;
        Ok(path)
    }
}

async fn load_peer_key(path: &Path) -> protocol::Result<PeerIdentity> {
    match tokio::fs::read(path).await {
        Ok(bytes) => PeerIdentity::from_slice(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ProtocolError::PublicKeyNotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => Err(ProtocolError::InvalidPublicKey(format!(
            "{}: {}",
            path.display(),
            e
        ))),
    }
}

async fn write_key(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write key file: {}", path.display()))
}

/// Reads a raw 32-byte key file.
pub fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    if bytes.len() != 32 {
        anyhow::bail!(
            "Invalid key file {}: expected 32 bytes, got {}",
            path.display(),
            bytes.len()
        );
    }
    Ok(bytes)
}

/// Loads the node identity, generating and saving a new one when absent.
///
/// The public half is (re)written next to it so it can be handed to peers.
pub fn load_or_generate_identity(private_key: &Path, public_key: &Path) -> Result<NodeIdentity> {
    let identity = if private_key.exists() {
        let bytes = read_key_file(private_key)?;
        NodeIdentity::from_secret_slice(&bytes)
            .with_context(|| format!("Invalid identity file: {}", private_key.display()))?
    } else {
        let identity = NodeIdentity::generate();
        save_key_file(private_key, &identity.secret_key_bytes())?;
        info!("Generated new node identity and saved to {:?}", private_key);
        identity
    };

    if !public_key.exists() {
        save_key_file(public_key, &identity.public_key_bytes())?;
    }
    Ok(identity)
}

/// Writes a key file, creating parent directories.
pub fn save_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, bytes)
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.extension().is_some_and(|ext| ext == "priv") {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions: {}", path.display()))?;
        }
    }
    Ok(())
}
