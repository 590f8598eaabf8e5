//! Bounded worker pool for hybrid encryption.

use std::sync::Arc;

use protocol::{open_hybrid, seal_hybrid, NodeIdentity, Payload, PeerIdentity, ProtocolError};
use tokio::sync::Semaphore;

/// Runs hybrid seal/open on the blocking pool, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl CryptoPool {
    /// A pool of `workers` slots. Zero uses every core.
    pub fn new(workers: usize) -> Self {
        let workers = match workers {
            0 => num_cpus::get().max(1),
            n => n,
        };
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    async fn run<T, F>(&self, job: F) -> protocol::Result<T>
    where
        F: FnOnce() -> protocol::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProtocolError::Encryption("crypto pool is closed".to_string()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| ProtocolError::Encryption(format!("crypto worker failed: {e}")))?
    }

    /// Seals `payload` for `recipient`.
    pub async fn seal(
        &self,
        sender: Arc<NodeIdentity>,
        recipient: PeerIdentity,
        payload: Payload,
    ) -> protocol::Result<Vec<u8>> {
        self.run(move || seal_hybrid(&sender, &recipient, &payload))
            .await
    }

    /// Opens a hybrid message sent by `sender`.
    pub async fn open(
        &self,
        recipient: Arc<NodeIdentity>,
        sender: PeerIdentity,
        data: Vec<u8>,
        packed: bool,
    ) -> protocol::Result<Payload> {
        self.run(move || open_hybrid(&recipient, &sender, &data, packed))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zero_workers_uses_every_core() {
        assert_eq!(CryptoPool::new(0).workers(), num_cpus::get().max(1));
        assert_eq!(CryptoPool::new(2).workers(), 2);
    }

    #[tokio::test]
    async fn test_seal_then_open_on_pool() {
        let pool = CryptoPool::new(1);
        let sender = Arc::new(NodeIdentity::generate());
        let recipient = Arc::new(NodeIdentity::generate());

        let sealed = pool
            .seal(
                sender.clone(),
                recipient.to_peer_identity(),
                Payload::from(json!({"n": 1})),
            )
            .await
            .unwrap();
        let opened = pool
            .open(recipient, sender.to_peer_identity(), sealed, true)
            .await
            .unwrap();
        assert_eq!(opened, Payload::from(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_open_rejects_wrong_sender() {
        let pool = CryptoPool::new(1);
        let sender = Arc::new(NodeIdentity::generate());
        let recipient = Arc::new(NodeIdentity::generate());
        let impostor = NodeIdentity::generate();

        let sealed = pool
            .seal(sender, recipient.to_peer_identity(), Payload::Raw(vec![1, 2, 3]))
            .await
            .unwrap();
        let err = pool
            .open(recipient, impostor.to_peer_identity(), sealed, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)));
    }
}
