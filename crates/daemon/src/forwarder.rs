//! Relays requests for services this node does not host.
//!
//! Candidate nodes come from the store: the forced node when the client pinned
//! one, otherwise every network serving the first path segment, best priority
//! first. The first node that answers wins. Bodies travel hybrid sealed to the
//! target node's long-term key.

use std::sync::Arc;

use protocol::request::keys;
use protocol::{
    Client, ClientConfig, NodeIdentity, Payload, ProtocolError, Request, RequestHeaders, Response,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto_pool::CryptoPool;
use crate::keys::KeyDirectory;
use crate::services::sanitize_path;
use crate::store::{NetworkRecord, Store, StoreError};

/// Errors raised while forwarding.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No node could serve the request.
    #[error("service unreachable: {0}")]
    Unreachable(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outbound side of the node: talks to peer nodes as this node's identity.
pub struct Forwarder {
    identity: Arc<NodeIdentity>,
    keys: KeyDirectory,
    store: Arc<dyn Store>,
    client: ClientConfig,
    username: String,
    crypto: CryptoPool,
}

impl Forwarder {
    pub fn new(
        identity: Arc<NodeIdentity>,
        keys: KeyDirectory,
        store: Arc<dyn Store>,
        client: ClientConfig,
        username: impl Into<String>,
        crypto: CryptoPool,
    ) -> Self {
        Self {
            identity,
            keys,
            store,
            client,
            username: username.into(),
            crypto,
        }
    }

    /// Sends `request` to the first node able to serve it and returns its reply.
    pub async fn forward(
        &self,
        request: &Request,
        body: &Payload,
    ) -> Result<Response, ForwardError> {
        let targets = self.targets(&request.headers).await?;
        if targets.is_empty() {
            return Err(ForwardError::Unreachable(format!(
                "no network serves {}",
                request.headers.path()
            )));
        }

        for network in &targets {
            match self.forward_to(network, &request.headers, body).await {
                Ok(response) => {
                    info!(
                        path = %request.headers.path(),
                        network = %network.endpoint(),
                        status = response.status_code(),
                        "request forwarded"
                    );
                    return Ok(response);
                }
                Err(err) => warn!(
                    network = %network.endpoint(),
                    error = %err,
                    "forwarding attempt failed"
                ),
            }
        }

        Err(ForwardError::Unreachable(format!(
            "{} node(s) tried for {}",
            targets.len(),
            request.headers.path()
        )))
    }

    async fn targets(&self, headers: &RequestHeaders) -> Result<Vec<NetworkRecord>, ForwardError> {
        if headers.force() {
            if let Some(node) = headers.node() {
                let network = match self.store.extract_networkid(&node.address, node.port).await? {
                    Some(id) => self.store.id2network(id).await?,
                    None => None,
                };
                return network.map(|n| vec![n]).ok_or_else(|| {
                    ForwardError::Unreachable(format!("{node} is not part of the network"))
                });
            }
        }

        let path = sanitize_path(headers.path());
        let Some(service) = path.split('/').next().filter(|s| !s.is_empty()) else {
            return Ok(Vec::new());
        };

        let mut networks = Vec::new();
        for id in self.store.service2id(service).await? {
            match self.store.id2network(id).await? {
                Some(network) => networks.push(network),
                None => debug!(networkid = id, service, "route points to a missing network"),
            }
        }
        Ok(networks)
    }

    async fn forward_to(
        &self,
        network: &NetworkRecord,
        original: &RequestHeaders,
        body: &Payload,
    ) -> Result<Response, ForwardError> {
        let endpoint = network.endpoint();
        let server_key = self.keys.load_server_key(&endpoint).await?;

        let mut outgoing = original.clone();
        outgoing.set_token(self.store.get_network_token(network.id).await?)?;
        outgoing.set_force(false);
        outgoing.set_node(None);

        let sealed = self
            .crypto
            .seal(self.identity.clone(), server_key, body.clone())
            .await?;
        let mut headers = outgoing.to_headers();
        headers.set(keys::IS_PACKED, false);
        headers.set(keys::HYBRID, body.is_packed());

        let mut client = Client::connect(
            &endpoint,
            self.identity.clone(),
            &self.username,
            server_key,
            &self.client,
        )
        .await?;
        client.set_request(outgoing);

        let result = match client.send_headers(&headers, &Payload::Raw(sealed)).await {
            Ok(()) => client.receive().await,
            Err(err) => Err(err),
        };
        if let Err(err) = client.close().await {
            debug!(network = %endpoint, error = %err, "closing forwarded connection failed");
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Node;
    use tempfile::TempDir;

    use crate::store::MemoryStore;

    fn forwarder(store: Arc<MemoryStore>, dir: &TempDir) -> Forwarder {
        Forwarder::new(
            Arc::new(NodeIdentity::generate()),
            KeyDirectory::new(dir.path().join("pubkeys"), dir.path().join("servkeys")),
            store,
            ClientConfig::default(),
            "node-a",
            CryptoPool::new(1),
        )
    }

    fn request(headers: RequestHeaders) -> Request {
        crate::testing::request(headers, Some(1), false)
    }

    #[tokio::test]
    async fn test_no_route_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let forwarder = forwarder(Arc::new(MemoryStore::new()), &dir);
        let err = forwarder
            .forward(&request(RequestHeaders::new("/files", "list")), &Payload::null())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_targets_follow_priority() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let slow = store.add_network("10.0.0.2", 17000, None).await.unwrap();
        let fast = store.add_network("10.0.0.3", 17000, None).await.unwrap();
        store.add_service_route("files", slow, 5).await.unwrap();
        store.add_service_route("files", fast, 1).await.unwrap();
        let forwarder = forwarder(store, &dir);

        let targets = forwarder
            .targets(&RequestHeaders::new("/files/photos", "list"))
            .await
            .unwrap();
        let ids: Vec<i64> = targets.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![fast, slow]);
    }

    #[tokio::test]
    async fn test_forced_node_must_be_known() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let known = store.add_network("10.0.0.2", 17000, None).await.unwrap();
        let forwarder = forwarder(store, &dir);

        let mut headers = RequestHeaders::new("/files", "list");
        headers.set_force(true);
        headers.set_node(Some(Node::new("10.0.0.9", 17000).unwrap()));
        let err = forwarder.targets(&headers).await.unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable(_)));

        headers.set_node(Some(Node::new("10.0.0.2", 17000).unwrap()));
        let targets = forwarder.targets(&headers).await.unwrap();
        assert_eq!(targets[0].id, known);
    }

    #[tokio::test]
    async fn test_missing_server_key_skips_network() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let id = store.add_network("127.0.0.1", 1, None).await.unwrap();
        store.add_service_route("files", id, 0).await.unwrap();
        let forwarder = forwarder(store, &dir);

        let err = forwarder
            .forward(&request(RequestHeaders::new("/files", "list")), &Payload::null())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable(_)));
    }
}
