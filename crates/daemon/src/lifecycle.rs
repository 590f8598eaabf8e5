//! One accepted connection from handshake to teardown.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{Connection, NodeIdentity, ProtocolError, WireConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::Config;
use crate::crypto_pool::CryptoPool;
use crate::dispatcher::{Dispatcher, PeerContext};
use crate::forwarder::Forwarder;
use crate::keys::KeyDirectory;
use crate::services::ServiceRegistry;
use crate::store::{Store, StoreError};
use crate::templates::{TemplateFields, Templates};

/// Why a connection ended.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ConnectionError {
    /// The peer simply hung up.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectionError::Protocol(err) if err.is_disconnect())
    }

    /// Caused by the peer or the network rather than by this node.
    pub fn is_operational(&self) -> bool {
        matches!(self, ConnectionError::Protocol(err) if err.is_operational())
    }
}

/// Everything a connection task needs, shared by all connections.
pub struct NodeContext {
    pub config: Arc<Config>,
    pub identity: Arc<NodeIdentity>,
    pub keys: KeyDirectory,
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub wire: WireConfig,
}

impl NodeContext {
    /// Wires the forwarder, crypto pool and dispatcher from `config`.
    pub fn new(
        config: Config,
        identity: Arc<NodeIdentity>,
        store: Arc<dyn Store>,
        registry: ServiceRegistry,
    ) -> Self {
        let keys = KeyDirectory::from_config(&config);
        let crypto = CryptoPool::new(config.crypto.workers);
        debug!(workers = crypto.workers(), "crypto pool ready");
        let forwarder = Arc::new(Forwarder::new(
            identity.clone(),
            keys.clone(),
            store.clone(),
            config.client_config(),
            config.client.username.clone(),
            crypto.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            store.clone(),
            forwarder,
            identity.clone(),
            crypto,
        )
        .with_strict_token_scope(config.security.strict_token_scope);

        Self {
            wire: config.wire_config(),
            config: Arc::new(config),
            identity,
            keys,
            store,
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Serves `stream` until the peer leaves, an error occurs or `shutdown` fires.
///
/// Returns `Ok` for a clean close. Procedure scopes are torn down and the
/// stream is shut down in every case.
pub async fn serve_connection<S>(
    stream: S,
    address: Option<SocketAddr>,
    context: Arc<NodeContext>,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let span = tracing::info_span!("session", id = %uuid::Uuid::new_v4(), peer = ?address);
    async move {
        let templates = Templates::new(context.config.templates.clone());
        info!(
            "{}",
            templates.preface(&TemplateFields {
                address,
                ..TemplateFields::default()
            })
        );

        let mut conn = Connection::server(stream, context.identity.clone(), context.wire.clone());
        let mut peer: Option<PeerContext> = None;

        let result = tokio::select! {
            result = run(&mut conn, &context, address, &templates, &mut peer) => result,
            _ = shutdown.cancelled() => {
                debug!("node shutting down, closing session");
                Ok(())
            }
        };
        let result = match result {
            Err(err) if err.is_disconnect() => Ok(()),
            other => other,
        };

        let end = templates.end(&TemplateFields {
            address,
            username: peer.as_ref().map(|p| p.username.as_str()),
            userid: peer.as_ref().and_then(|p| p.userid),
            real_user: peer.as_ref().map(|p| &p.real_user),
            request: None,
        });
        match &result {
            Ok(()) => info!("{}", end),
            Err(err) if err.is_operational() => warn!(error = %err, "{}", end),
            Err(err) => error!(error = %err, "{}", end),
        }

        if let Err(err) = conn.shutdown().await {
            debug!(error = %err, "stream shutdown failed");
        }
        if let Some(peer) = peer.as_mut() {
            peer.teardown().await;
        }
        result
    }
    .instrument(span)
    .await
}

async fn run<S>(
    conn: &mut Connection<S>,
    context: &NodeContext,
    address: Option<SocketAddr>,
    templates: &Templates,
    slot: &mut Option<PeerContext>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer = slot.insert(handshake(conn, context, address).await?);
    debug!(username = %peer.username, guest = peer.is_guest, "handshake complete");

    loop {
        let outcome = match conn.read_message(true).await {
            Ok((headers, body)) => context.dispatcher.dispatch(peer, headers, body).await,
            Err(err) if err.is_request_error() => {
                debug!(error = %err, "request body could not be unpacked");
                context.dispatcher.malformed_body(&err)
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(request) = &outcome.request {
            info!(
                "{}",
                templates.intro(&TemplateFields {
                    address,
                    request: Some(request),
                    username: Some(&peer.username),
                    userid: peer.userid,
                    real_user: Some(&peer.real_user),
                })
            );
        }

        conn.write_message(&outcome.headers, &outcome.body).await?;
        if outcome.close {
            debug!("request could not be routed, closing session");
            return Ok(());
        }
    }
}

/// Server side of the identity exchange.
async fn handshake<S>(
    conn: &mut Connection<S>,
    context: &NodeContext,
    address: Option<SocketAddr>,
) -> Result<PeerContext, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let real_user = conn.read_real_user().await?;
    let username = context.store.hash2user(&real_user).await?;
    let userid = match username.as_deref() {
        Some(name) => context.store.extract_userid(name).await?,
        None => None,
    };

    let key = context.keys.load_user_key(&real_user).await?;
    conn.read_peer_key(key).await?;
    conn.share_key().await?;

    let is_guest = match userid {
        Some(id) => context.store.is_guest_user(id).await?,
        None => true,
    };
    Ok(PeerContext::new(
        real_user,
        username.unwrap_or_default(),
        userid,
        is_guest,
        address,
        key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use protocol::status;
    use protocol::{Payload, RequestHeaders, StrDict};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use crate::controller::Controller;
    use crate::services::{self, Capabilities, Methods, Service, ServiceError};
    use crate::store::MemoryStore;

    struct Node {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        context: Arc<NodeContext>,
    }

    fn node() -> Node {
        node_with(None, |_| {})
    }

    /// A node with the built-in services plus whatever `extend` registers.
    fn node_with(recv_timeout: Option<Duration>, extend: impl FnOnce(&ServiceRegistry)) -> Node {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();
        let registry = services::builtin(&config.server.index_name, &config.server.admin_service)
            .unwrap();
        extend(&registry);
        let store = Arc::new(MemoryStore::new());
        let mut context = NodeContext::new(
            config,
            Arc::new(NodeIdentity::generate()),
            store.clone(),
            registry,
        );
        if recv_timeout.is_some() {
            context.wire.recv_timeout = recv_timeout;
        }
        Node {
            _dir: dir,
            store,
            context: Arc::new(context),
        }
    }

    async fn install_user(node: &Node, username: &str) -> Arc<NodeIdentity> {
        let identity = Arc::new(NodeIdentity::generate());
        node.context
            .keys
            .install_user_key(username, &identity.to_peer_identity())
            .await
            .unwrap();
        identity
    }

    fn client(
        stream: tokio::io::DuplexStream,
        node: &Node,
        username: &str,
        identity: Arc<NodeIdentity>,
    ) -> Connection<tokio::io::DuplexStream> {
        Connection::client(
            stream,
            identity,
            username,
            node.context.identity.to_peer_identity(),
            WireConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_unknown_user_is_served_as_guest() {
        let node = node();
        let identity = install_user(&node, "visitor").await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(
            server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));

        let mut conn = client(client_io, &node, "visitor", identity);
        let request = RequestHeaders::new("/echo", "status");
        conn.write_message(&request.to_headers(), &Payload::null())
            .await
            .unwrap();
        let (headers, body) = conn.read_message(true).await.unwrap();
        assert_eq!(headers.status_code(), status::OK);
        assert_eq!(body.as_value()["guest"], json!(true));

        conn.shutdown().await.unwrap();
        drop(conn);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_missing_public_key_ends_session() {
        let node = node();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(
            server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));

        let mut conn = client(client_io, &node, "stranger", Arc::new(NodeIdentity::generate()));
        let request = RequestHeaders::new("/echo", "ping");
        // The server gives up before answering, so the write may or may not land.
        let _ = conn.write_message(&request.to_headers(), &Payload::null()).await;

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::PublicKeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_signing_key_is_rejected() {
        let node = node();
        install_user(&node, "alice").await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(
            server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));

        let impostor = Arc::new(NodeIdentity::generate());
        let mut conn = client(client_io, &node, "alice", impostor);
        let _ = conn
            .write_message(&RequestHeaders::new("/echo", "ping").to_headers(), &Payload::null())
            .await;

        let err = server.await.unwrap().unwrap_err();
        assert!(err.is_operational());
    }

    #[tokio::test]
    async fn test_missing_action_closes_after_reply() {
        let node = node();
        node.store.add_user("alice", false).await.unwrap();
        let identity = install_user(&node, "alice").await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(
            server_io,
            "127.0.0.1:50000".parse().ok(),
            node.context.clone(),
            CancellationToken::new(),
        ));

        let mut conn = client(client_io, &node, "alice", identity);
        let mut headers = protocol::Headers::new();
        headers.set("path", "/echo");
        conn.write_message(&headers, &Payload::null()).await.unwrap();
        let (reply, _) = conn.read_message(true).await.unwrap();
        assert_eq!(reply.status_code(), status::ECLIENT);

        assert!(server.await.unwrap().is_ok());
        assert!(conn.read_message(true).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_token_ends_idle_session() {
        let node = node();
        let (_client_io, server_io) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_connection(
            server_io,
            None,
            node.context.clone(),
            shutdown.clone(),
        ));

        shutdown.cancel();
        assert!(server.await.unwrap().is_ok());
    }

    /// Starts a procedure that holds `guard` until it is aborted.
    struct Holder {
        controller: Option<Controller>,
        guard: Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>,
    }

    #[async_trait]
    impl Service for Holder {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supported_methods: Some(Methods::one("hold")),
                is_allow: None,
                no_token_required: Some(Methods::one("hold")),
            }
        }

        fn has_action(&self, action: &str) -> bool {
            action == "hold"
        }

        fn set_controller(&mut self, controller: Controller) {
            self.controller = Some(controller);
        }

        async fn call(&mut self, _action: &str, _params: StrDict) -> Result<Payload, ServiceError> {
            let controller = self
                .controller
                .as_ref()
                .ok_or(ServiceError::Uninitialized("holder"))?;
            let guard = self.guard.lock().unwrap().take();
            controller.procedures().spawn("hold", async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })?;
            Ok(Payload::null())
        }
    }

    #[tokio::test]
    async fn test_receive_timeout_ends_only_that_session() {
        let (tx, rx) = oneshot::channel::<()>();
        let guard = Arc::new(std::sync::Mutex::new(Some(tx)));
        let node = node_with(Some(Duration::from_millis(100)), move |registry| {
            registry.register_fn("holder", move |_| {
                Ok(Box::new(Holder {
                    controller: None,
                    guard: guard.clone(),
                }) as Box<dyn Service>)
            });
        });
        let identity = install_user(&node, "alice").await;

        let (idle_io, idle_server_io) = tokio::io::duplex(64 * 1024);
        let idle_server = tokio::spawn(serve_connection(
            idle_server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));
        let mut idle = client(idle_io, &node, "alice", identity.clone());
        idle.write_message(
            &RequestHeaders::new("/holder", "hold").to_headers(),
            &Payload::null(),
        )
        .await
        .unwrap();
        let (headers, _) = idle.read_message(true).await.unwrap();
        assert_eq!(headers.status_code(), status::OK);

        // The idle peer now sends nothing and runs into the receive timeout.
        let err = idle_server.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::Timeout(_))
        ));
        assert!(err.is_operational());

        // Its procedure was torn down with the session.
        let dropped = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap();
        assert!(dropped.is_err());

        // The node keeps serving other peers.
        let (busy_io, busy_server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(
            busy_server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));
        let mut busy = client(busy_io, &node, "alice", identity);
        busy.write_message(
            &RequestHeaders::new("/echo", "status").to_headers(),
            &Payload::null(),
        )
        .await
        .unwrap();
        let (headers, _) = busy.read_message(true).await.unwrap();
        assert_eq!(headers.status_code(), status::OK);
    }

    #[tokio::test]
    async fn test_unpackable_body_gets_client_error() {
        let node = node();
        let identity = install_user(&node, "alice").await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(
            server_io,
            None,
            node.context.clone(),
            CancellationToken::new(),
        ));

        let mut conn = client(client_io, &node, "alice", identity);
        let request = RequestHeaders::new("/echo", "status").to_headers();
        // {"data": bin[1, 2, 3]}
        let binary = vec![0x81, 0xa4, b'd', b'a', b't', b'a', 0xc4, 0x03, 1, 2, 3];
        conn.write_message(&request, &Payload::Raw(binary))
            .await
            .unwrap();
        let (headers, body) = conn.read_message(true).await.unwrap();
        assert_eq!(headers.status_code(), status::ECLIENT);
        assert_eq!(headers.status(), Some("malformed request body"));
        assert_eq!(body, Payload::null());

        conn.write_message(&request, &Payload::null()).await.unwrap();
        let (headers, _) = conn.read_message(true).await.unwrap();
        assert_eq!(headers.status_code(), status::OK);
    }
}
