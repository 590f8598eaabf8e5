//! End-to-end tests over real TCP connections.
//!
//! These tests verify complete flows:
//! - Token checks on a single node
//! - Service scopes of guest tokens
//! - Connection teardown on unroutable requests
//! - Forwarding between two nodes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::config::Config;
use daemon::lifecycle::NodeContext;
use daemon::server::{NodeServer, ServerState};
use daemon::services::{RootFactory, ServiceRegistry};
use daemon::store::{MemoryStore, Store};
use protocol::{
    status, token_hash, Client, ClientConfig, Headers, NodeIdentity, Payload, RequestHeaders,
};
use serde_json::json;
use tempfile::TempDir;

struct TestNode {
    _dir: TempDir,
    server: NodeServer,
    store: Arc<MemoryStore>,
    addr: SocketAddr,
}

impl TestNode {
    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Registers `username` with a fresh key and returns the key.
    async fn add_user(&self, username: &str, guest: bool) -> (Arc<NodeIdentity>, i64) {
        let userid = self.store.add_user(username, guest).await.unwrap();
        let identity = Arc::new(NodeIdentity::generate());
        self.server
            .context()
            .keys
            .install_user_key(username, &identity.to_peer_identity())
            .await
            .unwrap();
        (identity, userid)
    }

    async fn connect(&self, username: &str, identity: Arc<NodeIdentity>) -> Client {
        Client::connect(
            &self.endpoint(),
            identity,
            username,
            self.server.context().identity.to_peer_identity(),
            &ClientConfig::default(),
        )
        .await
        .unwrap()
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.server.listen_port = 0;
    config.client.connect_retry = 1;
    config
}

async fn start_node() -> TestNode {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let server = NodeServer::from_config(test_config(&dir), store.clone()).unwrap();
    launch(dir, server, store).await
}

/// A node hosting nothing but the root handler, so every path is forwarded.
async fn start_relay() -> TestNode {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Arc::new(MemoryStore::new());
    let mut registry =
        ServiceRegistry::new(&config.server.index_name, &config.server.admin_service).unwrap();
    registry.set_admin(RootFactory);
    let context = NodeContext::new(
        config,
        Arc::new(NodeIdentity::generate()),
        store.clone(),
        registry,
    );
    launch(dir, NodeServer::new(context), store).await
}

async fn launch(dir: TempDir, mut server: NodeServer, store: Arc<MemoryStore>) -> TestNode {
    let addr = server.start().await.unwrap();
    TestNode {
        _dir: dir,
        server,
        store,
        addr,
    }
}

fn request(path: &str, action: &str, token: Option<&str>) -> RequestHeaders {
    let mut request = RequestHeaders::new(path, action);
    request.set_token(token.map(str::to_string)).unwrap();
    request
}

#[tokio::test]
async fn test_ping_with_valid_token() {
    let node = start_node().await;
    let (identity, userid) = node.add_user("alice", false).await;
    let token = node.store.issue_token(userid, None, None).await.unwrap();

    let mut client = node.connect("alice", identity).await;
    client.set_request(request("/echo", "ping", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::OK);
    assert_eq!(response.body, Payload::from(json!("pong")));

    // The session stays open for further requests.
    client.set_request(request("/echo", "echo", Some(&token)));
    client.set_parameter("message", "hello");
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.body, Payload::from(json!("hello")));

    client.close().await.unwrap();
    node.server.stop().await.unwrap();
    assert_eq!(node.server.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn test_missing_token_is_refused() {
    let node = start_node().await;
    let (identity, _) = node.add_user("alice", false).await;

    let mut client = node.connect("alice", identity).await;
    client.set_request(request("/echo", "ping", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::ENOTOK);
    assert_eq!(response.status(), Some("a token is required"));
    assert_eq!(response.body, Payload::null());

    // Actions listed as token-free still work on the same session.
    client.set_request(request("/echo", "status", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::OK);
    assert_eq!(response.body.as_value()["username"], json!("alice"));
}

#[tokio::test]
async fn test_unknown_token_is_refused() {
    let node = start_node().await;
    let (identity, _) = node.add_user("alice", false).await;

    let mut client = node.connect("alice", identity).await;
    let unknown = "00".repeat(32);
    client.set_request(request("/echo", "ping", Some(&unknown)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EPERM);
}

#[tokio::test]
async fn test_expired_token_is_deleted() {
    let node = start_node().await;
    let (identity, userid) = node.add_user("alice", false).await;
    let token = node
        .store
        .issue_token(userid, Some(Duration::ZERO), None)
        .await
        .unwrap();
    let hash = token_hash(&token).unwrap();
    assert!(node.store.token_exists(&hash).await.unwrap());

    let mut client = node.connect("alice", identity).await;
    client.set_request(request("/echo", "ping", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::ETOKEXPIRED);
    assert!(!node.store.token_exists(&hash).await.unwrap());

    // A second attempt no longer finds the token at all.
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EPERM);
}

#[tokio::test]
async fn test_guest_token_scope() {
    let node = start_node().await;
    let (identity, userid) = node.add_user("visitor", true).await;
    let token = node
        .store
        .issue_token(userid, None, Some("index"))
        .await
        .unwrap();

    let mut client = node.connect("visitor", identity).await;
    client.set_request(request("/echo", "ping", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EPERM);

    client.set_request(request("/index", "list", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::OK);
    assert_eq!(response.body.as_value(), json!(["echo", "index"]));
}

#[tokio::test]
async fn test_unknown_path_is_unreachable() {
    let node = start_node().await;
    let (identity, userid) = node.add_user("alice", false).await;
    let token = node.store.issue_token(userid, None, None).await.unwrap();

    let mut client = node.connect("alice", identity).await;
    client.set_request(request("/files", "list", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EHOSTUNREACH);
    assert_eq!(response.status(), Some("service unreachable"));
}

#[tokio::test]
async fn test_admin_path_is_not_callable() {
    let node = start_node().await;
    let (identity, userid) = node.add_user("alice", false).await;
    let token = node.store.issue_token(userid, None, None).await.unwrap();

    let mut client = node.connect("alice", identity).await;
    client.set_request(request("/admin", "access", Some(&token)));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EPERM);
}

#[tokio::test]
async fn test_missing_action_closes_connection() {
    let node = start_node().await;
    let (identity, _) = node.add_user("alice", false).await;

    let mut client = node.connect("alice", identity).await;
    let mut headers = Headers::new();
    headers.set("path", "/echo");
    client.send_headers(&headers, &Payload::null()).await.unwrap();
    let response = client.receive().await.unwrap();
    assert_eq!(response.status_code(), status::ECLIENT);

    client.set_request(request("/echo", "status", None));
    assert!(client.call(&Payload::null()).await.is_err());
}

#[tokio::test]
async fn test_unregistered_key_is_rejected() {
    let node = start_node().await;
    node.add_user("alice", false).await;

    let impostor = Arc::new(NodeIdentity::generate());
    let mut client = node.connect("alice", impostor).await;
    client.set_request(request("/echo", "status", None));
    assert!(client.call(&Payload::null()).await.is_err());
}

/// Wires `relay` to forward `service` to `backend`, returning the relay's
/// node account on the backend.
async fn link(relay: &TestNode, backend: &TestNode, service: &str) -> String {
    let relay_identity = relay.server.context().identity.clone();
    let relay_name = relay.server.context().config.client.username.clone();

    let userid = backend.store.add_user(&relay_name, false).await.unwrap();
    backend
        .server
        .context()
        .keys
        .install_user_key(&relay_name, &relay_identity.to_peer_identity())
        .await
        .unwrap();
    let token = backend.store.issue_token(userid, None, None).await.unwrap();

    let networkid = relay
        .store
        .add_network("127.0.0.1", backend.addr.port(), Some(&token))
        .await
        .unwrap();
    relay
        .store
        .add_service_route(service, networkid, 0)
        .await
        .unwrap();
    relay
        .server
        .context()
        .keys
        .install_server_key(
            &backend.endpoint(),
            &backend.server.context().identity.to_peer_identity(),
        )
        .await
        .unwrap();
    token
}

#[tokio::test]
async fn test_request_is_forwarded_to_peer_node() {
    let backend = start_node().await;
    let relay = start_relay().await;
    link(&relay, &backend, "echo").await;

    let (identity, _) = relay.add_user("alice", false).await;
    let mut client = relay.connect("alice", identity).await;

    client.set_request(request("/echo", "ping", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::OK);
    assert_eq!(response.body, Payload::from(json!("pong")));

    // The backend sees the relay's account, not the original caller.
    client.set_request(request("/echo", "status", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.body.as_value()["username"], json!("meshgate"));
}

#[tokio::test]
async fn test_forwarding_reports_backend_refusal() {
    let backend = start_node().await;
    let relay = start_relay().await;
    let token = link(&relay, &backend, "echo").await;
    backend
        .store
        .delete_token(&token_hash(&token).unwrap())
        .await
        .unwrap();

    let (identity, _) = relay.add_user("alice", false).await;
    let mut client = relay.connect("alice", identity).await;
    client.set_request(request("/echo", "ping", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EPERM);
}

#[tokio::test]
async fn test_forwarding_to_dead_node_is_unreachable() {
    let backend = start_node().await;
    let relay = start_relay().await;
    link(&relay, &backend, "echo").await;
    backend.server.stop().await.unwrap();
    drop(backend);

    let (identity, _) = relay.add_user("alice", false).await;
    let mut client = relay.connect("alice", identity).await;
    client.set_request(request("/echo", "ping", None));
    let response = client.call(&Payload::null()).await.unwrap();
    assert_eq!(response.status_code(), status::EHOSTUNREACH);
}
