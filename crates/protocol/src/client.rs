//! Outbound client: connects to a node, builds request headers and exchanges messages.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;

use crate::connection::{Connection, WireConfig};
use crate::crypto::{NodeIdentity, PeerIdentity};
use crate::envelope::Payload;
use crate::error::{ProtocolError, Result};
use crate::headers::Headers;
use crate::request::{Node, RequestHeaders};

/// Default wait between connection attempts (seconds).
pub const CONNECT_WAIT_SECS: u64 = 30;

/// Default number of connection attempts.
pub const CONNECT_RETRY: u32 = 3;

/// Default timeout of a single connection attempt (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection policy of a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub connect_retry: u32,
    pub connect_wait: Duration,
    pub wire: WireConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_retry: CONNECT_RETRY,
            connect_wait: Duration::from_secs(CONNECT_WAIT_SECS),
            wire: WireConfig::default(),
        }
    }
}

/// A reply from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub headers: Headers,
    pub body: Payload,
}

impl Response {
    pub fn status_code(&self) -> i64 {
        self.headers.status_code()
    }

    pub fn status(&self) -> Option<&str> {
        self.headers.status()
    }

    pub fn is_ok(&self) -> bool {
        self.status_code() == 0
    }
}

/// Opens a TCP stream, retrying up to `config.connect_retry` times.
///
/// The error of the last attempt is returned when every attempt fails.
pub async fn connect_with_retry(address: &str, config: &ClientConfig) -> Result<TcpStream> {
    let attempts = config.connect_retry.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    address, config.connect_timeout
                ))
            })
            .and_then(|r| r.map_err(ProtocolError::from));

        match result {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                tracing::warn!(
                    attempt,
                    attempts,
                    address,
                    wait = ?config.connect_wait,
                    error = %err,
                    "connection attempt failed, retrying"
                );
                tokio::time::sleep(config.connect_wait).await;
                attempt += 1;
            }
        }
    }
}

/// A request-building client bound to one node.
#[derive(Debug)]
pub struct Client {
    conn: Connection<TcpStream>,
    request: RequestHeaders,
}

impl Client {
    /// Connects to `address` as `username`, expecting the node to sign with `server_key`.
    pub async fn connect(
        address: &str,
        identity: Arc<NodeIdentity>,
        username: &str,
        server_key: PeerIdentity,
        config: &ClientConfig,
    ) -> Result<Self> {
        let stream = connect_with_retry(address, config).await?;
        let conn = Connection::client(stream, identity, username, server_key, config.wire.clone());
        Ok(Self {
            conn,
            request: RequestHeaders::new("/", ""),
        })
    }

    /// The headers that the next [`send`](Self::send) will use.
    pub fn request(&self) -> &RequestHeaders {
        &self.request
    }

    /// Replaces the pending request wholesale.
    pub fn set_request(&mut self, request: RequestHeaders) {
        self.request = request;
    }

    pub fn set_path(&mut self, path: &str, action: &str) {
        self.request.set_path(Some(path));
        self.request.set_action(action);
    }

    pub fn set_token(&mut self, token: Option<String>) -> Result<()> {
        self.request.set_token(token)
    }

    pub fn set_parameter(&mut self, key: &str, value: impl Into<Value>) {
        self.request.params_mut().insert(key, value.into());
    }

    /// Appends to a list-valued parameter.
    pub fn add_parameter(&mut self, key: &str, value: impl Into<Value>) {
        self.request.params_mut().append(key, value.into());
    }

    pub fn remove_parameter(&mut self, key: &str) -> Option<Value> {
        self.request.params_mut().remove(key)
    }

    pub fn set_init_parameter(&mut self, key: &str, value: impl Into<Value>) {
        self.request.init_params_mut().insert(key, value.into());
    }

    pub fn add_init_parameter(&mut self, key: &str, value: impl Into<Value>) {
        self.request.init_params_mut().append(key, value.into());
    }

    pub fn remove_init_parameter(&mut self, key: &str) -> Option<Value> {
        self.request.init_params_mut().remove(key)
    }

    /// Flips `force` and returns the new value.
    pub fn toggle_force(&mut self) -> bool {
        let force = !self.request.force();
        self.request.set_force(force);
        force
    }

    pub fn set_node(&mut self, address: &str, port: u16) -> Result<()> {
        let node = Node::new(address, i64::from(port))?;
        self.request.set_node(Some(node));
        Ok(())
    }

    pub fn clear_node(&mut self) {
        self.request.set_node(None);
    }

    /// Flips `is_packed` and returns the new value.
    pub fn toggle_packed(&mut self) -> bool {
        let packed = !self.request.is_packed();
        self.request.set_packed(packed);
        packed
    }

    /// Sends the pending request with `body`.
    pub async fn send(&mut self, body: &Payload) -> Result<()> {
        let headers = self.request.to_headers();
        self.conn.write_message(&headers, body).await
    }

    /// Sends pre-built headers as they are.
    pub async fn send_headers(&mut self, headers: &Headers, body: &Payload) -> Result<()> {
        self.conn.write_message(headers, body).await
    }

    /// Reads the node's reply. Without an `is_packed` reply header the body
    /// is decoded like the pending request's.
    pub async fn receive(&mut self) -> Result<Response> {
        let (headers, body) = self.conn.read_message(self.request.is_packed()).await?;
        Ok(Response { headers, body })
    }

    /// Sends and waits for the reply.
    pub async fn call(&mut self, body: &Payload) -> Result<Response> {
        self.send(body).await?;
        self.receive().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn.shutdown().await
    }
}
