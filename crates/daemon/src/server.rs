//! The TCP listener that accepts peers and runs one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::keys;
use crate::lifecycle::{serve_connection, NodeContext};
use crate::services;
use crate::store::Store;

/// Pause after a failed `accept` so a full fd table doesn't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Node server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Waiting for open sessions to finish.
    ShuttingDown,
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    StateChanged(ServerState),
    PeerConnected {
        address: SocketAddr,
    },
    /// `reason` is set when the session ended with an error.
    PeerDisconnected {
        address: SocketAddr,
        reason: Option<String>,
    },
}

/// Accepts peers and hands each one to [`serve_connection`].
pub struct NodeServer {
    context: Arc<NodeContext>,
    state: Arc<RwLock<ServerState>>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl NodeServer {
    pub fn new(context: NodeContext) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            context: Arc::new(context),
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
            event_tx,
        }
    }

    /// Builds a node with the built-in services, loading or generating its identity.
    pub fn from_config(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let identity = keys::load_or_generate_identity(
            &config.resolve(&config.paths.private_key),
            &config.resolve(&config.paths.public_key),
        )?;
        info!("Node identity: {}", identity.fingerprint());

        let registry = services::builtin(&config.server.index_name, &config.server.admin_service)
            .context("Invalid service names")?;
        let context = NodeContext::new(config, Arc::new(identity), store, registry);
        Ok(Self::new(context))
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of sessions currently being served.
    pub fn connection_count(&self) -> usize {
        // The accept loop is tracked too.
        self.tracker.len().saturating_sub(1)
    }

    /// Binds the configured address and starts accepting peers.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running");
            }
            *state = ServerState::Starting;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Starting));

        let listen_addr = self.context.config.listen_addr();
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(ServerState::Stopped).await;
                return Err(e).with_context(|| format!("Failed to bind {}", listen_addr));
            }
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }
        self.tracker.reopen();
        self.tracker.spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            self.tracker.clone(),
            self.shutdown_token.clone(),
            self.event_tx.clone(),
        ));

        self.set_state(ServerState::Running).await;
        info!("Listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting, ends open sessions and waits for their tasks.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Stopped => return Ok(()),
                ServerState::ShuttingDown => anyhow::bail!("Server is already shutting down"),
                _ => *state = ServerState::ShuttingDown,
            }
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::ShuttingDown));
        info!("Stopping node server...");

        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let aborted = self.context.dispatcher.shutdown_procedures().await;
        if aborted > 0 {
            debug!(aborted, "stopped global procedures");
        }

        self.set_state(ServerState::Stopped).await;
        info!("Node server stopped");
        Ok(())
    }

    /// Token cancelled when the server stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    async fn set_state(&self, state: ServerState) {
        *self.state.write().await = state;
        self.emit_event(ServerEvent::StateChanged(state));
    }

    fn emit_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<NodeContext>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ServerEvent>,
) {
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                debug!("Accept loop received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, address)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%address, error = %e, "failed to set TCP_NODELAY");
                        }
                        let _ = event_tx.send(ServerEvent::PeerConnected { address });

                        let context = Arc::clone(&context);
                        let token = shutdown_token.child_token();
                        let event_tx = event_tx.clone();
                        tracker.spawn(async move {
                            let reason = serve_connection(stream, Some(address), context, token)
                                .await
                                .err()
                                .map(|e| e.to_string());
                            let _ = event_tx
                                .send(ServerEvent::PeerDisconnected { address, reason });
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}
