//! Meshgate node
//!
//! Serves authenticated requests and relays them between nodes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::keys::{self, KeyDirectory};
use daemon::protocol::{PeerIdentity, RealUser};
use daemon::server::{NodeServer, ServerEvent};
use daemon::store::{MemoryStore, SqliteStore, Store};
use tracing_subscriber::EnvFilter;

/// Meshgate node - authenticated request dispatch between peers.
#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the node and serve until interrupted
    Start {
        /// Keep records in memory instead of the configured database
        #[arg(long)]
        memory_store: bool,
    },

    /// Create the node key pair if missing and print its fingerprint
    Keygen,

    /// Print the real user identifier sent for a username
    RealUser {
        username: String,
    },

    /// Manage users
    #[command(subcommand)]
    User(UserCommands),

    /// Manage access tokens
    #[command(subcommand)]
    Token(TokenCommands),

    /// Manage peer nodes
    #[command(subcommand)]
    Network(NetworkCommands),

    /// Manage service routes
    #[command(subcommand)]
    Route(RouteCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum UserCommands {
    /// Register a user
    Add {
        username: String,

        /// Flag the user as a guest
        #[arg(long)]
        guest: bool,

        /// Maximum number of tokens the user may hold; 0 means no limit
        #[arg(long, default_value = "0")]
        token_limit: i64,

        /// Raw 32-byte Ed25519 verification key of the user
        #[arg(long, value_name = "FILE")]
        key: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommands {
    /// Issue a token and print it once
    Issue {
        username: String,

        /// Lifetime in seconds; omit for a token that never expires
        #[arg(long)]
        ttl: Option<u64>,

        /// Regular expression of the services the token may reach
        #[arg(long)]
        services: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum NetworkCommands {
    /// Register a peer node
    Add {
        address: String,
        port: u16,

        /// Token this node presents to the peer
        #[arg(long)]
        token: Option<String>,

        /// Raw 32-byte Ed25519 verification key of the peer node
        #[arg(long, value_name = "FILE")]
        key: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RouteCommands {
    /// Declare that a peer node serves a service
    Add {
        service: String,
        networkid: i64,

        /// Lower values are tried first
        #[arg(long, default_value = "0")]
        priority: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }
    config.validate()?;

    match cli.command {
        Commands::Start { memory_store } => {
            let store: Arc<dyn Store> = if memory_store || config.store.backend == "memory" {
                tracing::warn!("Using the in-memory store, records are lost on exit");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(open_store(&config)?)
            };
            let mut server = NodeServer::from_config(config, store)?;
            run(&mut server).await?;
        }
        Commands::Keygen => {
            let private_key = config.resolve(&config.paths.private_key);
            let public_key = config.resolve(&config.paths.public_key);
            let identity = keys::load_or_generate_identity(&private_key, &public_key)?;
            println!("Fingerprint: {}", identity.fingerprint());
            println!("Public key:  {}", public_key.display());
        }
        Commands::RealUser { username } => {
            println!("{}", RealUser::from_username(&username).to_hex());
        }
        Commands::User(UserCommands::Add {
            username,
            guest,
            token_limit,
            key,
        }) => {
            let store = open_store(&config)?;
            let userid = store.add_user(&username, guest).await?;
            if token_limit > 0 {
                store.set_token_limit(userid, token_limit).await?;
            }
            if let Some(key) = key {
                let key = read_peer_key(&key)?;
                let path = KeyDirectory::from_config(&config)
                    .install_user_key(&username, &key)
                    .await?;
                println!("Installed key for {} at {}", username, path.display());
            }
            println!("Added user {} (id {})", username, userid);
        }
        Commands::Token(TokenCommands::Issue {
            username,
            ttl,
            services,
        }) => {
            if let Some(pattern) = &services {
                regex::Regex::new(pattern)
                    .with_context(|| format!("Invalid services pattern: {}", pattern))?;
            }
            let store = open_store(&config)?;
            let userid = store
                .extract_userid(&username)
                .await?
                .with_context(|| format!("Unknown user: {}", username))?;
            let token = store
                .issue_token(userid, ttl.map(Duration::from_secs), services.as_deref())
                .await?;
            println!("{}", token);
        }
        Commands::Network(NetworkCommands::Add {
            address,
            port,
            token,
            key,
        }) => {
            let store = open_store(&config)?;
            let networkid = store.add_network(&address, port, token.as_deref()).await?;
            if let Some(key) = key {
                let endpoint = format!("{}:{}", address, port);
                let key = read_peer_key(&key)?;
                let path = KeyDirectory::from_config(&config)
                    .install_server_key(&endpoint, &key)
                    .await?;
                println!("Installed key for {} at {}", endpoint, path.display());
            }
            println!("Added network {}:{} (id {})", address, port, networkid);
        }
        Commands::Route(RouteCommands::Add {
            service,
            networkid,
            priority,
        }) => {
            let store = open_store(&config)?;
            store.add_service_route(&service, networkid, priority).await?;
            println!("Routed {} to network {}", service, networkid);
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = config.resolve(&config.store.database);
    SqliteStore::open(&path, config.store.pool_size)
        .with_context(|| format!("Failed to open database: {}", path.display()))
}

fn read_peer_key(path: &std::path::Path) -> anyhow::Result<PeerIdentity> {
    let bytes = keys::read_key_file(path)?;
    PeerIdentity::from_slice(&bytes)
        .with_context(|| format!("Invalid verification key: {}", path.display()))
}

/// Serves until SIGINT or SIGTERM.
async fn run(server: &mut NodeServer) -> anyhow::Result<()> {
    server.start().await?;

    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::StateChanged(state) => {
                    tracing::info!("Server state: {:?}", state);
                }
                ServerEvent::PeerConnected { address } => {
                    tracing::debug!("Peer connected: {}", address);
                }
                ServerEvent::PeerDisconnected {
                    address,
                    reason: Some(reason),
                } => {
                    tracing::debug!("Peer disconnected: {} ({})", address, reason);
                }
                ServerEvent::PeerDisconnected { address, .. } => {
                    tracing::debug!("Peer disconnected: {}", address);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    server.stop().await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
