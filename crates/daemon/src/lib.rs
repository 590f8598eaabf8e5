//! # Meshgate Node Library
//!
//! A meshgate node accepts encrypted connections from users and other nodes,
//! authenticates every request and either serves it with a local service or
//! relays it to a node that hosts the service.
//!
//! ## Overview
//!
//! - **Lifecycle**: handshake, per-request loop and teardown of one connection
//! - **Dispatcher**: routing, token checks, service capabilities and parameters
//! - **Services**: the administrative root handler plus built-in `/echo` and index
//! - **Forwarder**: relays requests to peer nodes found in the store
//! - **Store**: users, tokens, networks and service routes (SQLite or in-memory)
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        NodeServer                         │
//! │              TcpListener → one task per peer              │
//! ├───────────────────────────────────────────────────────────┤
//! │  serve_connection: handshake → read → dispatch → write    │
//! ├───────────────────────────────────────────────────────────┤
//! │                        Dispatcher                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ RootService  │  │   Services   │  │    Forwarder    │  │
//! │  │ access/remote│  │ echo, index  │  │  peer nodes     │  │
//! │  └──────────────┘  └──────────────┘  └─────────────────┘  │
//! ├───────────────────────────────────────────────────────────┤
//! │        Store (SQLite / memory)    KeyDirectory (files)    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use daemon::{Config, MemoryStore, NodeServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let mut server = NodeServer::from_config(config, Arc::new(MemoryStore::new()))?;
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod crypto_pool;
pub mod dispatcher;
pub mod forwarder;
pub mod keys;
pub mod lifecycle;
pub mod procedures;
pub mod server;
pub mod services;
pub mod store;
pub mod templates;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol;

pub use config::Config;
pub use controller::{Controller, RequestContext};
pub use crypto_pool::CryptoPool;
pub use dispatcher::{DispatchError, Dispatcher, Outcome, PeerContext};
pub use forwarder::{ForwardError, Forwarder};
pub use keys::KeyDirectory;
pub use lifecycle::{serve_connection, ConnectionError, NodeContext};
pub use procedures::{ProcedureError, ProcedureRegistry, ProcedureScope};
pub use server::{NodeServer, ServerEvent, ServerState};
pub use services::{
    AdminFactory, AdminService, Capabilities, Methods, Param, Service, ServiceError,
    ServiceFactory, ServiceRegistry,
};
pub use store::{MemoryStore, NetworkRecord, SqliteStore, Store, StoreError};
pub use templates::Templates;
