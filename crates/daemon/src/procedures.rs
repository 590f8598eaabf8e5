//! Background work started by services.
//!
//! Every request gets a [`ProcedureScope`]: a local registry that dies with
//! the connection and a handle on the node-wide registry. A service can
//! promote one of its local tasks so it survives the connection.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors raised when registering procedures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcedureError {
    #[error("procedure already running: {0}")]
    AlreadyRunning(String),

    #[error("procedure not found: {0}")]
    NotFound(String),
}

/// Named tokio tasks.
#[derive(Debug, Default)]
pub struct ProcedureRegistry {
    tasks: DashMap<String, JoinHandle<()>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `name`, refusing to shadow a running task.
    pub fn insert(&self, name: &str, handle: JoinHandle<()>) -> Result<(), ProcedureError> {
        self.reap();
        match self.tasks.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.abort();
                Err(ProcedureError::AlreadyRunning(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<JoinHandle<()>> {
        self.tasks.remove(name).map(|(_, handle)| handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Whether `name` is registered and has not finished.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sorted names of registered procedures.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Aborts one procedure. Returns false if it was not registered.
    pub fn abort(&self, name: &str) -> bool {
        match self.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drops finished tasks.
    pub fn reap(&self) {
        self.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Removes and returns every task.
    fn drain(&self) -> Vec<(String, JoinHandle<()>)> {
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.tasks.remove(&name))
            .collect()
    }

    /// Aborts every task and waits for them to stop. Panics are logged, never propagated.
    pub async fn shutdown(&self) -> usize {
        let tasks = self.drain();
        let count = tasks.len();
        for (name, handle) in tasks {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(procedure = %name, error = %e, "procedure failed during teardown"),
            }
        }
        count
    }
}

/// The pair of registries visible to one request.
#[derive(Debug, Clone)]
pub struct ProcedureScope {
    local: Arc<ProcedureRegistry>,
    global: Arc<ProcedureRegistry>,
}

impl ProcedureScope {
    /// A fresh local registry sharing `global`.
    pub fn new(global: Arc<ProcedureRegistry>) -> Self {
        Self {
            local: Arc::new(ProcedureRegistry::new()),
            global,
        }
    }

    pub fn local(&self) -> &ProcedureRegistry {
        &self.local
    }

    pub fn global(&self) -> &ProcedureRegistry {
        &self.global
    }

    /// Spawns `future` as a local procedure named `name`.
    pub fn spawn<F>(&self, name: &str, future: F) -> Result<(), ProcedureError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.local.is_running(name) {
            return Err(ProcedureError::AlreadyRunning(name.to_string()));
        }
        self.local.insert(name, tokio::spawn(future))?;
        debug!(procedure = %name, "spawned procedure");
        Ok(())
    }

    /// Moves a local procedure to the node-wide registry.
    pub fn promote(&self, name: &str) -> Result<(), ProcedureError> {
        let handle = self
            .local
            .remove(name)
            .ok_or_else(|| ProcedureError::NotFound(name.to_string()))?;
        self.global.insert(name, handle)?;
        debug!(procedure = %name, "promoted procedure");
        Ok(())
    }

    /// Aborts everything still local. The global registry is left untouched.
    pub async fn teardown(&self) {
        let stopped = self.local.shutdown().await;
        if stopped > 0 {
            debug!(stopped, "tore down local procedures");
        }
    }
}
