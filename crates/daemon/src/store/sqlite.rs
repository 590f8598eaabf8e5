//! SQLite store with a fixed-size connection pool.
//!
//! Each operation checks out one connection, runs on the blocking thread pool,
//! and returns the connection as soon as it is done. No transaction outlives
//! a single operation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use protocol::{token_hash, RealUser};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Semaphore;

use super::{generate_token, now_secs, NetworkRecord, Store, StoreError, StoreResult};

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Pool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
}

impl Pool {
    fn take(&self) -> StoreResult<Connection> {
        let conn = self
            .idle
            .lock()
            .map_err(|_| StoreError::Task("pool lock poisoned".to_string()))?
            .pop();
        match conn {
            Some(conn) => Ok(conn),
            // A connection was lost to a panicking task; replace it.
            None => open_connection(&self.path),
        }
    }

    fn give_back(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// Store persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<Pool>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.pool.path)
            .field("available", &self.pool.permits.available_permits())
            .finish()
    }
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(conn)
}

fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    if schema_version(conn)? < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            userid INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            real_user TEXT NOT NULL UNIQUE,
            guest INTEGER NOT NULL DEFAULT 0,
            token_limit INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tokens (
            token_hash TEXT PRIMARY KEY,
            userid INTEGER NOT NULL,
            expires_at INTEGER,
            services TEXT,
            FOREIGN KEY (userid) REFERENCES users(userid) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS networks (
            networkid INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            port INTEGER NOT NULL,
            token TEXT
        );

        CREATE TABLE IF NOT EXISTS services (
            service TEXT NOT NULL,
            networkid INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (service, networkid),
            FOREIGN KEY (networkid) REFERENCES networks(networkid) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tokens_userid ON tokens(userid);
        "#,
    )?;
    tx.execute(
        &format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION),
        [],
    )?;
    tx.commit()?;
    Ok(())
}

impl SqliteStore {
    /// Opens or creates the database at `path` with `pool_size` connections.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: usize) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let pool_size = pool_size.max(1);
        let mut first = open_connection(&path)?;
        run_migrations(&mut first)?;
        let mut idle = vec![first];
        for _ in 1..pool_size {
            idle.push(open_connection(&path)?);
        }

        tracing::debug!(path = %path.display(), pool_size, "opened sqlite store");
        Ok(Self {
            pool: Arc::new(Pool {
                path,
                idle: Mutex::new(idle),
                permits: Semaphore::new(pool_size),
            }),
        })
    }

    /// Runs `op` on a pooled connection off the async scheduler.
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let _permit = self
            .pool
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        let conn = self.pool.take()?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;
        self.pool.give_back(conn);
        result
    }

    /// Schema version of the open database.
    pub async fn schema_version(&self) -> StoreResult<i32> {
        self.with_conn(|conn| Ok(schema_version(conn)?)).await
    }

    /// Registers a user and returns its id.
    pub async fn add_user(&self, username: &str, guest: bool) -> StoreResult<i64> {
        let username = username.to_string();
        let real_user = RealUser::from_username(&username).to_hex();
        self.with_conn(move |conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM users WHERE real_user = ?1",
                    params![real_user],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(StoreError::Duplicate {
                    kind: "user",
                    key: username,
                });
            }
            conn.execute(
                "INSERT INTO users (username, real_user, guest) VALUES (?1, ?2, ?3)",
                params![username, real_user, guest],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Caps how many tokens `userid` may hold. Zero lifts the cap.
    pub async fn set_token_limit(&self, userid: i64, limit: i64) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET token_limit = ?1 WHERE userid = ?2",
                params![limit.max(0), userid],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound {
                    kind: "user",
                    key: userid.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    /// Issues a token for `userid` and returns the bearer value. Only its hash is stored.
    ///
    /// Fails with [`StoreError::TokenLimit`] once the user holds as many tokens as its limit.
    pub async fn issue_token(
        &self,
        userid: i64,
        ttl: Option<Duration>,
        services: Option<&str>,
    ) -> StoreResult<String> {
        let token = generate_token();
        let hash = token_hash(&token).map_err(|e| StoreError::Task(e.to_string()))?;
        let expires_at = ttl.map(|ttl| now_secs() + ttl.as_secs() as i64);
        let services = services.map(str::to_string);
        self.with_conn(move |conn| {
            let limit: i64 = conn
                .query_row(
                    "SELECT token_limit FROM users WHERE userid = ?1",
                    params![userid],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "user",
                    key: userid.to_string(),
                })?;
            if limit > 0 {
                let held: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tokens WHERE userid = ?1",
                    params![userid],
                    |row| row.get(0),
                )?;
                if held >= limit {
                    return Err(StoreError::TokenLimit { userid, limit });
                }
            }
            conn.execute(
                "INSERT INTO tokens (token_hash, userid, expires_at, services) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![hash, userid, expires_at, services],
            )?;
            Ok(())
        })
        .await?;
        Ok(token)
    }

    /// Registers a peer node and returns its id.
    pub async fn add_network(
        &self,
        address: &str,
        port: u16,
        token: Option<&str>,
    ) -> StoreResult<i64> {
        let address = address.to_string();
        let token = token.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO networks (address, port, token) VALUES (?1, ?2, ?3)",
                params![address, port, token],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Declares that `networkid` serves `service`. Lower priority values are tried first.
    pub async fn add_service_route(
        &self,
        service: &str,
        networkid: i64,
        priority: i64,
    ) -> StoreResult<()> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let known = conn
                .query_row(
                    "SELECT 1 FROM networks WHERE networkid = ?1",
                    params![networkid],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !known {
                return Err(StoreError::NotFound {
                    kind: "network",
                    key: networkid.to_string(),
                });
            }
            conn.execute(
                "INSERT OR REPLACE INTO services (service, networkid, priority) \
                 VALUES (?1, ?2, ?3)",
                params![service, networkid, priority],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn hash2user(&self, real_user: &RealUser) -> StoreResult<Option<String>> {
        let real_user = real_user.to_hex();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT username FROM users WHERE real_user = ?1",
                    params![real_user],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn extract_userid(&self, username: &str) -> StoreResult<Option<i64>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT userid FROM users WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn is_guest_user(&self, userid: i64) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let guest: Option<bool> = conn
                .query_row(
                    "SELECT guest FROM users WHERE userid = ?1",
                    params![userid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(guest.unwrap_or(true))
        })
        .await
    }

    async fn token_exists(&self, token_hash: &str) -> StoreResult<bool> {
        let token_hash = token_hash.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM tokens WHERE token_hash = ?1",
                    params![token_hash],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    async fn is_expired(&self, token_hash: &str) -> StoreResult<bool> {
        let token_hash = token_hash.to_string();
        let now = now_secs();
        self.with_conn(move |conn| {
            let expires_at: Option<Option<i64>> = conn
                .query_row(
                    "SELECT expires_at FROM tokens WHERE token_hash = ?1",
                    params![token_hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(expires_at.flatten().is_some_and(|at| at <= now))
        })
        .await
    }

    async fn delete_token(&self, token_hash: &str) -> StoreResult<()> {
        let token_hash = token_hash.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM tokens WHERE token_hash = ?1",
                params![token_hash],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_services_allowed(&self, token_hash: &str) -> StoreResult<Option<String>> {
        let token_hash = token_hash.to_string();
        self.with_conn(move |conn| {
            let services: Option<Option<String>> = conn
                .query_row(
                    "SELECT services FROM tokens WHERE token_hash = ?1",
                    params![token_hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(services.flatten())
        })
        .await
    }

    async fn service2id(&self, service: &str) -> StoreResult<Vec<i64>> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT networkid FROM services WHERE service = ?1 ORDER BY priority, networkid",
            )?;
            let ids = stmt
                .query_map(params![service], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn id2network(&self, networkid: i64) -> StoreResult<Option<NetworkRecord>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT networkid, address, port FROM networks WHERE networkid = ?1",
                    params![networkid],
                    |row| {
                        Ok(NetworkRecord {
                            id: row.get(0)?,
                            address: row.get(1)?,
                            port: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn extract_networkid(&self, address: &str, port: u16) -> StoreResult<Option<i64>> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT MIN(networkid) FROM networks WHERE address = ?1 AND port = ?2",
                    params![address, port],
                    |row| row.get::<_, Option<i64>>(0),
                )?)
        })
        .await
    }

    async fn get_network_token(&self, networkid: i64) -> StoreResult<Option<String>> {
        self.with_conn(move |conn| {
            let token: Option<Option<String>> = conn
                .query_row(
                    "SELECT token FROM networks WHERE networkid = ?1",
                    params![networkid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token.flatten())
        })
        .await
    }
}
