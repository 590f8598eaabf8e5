//! In-memory store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use protocol::{token_hash, RealUser};

use super::{generate_token, now_secs, NetworkRecord, Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct UserRecord {
    username: String,
    userid: i64,
    guest: bool,
    token_limit: i64,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    userid: i64,
    expires_at: Option<i64>,
    services: Option<String>,
}

#[derive(Debug, Clone)]
struct RouteRecord {
    networkid: i64,
    priority: i64,
}

#[derive(Debug, Default)]
struct Inner {
    // keyed by hex real user
    users: HashMap<String, UserRecord>,
    tokens: HashMap<String, TokenRecord>,
    networks: HashMap<i64, (NetworkRecord, Option<String>)>,
    routes: HashMap<String, Vec<RouteRecord>>,
    next_userid: i64,
    next_networkid: i64,
}

/// A store that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Task("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Task("memory store lock poisoned".to_string()))
    }

    /// Registers a user and returns its id.
    pub async fn add_user(&self, username: &str, guest: bool) -> StoreResult<i64> {
        let key = RealUser::from_username(username).to_hex();
        let mut inner = self.write()?;
        if inner.users.contains_key(&key) {
            return Err(StoreError::Duplicate {
                kind: "user",
                key: username.to_string(),
            });
        }
        inner.next_userid += 1;
        let userid = inner.next_userid;
        inner.users.insert(
            key,
            UserRecord {
                username: username.to_string(),
                userid,
                guest,
                token_limit: 0,
            },
        );
        Ok(userid)
    }

    /// Caps how many tokens `userid` may hold. Zero lifts the cap.
    pub async fn set_token_limit(&self, userid: i64, limit: i64) -> StoreResult<()> {
        let mut inner = self.write()?;
        let user = inner
            .users
            .values_mut()
            .find(|u| u.userid == userid)
            .ok_or_else(|| StoreError::NotFound {
                kind: "user",
                key: userid.to_string(),
            })?;
        user.token_limit = limit.max(0);
        Ok(())
    }

    /// Issues a token for `userid` and returns the bearer value. Only its hash is kept.
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
        let mut inner = self.write()?;
        let limit = inner
            .users
            .values()
            .find(|u| u.userid == userid)
            .map(|u| u.token_limit)
            .ok_or_else(|| StoreError::NotFound {
                kind: "user",
                key: userid.to_string(),
            })?;
        let held = inner.tokens.values().filter(|t| t.userid == userid).count() as i64;
        if limit > 0 && held >= limit {
            return Err(StoreError::TokenLimit { userid, limit });
        }
        inner.tokens.insert(
            hash,
            TokenRecord {
                userid,
                expires_at: ttl.map(|ttl| now_secs() + ttl.as_secs() as i64),
                services: services.map(str::to_string),
            },
        );
        Ok(token)
    }

    /// Registers a peer node and returns its id.
    pub async fn add_network(
        &self,
        address: &str,
        port: u16,
        token: Option<&str>,
    ) -> StoreResult<i64> {
        let mut inner = self.write()?;
        inner.next_networkid += 1;
        let id = inner.next_networkid;
        let record = NetworkRecord {
            id,
            address: address.to_string(),
            port,
        };
        inner.networks.insert(id, (record, token.map(str::to_string)));
        Ok(id)
    }

    /// Declares that `networkid` serves `service`. Lower priority values are tried first.
    pub async fn add_service_route(
        &self,
        service: &str,
        networkid: i64,
        priority: i64,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.networks.contains_key(&networkid) {
            return Err(StoreError::NotFound {
                kind: "network",
                key: networkid.to_string(),
            });
        }
        let routes = inner.routes.entry(service.to_string()).or_default();
        routes.retain(|r| r.networkid != networkid);
        routes.push(RouteRecord {
            networkid,
            priority,
        });
        routes.sort_by_key(|r| r.priority);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash2user(&self, real_user: &RealUser) -> StoreResult<Option<String>> {
        Ok(self
            .read()?
            .users
            .get(&real_user.to_hex())
            .map(|u| u.username.clone()))
    }

    async fn extract_userid(&self, username: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.username == username)
            .map(|u| u.userid))
    }

    async fn is_guest_user(&self, userid: i64) -> StoreResult<bool> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.userid == userid)
            .map_or(true, |u| u.guest))
    }

    async fn token_exists(&self, token_hash: &str) -> StoreResult<bool> {
        Ok(self.read()?.tokens.contains_key(token_hash))
    }

    async fn is_expired(&self, token_hash: &str) -> StoreResult<bool> {
        let now = now_secs();
        Ok(self
            .read()?
            .tokens
            .get(token_hash)
            .and_then(|t| t.expires_at)
            .is_some_and(|expires_at| expires_at <= now))
    }

    async fn delete_token(&self, token_hash: &str) -> StoreResult<()> {
        self.write()?.tokens.remove(token_hash);
        Ok(())
    }

    async fn get_services_allowed(&self, token_hash: &str) -> StoreResult<Option<String>> {
        Ok(self
            .read()?
            .tokens
            .get(token_hash)
            .and_then(|t| t.services.clone()))
    }

    async fn service2id(&self, service: &str) -> StoreResult<Vec<i64>> {
        Ok(self
            .read()?
            .routes
            .get(service)
            .map(|routes| routes.iter().map(|r| r.networkid).collect())
            .unwrap_or_default())
    }

    async fn id2network(&self, networkid: i64) -> StoreResult<Option<NetworkRecord>> {
        Ok(self
            .read()?
            .networks
            .get(&networkid)
            .map(|(record, _)| record.clone()))
    }

    async fn extract_networkid(&self, address: &str, port: u16) -> StoreResult<Option<i64>> {
        Ok(self
            .read()?
            .networks
            .values()
            .map(|(record, _)| record)
            .filter(|record| record.address == address && record.port == port)
            .map(|record| record.id)
            .min())
    }

    async fn get_network_token(&self, networkid: i64) -> StoreResult<Option<String>> {
        Ok(self
            .read()?
            .networks
            .get(&networkid)
            .and_then(|(_, token)| token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_lookup_chain() {
        let store = MemoryStore::new();
        let userid = store.add_user("alice", false).await.unwrap();

        let real_user = RealUser::from_username("alice");
        let username = store.hash2user(&real_user).await.unwrap();
        assert_eq!(username.as_deref(), Some("alice"));
        assert_eq!(store.extract_userid("alice").await.unwrap(), Some(userid));
        assert!(!store.is_guest_user(userid).await.unwrap());
        assert!(store.is_guest_user(userid + 100).await.unwrap());

        let unknown = RealUser::from_username("mallory");
        assert_eq!(store.hash2user(&unknown).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let store = MemoryStore::new();
        store.add_user("alice", false).await.unwrap();
        let err = store.add_user("alice", true).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { kind: "user", .. }));
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let store = MemoryStore::new();
        let userid = store.add_user("alice", false).await.unwrap();
        let token = store
            .issue_token(userid, Some(Duration::from_secs(3600)), Some("echo"))
            .await
            .unwrap();
        let hash = token_hash(&token).unwrap();

        assert!(store.token_exists(&hash).await.unwrap());
        assert!(!store.is_expired(&hash).await.unwrap());
        assert_eq!(
            store.get_services_allowed(&hash).await.unwrap().as_deref(),
            Some("echo")
        );

        store.delete_token(&hash).await.unwrap();
        assert!(!store.token_exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_token_is_expired() {
        let store = MemoryStore::new();
        let userid = store.add_user("bob", true).await.unwrap();
        let token = store
            .issue_token(userid, Some(Duration::ZERO), None)
            .await
            .unwrap();
        assert!(store.is_expired(&token_hash(&token).unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_limit_is_enforced() {
        let store = MemoryStore::new();
        let userid = store.add_user("alice", false).await.unwrap();
        store.set_token_limit(userid, 2).await.unwrap();

        let first = store.issue_token(userid, None, None).await.unwrap();
        store.issue_token(userid, None, None).await.unwrap();
        let err = store.issue_token(userid, None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::TokenLimit { limit: 2, .. }));
        assert_eq!(err.status_code(), protocol::status::ETOKLIMIT);

        // Other users are not affected.
        let bob = store.add_user("bob", false).await.unwrap();
        store.set_token_limit(bob, 1).await.unwrap();
        store.issue_token(bob, None, None).await.unwrap();

        // Deleting a token frees its slot; a zero limit lifts the cap.
        store
            .delete_token(&token_hash(&first).unwrap())
            .await
            .unwrap();
        store.issue_token(userid, None, None).await.unwrap();
        store.set_token_limit(userid, 0).await.unwrap();
        store.issue_token(userid, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_token_unknown_user() {
        let store = MemoryStore::new();
        let err = store.issue_token(7, None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "user", .. }));
    }

    #[tokio::test]
    async fn test_routes_follow_priority() {
        let store = MemoryStore::new();
        let slow = store.add_network("10.0.0.2", 17000, None).await.unwrap();
        let fast = store
            .add_network("10.0.0.3", 17001, Some("abcd"))
            .await
            .unwrap();
        store.add_service_route("files", slow, 10).await.unwrap();
        store.add_service_route("files", fast, 1).await.unwrap();

        assert_eq!(store.service2id("files").await.unwrap(), vec![fast, slow]);
        assert!(store.service2id("other").await.unwrap().is_empty());
        assert_eq!(
            store.id2network(fast).await.unwrap().map(|n| n.endpoint()),
            Some("10.0.0.3:17001".to_string())
        );
        assert_eq!(
            store.get_network_token(fast).await.unwrap().as_deref(),
            Some("abcd")
        );
        assert_eq!(store.get_network_token(slow).await.unwrap(), None);
        assert_eq!(
            store.extract_networkid("10.0.0.2", 17000).await.unwrap(),
            Some(slow)
        );
        assert_eq!(store.extract_networkid("10.0.0.2", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_route_to_unknown_network_rejected() {
        let store = MemoryStore::new();
        let err = store.add_service_route("files", 42, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "network", .. }));
    }
}
