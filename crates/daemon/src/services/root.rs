//! Built-in administrative handler.

use async_trait::async_trait;
use protocol::status;
use protocol::Payload;
use tracing::{debug, info};

use super::{AdminFactory, AdminService, ServiceError};
use crate::controller::Controller;
use crate::forwarder::ForwardError;

/// Checks bearer tokens and relays requests for services hosted elsewhere.
#[derive(Debug, Default)]
pub struct RootService {
    controller: Option<Controller>,
}

impl RootService {
    pub fn new() -> Self {
        Self::default()
    }

    fn controller(&self) -> Result<&Controller, ServiceError> {
        self.controller
            .as_ref()
            .ok_or(ServiceError::Uninitialized("root"))
    }
}

#[async_trait]
impl AdminService for RootService {
    fn set_controller(&mut self, controller: Controller) {
        self.controller = Some(controller);
    }

    async fn access(&mut self) -> Result<bool, ServiceError> {
        let controller = self.controller()?;
        let request = controller.request();

        let Some(hash) = request.headers.token_hash() else {
            controller.set_status(status::ENOTOK);
            return Ok(false);
        };

        let store = controller.store();
        if !store.token_exists(hash).await? {
            controller.set_status(status::EPERM);
            return Ok(false);
        }

        if store.is_expired(hash).await? {
            store.delete_token(hash).await?;
            info!(username = %request.username, "expired token removed");
            controller.set_status(status::ETOKEXPIRED);
            return Ok(false);
        }

        if request.userid.is_none() {
            controller.set_status(status::ENOUSR);
            return Ok(false);
        }

        Ok(true)
    }

    async fn remote(&mut self) -> Result<Payload, ServiceError> {
        let controller = self.controller()?;
        match controller
            .forwarder()
            .forward(controller.request(), controller.body())
            .await
        {
            Ok(response) => {
                controller.extend_headers(&response.headers);
                Ok(response.body)
            }
            Err(ForwardError::Unreachable(reason)) => {
                debug!(path = %controller.request().headers.path(), %reason, "no node answered");
                controller.set_status(status::EHOSTUNREACH);
                Ok(Payload::null())
            }
            Err(ForwardError::Store(err)) => Err(err.into()),
            Err(err) => Err(ServiceError::Failed(err.to_string())),
        }
    }
}

/// Builds a [`RootService`] per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootFactory;

impl AdminFactory for RootFactory {
    fn create(&self) -> Box<dyn AdminService> {
        Box::new(RootService::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use protocol::RequestHeaders;

    use crate::store::{MemoryStore, Store};
    use crate::testing;

    fn root_for(
        store: Arc<MemoryStore>,
        token: Option<String>,
        userid: Option<i64>,
    ) -> RootService {
        let mut headers = RequestHeaders::new("/echo", "ping");
        headers.set_token(token).unwrap();
        let controller = testing::controller(store, headers, userid, false);
        let mut root = RootService::new();
        root.set_controller(controller);
        root
    }

    #[tokio::test]
    async fn test_access_without_controller_fails() {
        let mut root = RootService::new();
        assert!(matches!(
            root.access().await,
            Err(ServiceError::Uninitialized("root"))
        ));
    }

    #[tokio::test]
    async fn test_access_requires_token() {
        let store = Arc::new(MemoryStore::new());
        let mut root = root_for(store, None, Some(1));
        assert!(!root.access().await.unwrap());
        assert_eq!(root.controller().unwrap().status_code(), status::ENOTOK);
    }

    #[tokio::test]
    async fn test_access_unknown_token() {
        let store = Arc::new(MemoryStore::new());
        let mut root = root_for(store, Some(crate::store::generate_token()), Some(1));
        assert!(!root.access().await.unwrap());
        assert_eq!(root.controller().unwrap().status_code(), status::EPERM);
    }

    #[tokio::test]
    async fn test_access_expired_token_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let userid = store.add_user("alice", false).await.unwrap();
        let token = store
            .issue_token(userid, Some(Duration::ZERO), None)
            .await
            .unwrap();
        let hash = protocol::token_hash(&token).unwrap();

        let mut root = root_for(store.clone(), Some(token), Some(userid));
        assert!(!root.access().await.unwrap());
        assert_eq!(root.controller().unwrap().status_code(), status::ETOKEXPIRED);
        assert!(!store.token_exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_access_requires_known_user() {
        let store = Arc::new(MemoryStore::new());
        let userid = store.add_user("alice", false).await.unwrap();
        let token = store.issue_token(userid, None, None).await.unwrap();

        let mut root = root_for(store.clone(), Some(token.clone()), None);
        assert!(!root.access().await.unwrap());
        assert_eq!(root.controller().unwrap().status_code(), status::ENOUSR);

        let mut root = root_for(store, Some(token), Some(userid));
        assert!(root.access().await.unwrap());
        assert_eq!(root.controller().unwrap().status_code(), status::OK);
    }

    #[tokio::test]
    async fn test_remote_without_route_is_unreachable() {
        let store = Arc::new(MemoryStore::new());
        let mut root = root_for(store, None, None);
        let body = root.remote().await.unwrap();
        assert_eq!(body, Payload::null());

        let headers = root.controller().unwrap().response_headers();
        assert_eq!(headers.status_code(), status::EHOSTUNREACH);
        assert_eq!(headers.status(), Some("service unreachable"));
    }
}
