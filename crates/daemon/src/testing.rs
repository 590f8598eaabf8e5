//! Fixtures shared by unit tests.

use std::sync::Arc;

use protocol::{ClientConfig, NodeIdentity, Payload, RealUser, Request, RequestHeaders};

use crate::controller::{Controller, RequestContext};
use crate::crypto_pool::CryptoPool;
use crate::forwarder::Forwarder;
use crate::keys::KeyDirectory;
use crate::procedures::{ProcedureRegistry, ProcedureScope};
use crate::store::Store;

/// A forwarder whose key directories do not exist.
pub(crate) fn forwarder(store: Arc<dyn Store>) -> Arc<Forwarder> {
    let root = std::env::temp_dir().join(format!("meshgate-missing-{}", uuid::Uuid::new_v4()));
    Arc::new(Forwarder::new(
        Arc::new(NodeIdentity::generate()),
        KeyDirectory::new(root.join("pubkeys"), root.join("servkeys")),
        store,
        ClientConfig::default(),
        "test-node",
        CryptoPool::new(1),
    ))
}

pub(crate) fn request(headers: RequestHeaders, userid: Option<i64>, is_guest: bool) -> Request {
    Request {
        headers,
        real_user: RealUser::from_username("alice"),
        username: "alice".to_string(),
        userid,
        is_guest,
        address: None,
    }
}

pub(crate) fn controller(
    store: Arc<dyn Store>,
    headers: RequestHeaders,
    userid: Option<i64>,
    is_guest: bool,
) -> Controller {
    let context = RequestContext::new(
        request(headers, userid, is_guest),
        Payload::null(),
        store.clone(),
        forwarder(store),
    );
    Controller::new(context, ProcedureScope::new(Arc::new(ProcedureRegistry::new())))
}
