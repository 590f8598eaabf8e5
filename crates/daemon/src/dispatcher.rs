//! Request dispatch: routing, authorization and invocation of one request.
//!
//! Every decoded header/body pair goes through the same pipeline:
//!
//! 1. `path` and `action` must be present, otherwise the connection is closed.
//! 2. The administrative path is never addressable directly.
//! 3. Local services run the token, capability and parameter checks below.
//! 4. Paths not hosted here are handed to the administrative `remote()` hook.
//!
//! For a local service:
//!
//! ```text
//! create(init_params) -> token required? -> access() -> token scope
//!     -> is_allow -> supported action -> set_controller -> initializer
//!     -> bind params -> call
//! ```
//!
//! Failures of a single request become status codes on the response; only a
//! missing route field terminates the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::headers::STATUS_CODE;
use protocol::request::keys;
use protocol::status;
use protocol::{
    Headers, NodeIdentity, Payload, PeerIdentity, ProtocolError, RealUser, Request,
    RequestHeaders,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::controller::{Controller, RequestContext};
use crate::crypto_pool::CryptoPool;
use crate::forwarder::Forwarder;
use crate::procedures::{ProcedureRegistry, ProcedureScope};
use crate::services::{bind_params, sanitize_path, ServiceError, ServiceRegistry};
use crate::store::{Store, StoreError};

/// Why a request was not served.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing request field: {0}")]
    MissingRoute(&'static str),

    #[error("invalid request headers: {0}")]
    InvalidHeaders(String),

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("the administrative service is not addressable")]
    AdminPath,

    #[error("no administrative service configured")]
    NoAdmin,

    #[error("access denied")]
    AccessDenied,

    #[error("token does not grant access to {0}")]
    TokenScope(String),

    #[error("service {0} is disabled")]
    ServiceDisabled(String),

    #[error("action {0} is not available")]
    ActionUnavailable(String),

    #[error("initializer declined the request")]
    InitializerDeclined,

    #[error("invalid hybrid body: {0}")]
    Hybrid(ProtocolError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Status code reported to the peer.
    pub fn status_code(&self) -> i64 {
        match self {
            DispatchError::MissingRoute(_)
            | DispatchError::InvalidHeaders(_)
            | DispatchError::MalformedBody(_)
            | DispatchError::Hybrid(_) => status::ECLIENT,
            DispatchError::AdminPath
            | DispatchError::AccessDenied
            | DispatchError::TokenScope(_) => status::EPERM,
            DispatchError::ServiceDisabled(_) | DispatchError::InitializerDeclined => {
                status::ENOSRV
            }
            DispatchError::ActionUnavailable(_) => status::ENOACT,
            DispatchError::Service(err) => err.status_code(),
            DispatchError::Store(err) => err.status_code(),
            DispatchError::NoAdmin => status::ESERVER,
        }
    }

    /// Denials decided by a hook keep the status the hook set, if any.
    fn keeps_hook_status(&self) -> bool {
        matches!(
            self,
            DispatchError::AccessDenied | DispatchError::InitializerDeclined
        )
    }

    fn public_message(&self) -> String {
        match self {
            DispatchError::Service(err) => err.public_message(),
            DispatchError::MissingRoute(_) => self.to_string(),
            DispatchError::InvalidHeaders(_) => "invalid request headers".to_string(),
            DispatchError::MalformedBody(_) => "malformed request body".to_string(),
            other => status::default_message(other.status_code()).to_string(),
        }
    }
}

/// Who is on the other end of a connection, as established by the handshake.
#[derive(Debug)]
pub struct PeerContext {
    pub real_user: RealUser,
    pub username: String,
    pub userid: Option<i64>,
    pub is_guest: bool,
    pub address: Option<SocketAddr>,
    pub key: PeerIdentity,
    scopes: Vec<ProcedureScope>,
}

impl PeerContext {
    pub fn new(
        real_user: RealUser,
        username: String,
        userid: Option<i64>,
        is_guest: bool,
        address: Option<SocketAddr>,
        key: PeerIdentity,
    ) -> Self {
        Self {
            real_user,
            username,
            userid,
            is_guest,
            address,
            key,
            scopes: Vec::new(),
        }
    }

    /// Procedure scopes still holding tasks.
    pub fn scopes(&self) -> &[ProcedureScope] {
        &self.scopes
    }

    /// Aborts the local procedures of every request served on this connection.
    pub async fn teardown(&mut self) {
        for scope in self.scopes.drain(..) {
            scope.teardown().await;
        }
    }

    fn keep(&mut self, scope: ProcedureScope) {
        scope.local().reap();
        if !scope.local().is_empty() {
            self.scopes.push(scope);
        }
    }
}

/// The response to one request.
#[derive(Debug)]
pub struct Outcome {
    pub headers: Headers,
    pub body: Payload,
    /// The connection must be closed after this response.
    pub close: bool,
    /// The parsed request, when the headers were valid.
    pub request: Option<RequestHeaders>,
}

/// Routes requests to services and applies the authorization pipeline.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn Store>,
    forwarder: Arc<Forwarder>,
    identity: Arc<NodeIdentity>,
    crypto: CryptoPool,
    user_procedures: Arc<ProcedureRegistry>,
    admin_procedures: Arc<ProcedureRegistry>,
    strict_token_scope: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn Store>,
        forwarder: Arc<Forwarder>,
        identity: Arc<NodeIdentity>,
        crypto: CryptoPool,
    ) -> Self {
        Self {
            registry,
            store,
            forwarder,
            identity,
            crypto,
            user_procedures: Arc::new(ProcedureRegistry::new()),
            admin_procedures: Arc::new(ProcedureRegistry::new()),
            strict_token_scope: false,
        }
    }

    /// Deny non-guests whose token scope does not match, like guests.
    pub fn with_strict_token_scope(mut self, strict: bool) -> Self {
        self.strict_token_scope = strict;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Node-wide procedures promoted by services.
    pub fn user_procedures(&self) -> &Arc<ProcedureRegistry> {
        &self.user_procedures
    }

    /// Node-wide procedures promoted by the administrative service.
    pub fn admin_procedures(&self) -> &Arc<ProcedureRegistry> {
        &self.admin_procedures
    }

    /// Aborts every promoted procedure. Returns how many were stopped.
    pub async fn shutdown_procedures(&self) -> usize {
        self.user_procedures.shutdown().await + self.admin_procedures.shutdown().await
    }

    /// Serves one request from `peer`.
    pub async fn dispatch(
        &self,
        peer: &mut PeerContext,
        headers: Headers,
        body: Payload,
    ) -> Outcome {
        let request_headers = match RequestHeaders::from_headers(&headers) {
            Ok(parsed) => parsed,
            Err(ProtocolError::MissingRoute(field)) => {
                return self.rejected(DispatchError::MissingRoute(field), None, true);
            }
            Err(err) => {
                let err = DispatchError::InvalidHeaders(err.to_string());
                return self.rejected(err, None, false);
            }
        };

        if self.registry.is_admin_path(request_headers.path()) {
            warn!(
                username = %peer.username,
                path = %request_headers.path(),
                "direct access to the administrative service refused"
            );
            return self.rejected(DispatchError::AdminPath, Some(request_headers), false);
        }

        let unsealed = self.unseal(peer, request_headers, &headers, body).await;
        let (request_headers, body) = match unsealed {
            Ok(unsealed) => unsealed,
            Err((err, request_headers)) => {
                return self.rejected(err, Some(request_headers), false);
            }
        };

        let request = Request {
            headers: request_headers.clone(),
            real_user: peer.real_user,
            username: peer.username.clone(),
            userid: peer.userid,
            is_guest: peer.is_guest,
            address: peer.address,
        };
        let context = RequestContext::new(
            request,
            body,
            self.store.clone(),
            self.forwarder.clone(),
        );
        let user_scope = ProcedureScope::new(self.user_procedures.clone());
        let admin_scope = ProcedureScope::new(self.admin_procedures.clone());

        let result = self
            .serve(&context, user_scope.clone(), admin_scope.clone())
            .await;
        peer.keep(user_scope);
        peer.keep(admin_scope);

        let body = match result {
            Ok(body) => body,
            Err(err) => {
                self.report(&err, &context);
                Payload::null()
            }
        };

        let mut headers = context.response_headers();
        if !headers.contains(STATUS_CODE) {
            headers.set_status_code(status::OK);
        }
        headers.set(keys::IS_PACKED, body.is_packed());
        Outcome {
            headers,
            body,
            close: false,
            request: Some(request_headers),
        }
    }

    /// Answers a request whose body could not be unpacked. The connection stays open.
    pub fn malformed_body(&self, err: &ProtocolError) -> Outcome {
        self.rejected(DispatchError::MalformedBody(err.to_string()), None, false)
    }

    /// Opens hybrid sealed bodies sent by peer nodes.
    async fn unseal(
        &self,
        peer: &PeerContext,
        mut request_headers: RequestHeaders,
        headers: &Headers,
        body: Payload,
    ) -> Result<(RequestHeaders, Payload), (DispatchError, RequestHeaders)> {
        let Some(inner_packed) = headers.get_bool(keys::HYBRID) else {
            return Ok((request_headers, body));
        };
        let Payload::Raw(sealed) = body else {
            let err = ProtocolError::Deserialization("hybrid body must be raw".to_string());
            return Err((DispatchError::Hybrid(err), request_headers));
        };
        match self
            .crypto
            .open(self.identity.clone(), peer.key, sealed, inner_packed)
            .await
        {
            Ok(body) => {
                request_headers.set_packed(inner_packed);
                Ok((request_headers, body))
            }
            Err(err) => Err((DispatchError::Hybrid(err), request_headers)),
        }
    }

    async fn serve(
        &self,
        context: &Arc<RequestContext>,
        user_scope: ProcedureScope,
        admin_scope: ProcedureScope,
    ) -> Result<Payload, DispatchError> {
        let request = context.request();
        let path = request.headers.path();
        let action = request.headers.action();

        let local = self.registry.resolve(path);
        let admin_factory = self.registry.admin().ok_or(DispatchError::NoAdmin)?;
        let mut admin = admin_factory.create();
        admin.set_controller(Controller::new(context.clone(), admin_scope));

        let Some((name, factory)) = local else {
            debug!(path, action, "service not hosted here, forwarding");
            return Ok(admin.remote().await?);
        };

        let mut service = factory.create(request.headers.init_params()).await?;
        let capabilities = service.capabilities();

        if capabilities.token_required(action) {
            if !admin.access().await? {
                return Err(DispatchError::AccessDenied);
            }
            self.check_token_scope(request).await?;
        }

        if !capabilities.is_allowed() {
            return Err(DispatchError::ServiceDisabled(name));
        }

        if !(capabilities.supports(action) && service.has_action(action)) {
            return Err(DispatchError::ActionUnavailable(action.to_string()));
        }

        service.set_controller(Controller::new(context.clone(), user_scope));
        if !service.initializer().await? {
            return Err(DispatchError::InitializerDeclined);
        }

        let params = bind_params(&service.parameters(action), request.headers.params())?;
        let body = service.call(action, params).await?;
        info!(service = %name, action, username = %request.username, "request served");
        Ok(body)
    }

    /// Matches the request path against the token's service expression.
    async fn check_token_scope(&self, request: &Request) -> Result<(), DispatchError> {
        let service_path = sanitize_path(request.headers.path());
        let allowed = match request.headers.token_hash() {
            Some(hash) => self.store.get_services_allowed(hash).await?,
            None => None,
        };

        let matched = match allowed.as_deref() {
            Some(pattern) => match Regex::new(&format!("^(?:{pattern})")) {
                Ok(regex) => regex.is_match(&service_path),
                Err(err) => {
                    warn!(error = %err, "token carries an invalid service expression");
                    false
                }
            },
            None => {
                warn!(username = %request.username, "token has no service expression");
                false
            }
        };

        if matched {
            return Ok(());
        }
        if request.is_guest || self.strict_token_scope {
            return Err(DispatchError::TokenScope(service_path));
        }
        warn!(
            username = %request.username,
            path = %service_path,
            "token scope does not cover the service, allowed for non-guest user"
        );
        Ok(())
    }

    fn report(&self, err: &DispatchError, context: &RequestContext) {
        match err {
            DispatchError::Service(ServiceError::Store(_))
            | DispatchError::Store(_)
            | DispatchError::NoAdmin => warn!(error = %err, "request failed"),
            _ => debug!(error = %err, "request refused"),
        }
        if err.keeps_hook_status() && context.status_code() != status::OK {
            return;
        }
        context.set_status_message(err.status_code(), err.public_message());
    }

    fn rejected(
        &self,
        err: DispatchError,
        request: Option<RequestHeaders>,
        close: bool,
    ) -> Outcome {
        debug!(error = %err, close, "request rejected");
        let mut headers = Headers::new();
        headers.set_status_pair(err.status_code(), err.public_message());
        let body = Payload::null();
        headers.set(keys::IS_PACKED, body.is_packed());
        Outcome {
            headers,
            body,
            close,
            request,
        }
    }
}
