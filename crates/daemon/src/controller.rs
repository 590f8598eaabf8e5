//! Per-request handle given to services.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::status;
use protocol::{Headers, Payload, Request};
use serde_json::Value;

use crate::forwarder::Forwarder;
use crate::procedures::ProcedureScope;
use crate::store::Store;

/// State shared by every controller of one request.
pub struct RequestContext {
    request: Request,
    body: Payload,
    response: Mutex<Headers>,
    store: Arc<dyn Store>,
    forwarder: Arc<Forwarder>,
}

impl RequestContext {
    pub fn new(
        request: Request,
        body: Payload,
        store: Arc<dyn Store>,
        forwarder: Arc<Forwarder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request,
            body,
            response: Mutex::new(Headers::new()),
            store,
            forwarder,
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    fn response(&self) -> MutexGuard<'_, Headers> {
        self.response.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the response headers set so far.
    pub fn response_headers(&self) -> Headers {
        self.response().clone()
    }

    pub fn status_code(&self) -> i64 {
        self.response().status_code()
    }

    /// Sets the status, filling in the default message for `code`.
    pub fn set_status(&self, code: i64) {
        self.response()
            .set_status_pair(code, status::default_message(code));
    }

    pub fn set_status_message(&self, code: i64, message: impl Into<String>) {
        self.response().set_status_pair(code, message);
    }
}

/// What a service sees of the request it is serving.
#[derive(Clone)]
pub struct Controller {
    context: Arc<RequestContext>,
    procedures: ProcedureScope,
}

impl Controller {
    pub fn new(context: Arc<RequestContext>, procedures: ProcedureScope) -> Self {
        Self {
            context,
            procedures,
        }
    }

    pub fn request(&self) -> &Request {
        &self.context.request
    }

    pub fn body(&self) -> &Payload {
        &self.context.body
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.context.store
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.context.forwarder
    }

    /// Background work tied to this request's connection.
    pub fn procedures(&self) -> &ProcedureScope {
        &self.procedures
    }

    pub fn set_status(&self, code: i64) {
        self.context.set_status(code);
    }

    pub fn set_status_message(&self, code: i64, message: impl Into<String>) {
        self.context.set_status_message(code, message);
    }

    pub fn status_code(&self) -> i64 {
        self.context.status_code()
    }

    pub fn set_header(&self, key: &str, value: impl Into<Value>) {
        self.context.response().set(key, value);
    }

    /// Copies every header of `headers` into the response.
    pub fn extend_headers(&self, headers: &Headers) {
        self.context.response().extend(headers);
    }

    pub fn response_headers(&self) -> Headers {
        self.context.response_headers()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("path", &self.context.request.headers.path())
            .field("action", &self.context.request.headers.action())
            .field("username", &self.context.request.username)
            .finish()
    }
}
