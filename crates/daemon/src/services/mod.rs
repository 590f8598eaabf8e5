//! Service handlers and what the dispatcher needs to know about them.
//!
//! A service describes itself through [`Capabilities`]; every entry is
//! optional and falls back to a fixed default:
//!
//! | capability          | absent means                  |
//! |---------------------|-------------------------------|
//! | `supported_methods` | no action is callable         |
//! | `is_allow`          | the service is enabled        |
//! | `no_token_required` | every action needs a token    |

mod echo;
mod index;
mod registry;
mod root;

use async_trait::async_trait;
use protocol::status;
use protocol::{Expect, HeaderError, Payload, StrDict, ValueKind};
use serde_json::Value;
use thiserror::Error;

use crate::controller::Controller;
use crate::procedures::ProcedureError;
use crate::store::StoreError;

pub use echo::EchoService;
pub use index::IndexService;
pub use registry::{sanitize_path, Catalog, ServiceRegistry};
pub use root::{RootFactory, RootService};

/// Errors raised by services while handling a request.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("unexpected parameter: {0}")]
    UnexpectedParameter(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] HeaderError),

    #[error("invalid init parameters: {0}")]
    InvalidInit(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("{0} called before a controller was set")]
    Uninitialized(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("procedure error: {0}")]
    Procedure(#[from] ProcedureError),

    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    /// Status code reported to the peer.
    pub fn status_code(&self) -> i64 {
        match self {
            ServiceError::MissingParameter(_)
            | ServiceError::UnexpectedParameter(_)
            | ServiceError::InvalidParameter(_)
            | ServiceError::InvalidInit(_) => status::ECLIENT,
            ServiceError::ActionNotFound(_) => status::ENOACT,
            ServiceError::Store(err) => err.status_code(),
            _ => status::ESERVER,
        }
    }

    /// Message reported to the peer. Only client mistakes are spelled out.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            status::ECLIENT => self.to_string(),
            code => status::default_message(code).to_string(),
        }
    }
}

/// A single action name or a list of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Methods {
    One(String),
    Many(Vec<String>),
}

impl Methods {
    pub fn one(action: &str) -> Self {
        Methods::One(action.to_string())
    }

    pub fn many<'a>(actions: impl IntoIterator<Item = &'a str>) -> Self {
        Methods::Many(actions.into_iter().map(str::to_string).collect())
    }

    /// Scalar sets match by equality, lists by membership.
    pub fn contains(&self, action: &str) -> bool {
        match self {
            Methods::One(one) => one == action,
            Methods::Many(many) => many.iter().any(|m| m == action),
        }
    }
}

/// What a service declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supported_methods: Option<Methods>,
    pub is_allow: Option<bool>,
    pub no_token_required: Option<Methods>,
}

impl Capabilities {
    pub fn is_allowed(&self) -> bool {
        self.is_allow.unwrap_or(true)
    }

    pub fn supports(&self, action: &str) -> bool {
        self.supported_methods
            .as_ref()
            .is_some_and(|methods| methods.contains(action))
    }

    pub fn token_required(&self, action: &str) -> bool {
        !self
            .no_token_required
            .as_ref()
            .is_some_and(|methods| methods.contains(action))
    }
}

/// A declared action parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: &'static str,
    pub expect: Expect,
    pub required: bool,
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            expect: Expect::kind(kind),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            expect: Expect::kind(kind),
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn strict(mut self) -> Self {
        self.expect = self.expect.strict();
        self
    }
}

/// Checks `params` against the declared list, converting values where allowed.
pub fn bind_params(declared: &[Param], params: &StrDict) -> Result<StrDict, ServiceError> {
    if let Some((key, _)) = params
        .iter()
        .find(|(key, _)| !declared.iter().any(|p| p.name == key.as_str()))
    {
        return Err(ServiceError::UnexpectedParameter(key.clone()));
    }

    let mut bound = StrDict::new();
    for param in declared {
        match params.get(param.name) {
            Some(value) => {
                bound.insert(param.name, param.expect.check(param.name, value.clone())?);
            }
            None if param.required => {
                return Err(ServiceError::MissingParameter(param.name.to_string()))
            }
            None => {
                if let Some(default) = &param.default {
                    bound.insert(param.name, default.clone());
                }
            }
        }
    }
    Ok(bound)
}

/// A handler bound to one path.
///
/// A fresh instance is created for every request.
#[async_trait]
pub trait Service: Send {
    fn capabilities(&self) -> Capabilities;

    /// Whether the service implements `action`.
    fn has_action(&self, action: &str) -> bool;

    /// Parameters accepted by `action`.
    fn parameters(&self, _action: &str) -> Vec<Param> {
        Vec::new()
    }

    /// Receives the per-request controller. Services that don't need one ignore it.
    fn set_controller(&mut self, _controller: Controller) {}

    /// Runs before the action. Returning false skips the request.
    async fn initializer(&mut self) -> Result<bool, ServiceError> {
        Ok(true)
    }

    async fn call(&mut self, action: &str, params: StrDict) -> Result<Payload, ServiceError>;
}

/// Builds a service from the request's `init_params`.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn create(&self, init_params: &StrDict) -> Result<Box<dyn Service>, ServiceError>;
}

/// The always-present handler gating access and forwarding.
#[async_trait]
pub trait AdminService: Send {
    fn set_controller(&mut self, _controller: Controller) {}

    /// Decides whether a token-protected action may run.
    ///
    /// Implementations set the response status before returning false.
    async fn access(&mut self) -> Result<bool, ServiceError>;

    /// Serves a request whose path is not hosted here.
    async fn remote(&mut self) -> Result<Payload, ServiceError>;
}

/// Builds the administrative handler for one request.
pub trait AdminFactory: Send + Sync {
    fn create(&self) -> Box<dyn AdminService>;
}

impl<F> AdminFactory for F
where
    F: Fn() -> Box<dyn AdminService> + Send + Sync,
{
    fn create(&self) -> Box<dyn AdminService> {
        self()
    }
}

/// Registry with the built-in services: the root handler, `/echo` and the index.
pub fn builtin(index_name: &str, admin_name: &str) -> Result<ServiceRegistry, regex::Error> {
    let mut registry = ServiceRegistry::new(index_name, admin_name)?;
    registry.set_admin(RootFactory);
    registry.register_fn("echo", |_| Ok(Box::new(EchoService::new()) as Box<dyn Service>));
    let catalog = registry.catalog();
    registry.register_fn(index_name, move |_| {
        Ok(Box::new(IndexService::new(catalog.clone())) as Box<dyn Service>)
    });
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(value: Value) -> StrDict {
        StrDict::from_value(value).unwrap()
    }

    #[test]
    fn test_capability_defaults() {
        let caps = Capabilities::default();
        assert!(caps.is_allowed());
        assert!(caps.token_required("anything"));
        assert!(!caps.supports("anything"));
    }

    #[test]
    fn test_scalar_methods_match_by_equality() {
        let caps = Capabilities {
            supported_methods: Some(Methods::one("ping")),
            is_allow: Some(false),
            no_token_required: Some(Methods::many(["ping", "status"])),
        };
        assert!(caps.supports("ping"));
        assert!(!caps.supports("pin"));
        assert!(!caps.is_allowed());
        assert!(!caps.token_required("status"));
        assert!(caps.token_required("echo"));
    }

    #[test]
    fn test_bind_params_converts_and_defaults() {
        let declared = [
            Param::required("count", ValueKind::Int),
            Param::optional("label", ValueKind::Str).with_default(json!("none")),
        ];
        let bound = bind_params(&declared, &dict(json!({"count": "3"}))).unwrap();
        assert_eq!(bound.get("count"), Some(&json!(3)));
        assert_eq!(bound.get("label"), Some(&json!("none")));
    }

    #[test]
    fn test_bind_params_errors_name_the_key() {
        let declared = [Param::required("count", ValueKind::Int)];

        let err = bind_params(&declared, &dict(json!({}))).unwrap_err();
        assert_eq!(err.to_string(), "missing parameter: count");
        assert_eq!(err.status_code(), status::ECLIENT);

        let err = bind_params(&declared, &dict(json!({"count": "many"}))).unwrap_err();
        assert!(err.public_message().contains("count"));

        let err = bind_params(&declared, &dict(json!({"count": 1, "extra": 2}))).unwrap_err();
        assert!(matches!(err, ServiceError::UnexpectedParameter(ref k) if k == "extra"));
    }

    #[test]
    fn test_strict_param_refuses_conversion() {
        let declared = [Param::required("flag", ValueKind::Bool).strict()];
        assert!(bind_params(&declared, &dict(json!({"flag": "true"}))).is_err());
        assert!(bind_params(&declared, &dict(json!({"flag": true}))).is_ok());
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = ServiceError::Failed("disk on fire at /var/x".to_string());
        assert_eq!(err.status_code(), status::ESERVER);
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn test_token_limit_maps_to_its_status() {
        let err = ServiceError::from(StoreError::TokenLimit {
            userid: 4,
            limit: 1,
        });
        assert_eq!(err.status_code(), status::ETOKLIMIT);
        assert_eq!(err.public_message(), "token limit reached");
    }
}
