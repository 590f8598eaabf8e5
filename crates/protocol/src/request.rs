//! Typed view of the routing headers carried by every request.

use serde_json::Value;

use crate::crypto::{token_hash, RealUser};
use crate::error::{ProtocolError, Result};
use crate::headers::{HeaderError, Headers, StrDict};

/// Header keys understood by the dispatcher.
pub mod keys {
    pub const PATH: &str = "path";
    pub const ACTION: &str = "action";
    pub const TOKEN: &str = "token";
    pub const PARAMS: &str = "params";
    pub const INIT_PARAMS: &str = "init_params";
    pub const FORCE: &str = "force";
    pub const NODE: &str = "node";
    pub const IS_PACKED: &str = "is_packed";
    /// Set on node-to-node requests whose body is hybrid sealed; holds the inner packing.
    pub const HYBRID: &str = "hybrid";
}

/// A peer node address pinned by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub port: u16,
}

impl Node {
    /// Validates an address/port pair. Port zero is rejected.
    pub fn new(address: impl Into<String>, port: i64) -> std::result::Result<Self, HeaderError> {
        let address = address.into();
        if address.is_empty() || !(1..=65535).contains(&port) {
            return Err(node_error());
        }
        Ok(Self {
            address,
            port: port as u16,
        })
    }

    fn from_value(value: &Value) -> std::result::Result<Option<Self>, HeaderError> {
        match value {
            Value::Null => Ok(None),
            Value::Array(items) if items.is_empty() => Ok(None),
            Value::Array(items) if items.len() == 2 => {
                let address = items[0].as_str().ok_or_else(node_error)?;
                let port = items[1].as_i64().ok_or_else(node_error)?;
                Node::new(address, port).map(Some)
            }
            _ => Err(node_error()),
        }
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![Value::from(self.address.clone()), Value::from(self.port)])
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

fn node_error() -> HeaderError {
    HeaderError::Type {
        key: keys::NODE.to_string(),
        expected: "empty or (address, port 1-65535)".to_string(),
    }
}

/// Accepts booleans and integers only.
fn bool_field(
    key: &str,
    value: Option<&Value>,
    default: bool,
) -> std::result::Result<bool, HeaderError> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.as_f64() != Some(0.0)),
        Some(_) => Err(HeaderError::Type {
            key: key.to_string(),
            expected: "bool or int".to_string(),
        }),
    }
}

/// Normalizes a path so it always starts with `/`.
pub fn normalize_path(path: Option<&str>) -> String {
    match path {
        None | Some("") => "/".to_string(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
    }
}

/// Routing headers of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeaders {
    path: String,
    action: String,
    token: Option<String>,
    token_hash: Option<String>,
    params: StrDict,
    init_params: StrDict,
    force: bool,
    node: Option<Node>,
    is_packed: bool,
}

impl RequestHeaders {
    /// A request for `action` on `path` with every other field defaulted.
    pub fn new(path: &str, action: &str) -> Self {
        Self {
            path: normalize_path(Some(path)),
            action: action.to_string(),
            token: None,
            token_hash: None,
            params: StrDict::new(),
            init_params: StrDict::new(),
            force: false,
            node: None,
            is_packed: true,
        }
    }

    /// Parses and validates a decoded header map.
    ///
    /// A missing `path` or `action` is reported as [`ProtocolError::MissingRoute`].
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let action = match headers.get(keys::ACTION) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Null) | None => return Err(ProtocolError::MissingRoute(keys::ACTION)),
            Some(Value::String(_)) => return Err(ProtocolError::MissingRoute(keys::ACTION)),
            Some(_) => {
                return Err(HeaderError::Type {
                    key: keys::ACTION.to_string(),
                    expected: "str".to_string(),
                }
                .into())
            }
        };
        let path = match headers.get(keys::PATH) {
            Some(Value::String(s)) => normalize_path(Some(s)),
            Some(Value::Null) | None => return Err(ProtocolError::MissingRoute(keys::PATH)),
            Some(_) => {
                return Err(HeaderError::Type {
                    key: keys::PATH.to_string(),
                    expected: "str".to_string(),
                }
                .into())
            }
        };

        let mut request = Self::new(&path, &action);
        match headers.get(keys::TOKEN) {
            None | Some(Value::Null) => {}
            Some(Value::String(token)) => request.set_token(Some(token.clone()))?,
            Some(_) => {
                return Err(HeaderError::Type {
                    key: keys::TOKEN.to_string(),
                    expected: "str".to_string(),
                }
                .into())
            }
        }
        request.params =
            StrDict::from_value(headers.get(keys::PARAMS).cloned().unwrap_or(Value::Null))?;
        request.init_params =
            StrDict::from_value(headers.get(keys::INIT_PARAMS).cloned().unwrap_or(Value::Null))?;
        request.force = bool_field(keys::FORCE, headers.get(keys::FORCE), false)?;
        request.is_packed = bool_field(keys::IS_PACKED, headers.get(keys::IS_PACKED), true)?;
        let node = match headers.get(keys::NODE) {
            Some(value) => Node::from_value(value)?,
            None => None,
        };
        // A pinned node without `force` is validated, then dropped.
        request.node = if request.force { node } else { None };
        Ok(request)
    }

    /// Serializes back into a header bag.
    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.set(keys::PATH, self.path.clone());
        headers.set(keys::ACTION, self.action.clone());
        headers.set(
            keys::TOKEN,
            self.token.clone().map(Value::from).unwrap_or(Value::Null),
        );
        headers.set(keys::PARAMS, self.params.to_value());
        headers.set(keys::INIT_PARAMS, self.init_params.to_value());
        headers.set(keys::FORCE, self.force);
        headers.set(
            keys::NODE,
            self.node
                .as_ref()
                .map(Node::to_value)
                .unwrap_or_else(|| Value::Array(Vec::new())),
        );
        headers.set(keys::IS_PACKED, self.is_packed);
        headers
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sets the path; `None` means the index `/`.
    pub fn set_path(&mut self, path: Option<&str>) {
        self.path = normalize_path(path);
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = action.into();
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Digest of the token as stored server side.
    pub fn token_hash(&self) -> Option<&str> {
        self.token_hash.as_deref()
    }

    /// Sets the token and refreshes its cached digest.
    pub fn set_token(&mut self, token: Option<String>) -> Result<()> {
        match token {
            Some(token) => {
                let hash = token_hash(&token).map_err(|_| HeaderError::Type {
                    key: keys::TOKEN.to_string(),
                    expected: "hex str".to_string(),
                })?;
                self.token = Some(token);
                self.token_hash = Some(hash);
            }
            None => {
                self.token = None;
                self.token_hash = None;
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &StrDict {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut StrDict {
        &mut self.params
    }

    pub fn init_params(&self) -> &StrDict {
        &self.init_params
    }

    pub fn init_params_mut(&mut self) -> &mut StrDict {
        &mut self.init_params
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    /// The pinned node; only honoured when `force` is set.
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn set_node(&mut self, node: Option<Node>) {
        self.node = node;
    }

    pub fn is_packed(&self) -> bool {
        self.is_packed
    }

    pub fn set_packed(&mut self, packed: bool) {
        self.is_packed = packed;
    }
}

/// One decoded client turn together with who sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub headers: RequestHeaders,
    pub real_user: RealUser,
    pub username: String,
    pub userid: Option<i64>,
    pub is_guest: bool,
    pub address: Option<std::net::SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(value: Value) -> Headers {
        Headers::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_action_or_path_is_terminal() {
        let err = RequestHeaders::from_headers(&headers(json!({"path": "/echo"}))).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingRoute("action")));

        let err = RequestHeaders::from_headers(&headers(json!({"action": "ping"}))).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingRoute("path")));
    }

    #[test]
    fn test_path_is_normalized() {
        let req =
            RequestHeaders::from_headers(&headers(json!({"path": "echo", "action": "ping"})))
                .unwrap();
        assert_eq!(req.path(), "/echo");

        let mut req = RequestHeaders::new("/a", "x");
        req.set_path(None);
        assert_eq!(req.path(), "/");
    }

    #[test]
    fn test_token_hash_follows_token() {
        let mut req = RequestHeaders::new("/", "x");
        req.set_token(Some("abcd".to_string())).unwrap();
        assert_eq!(req.token_hash().map(str::len), Some(64));
        req.set_token(None).unwrap();
        assert_eq!(req.token_hash(), None);
        assert!(req.set_token(Some("zz".to_string())).is_err());
    }

    #[test]
    fn test_node_validation() {
        let ok = headers(json!({
            "path": "/",
            "action": "a",
            "force": true,
            "node": ["10.0.0.1", 17000],
        }));
        let req = RequestHeaders::from_headers(&ok).unwrap();
        assert_eq!(req.node(), Some(&Node::new("10.0.0.1", 17000).unwrap()));

        for bad in [json!(["h", 0]), json!(["h", 65536]), json!(["h"]), json!("h:1")] {
            let h = headers(json!({"path": "/", "action": "a", "node": bad}));
            assert!(RequestHeaders::from_headers(&h).is_err());
        }

        let empty = headers(json!({"path": "/", "action": "a", "node": []}));
        assert_eq!(RequestHeaders::from_headers(&empty).unwrap().node(), None);
    }

    #[test]
    fn test_node_is_ignored_without_force() {
        let h = headers(json!({"path": "/", "action": "a", "node": ["10.0.0.1", 17000]}));
        let req = RequestHeaders::from_headers(&h).unwrap();
        assert!(!req.force());
        assert_eq!(req.node(), None);
        assert_eq!(req.to_headers().get("node"), Some(&json!([])));

        // Still validated, so a malformed node is reported either way.
        let h = headers(json!({"path": "/", "action": "a", "node": ["h", 0]}));
        assert!(RequestHeaders::from_headers(&h).is_err());
    }

    #[test]
    fn test_bool_fields_accept_int_and_bool_only() {
        let h = headers(json!({"path": "/", "action": "a", "force": 1, "is_packed": false}));
        let req = RequestHeaders::from_headers(&h).unwrap();
        assert!(req.force());
        assert!(!req.is_packed());

        let h = headers(json!({"path": "/", "action": "a", "force": "yes"}));
        assert!(RequestHeaders::from_headers(&h).is_err());
    }

    #[test]
    fn test_to_headers_reparses() {
        let mut req = RequestHeaders::new("/echo", "echo");
        req.params_mut().insert("text", json!("hi"));
        req.set_force(true);
        req.set_node(Some(Node::new("peer", 9000).unwrap()));
        let again = RequestHeaders::from_headers(&req.to_headers()).unwrap();
        assert_eq!(again, req);
    }
}
