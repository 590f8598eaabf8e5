//! `/echo`: liveness and identity checks.

use async_trait::async_trait;
use protocol::{Payload, StrDict, ValueKind};
use serde_json::json;

use super::{Capabilities, Methods, Param, Service, ServiceError};
use crate::controller::Controller;

/// Answers `ping`, mirrors `echo` and reports who is calling with `status`.
#[derive(Debug, Default)]
pub struct EchoService {
    controller: Option<Controller>,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    fn controller(&self) -> Result<&Controller, ServiceError> {
        self.controller
            .as_ref()
            .ok_or(ServiceError::Uninitialized("echo"))
    }
}

#[async_trait]
impl Service for EchoService {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported_methods: Some(Methods::many(["ping", "echo", "status"])),
            is_allow: Some(true),
            no_token_required: Some(Methods::one("status")),
        }
    }

    fn has_action(&self, action: &str) -> bool {
        matches!(action, "ping" | "echo" | "status")
    }

    fn parameters(&self, action: &str) -> Vec<Param> {
        match action {
            "echo" => vec![Param::optional("message", ValueKind::Str)],
            _ => Vec::new(),
        }
    }

    fn set_controller(&mut self, controller: Controller) {
        self.controller = Some(controller);
    }

    async fn call(&mut self, action: &str, params: StrDict) -> Result<Payload, ServiceError> {
        match action {
            "ping" => Ok(Payload::from(json!("pong"))),
            "echo" => match params.get("message") {
                Some(message) => Ok(Payload::from(message.clone())),
                None => Ok(self.controller()?.body().clone()),
            },
            "status" => {
                let request = self.controller()?.request();
                Ok(Payload::from(json!({
                    "username": request.username,
                    "userid": request.userid,
                    "guest": request.is_guest,
                })))
            }
            other => Err(ServiceError::ActionNotFound(other.to_string())),
        }
    }
}
