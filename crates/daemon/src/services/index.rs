//! Service answering the root path.

use async_trait::async_trait;
use protocol::{Payload, StrDict};
use serde_json::Value;

use super::{Capabilities, Catalog, Methods, Service, ServiceError};

/// Lists the services hosted by this node.
pub struct IndexService {
    catalog: Catalog,
}

impl IndexService {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Service for IndexService {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported_methods: Some(Methods::one("list")),
            is_allow: None,
            no_token_required: Some(Methods::one("list")),
        }
    }

    fn has_action(&self, action: &str) -> bool {
        action == "list"
    }

    async fn call(&mut self, action: &str, _params: StrDict) -> Result<Payload, ServiceError> {
        if action != "list" {
            return Err(ServiceError::ActionNotFound(action.to_string()));
        }
        let names = self.catalog.names().into_iter().map(Value::from).collect();
        Ok(Payload::Packed(Value::Array(names)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{EchoService, ServiceRegistry};
    use serde_json::json;

    #[tokio::test]
    async fn test_lists_registered_services() {
        let registry = ServiceRegistry::new("index", "admin").unwrap();
        let catalog = registry.catalog();
        registry.register_fn("index", move |_| {
            Ok(Box::new(IndexService::new(catalog.clone())) as Box<dyn Service>)
        });
        registry.register_fn("echo", |_| Ok(Box::new(EchoService::new()) as Box<dyn Service>));

        let (_, factory) = registry.resolve("/").unwrap();
        let mut service = factory.create(&StrDict::new()).await.unwrap();
        let reply = service.call("list", StrDict::new()).await.unwrap();
        assert_eq!(reply, Payload::from(json!(["echo", "index"])));
    }
}
