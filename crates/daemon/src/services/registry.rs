//! Path to service lookup.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use protocol::StrDict;
use regex::Regex;

use super::{AdminFactory, Service, ServiceError, ServiceFactory};

/// Strips everything that could escape the service tree.
///
/// Empty, `.` and `..` segments are dropped, and each segment keeps only
/// ASCII letters, digits, `_`, `-` and `.`. The result has no leading `/`.
pub fn sanitize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .map(|segment| {
            segment
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                .collect::<String>()
        })
        .filter(|segment| !segment.is_empty() && segment.chars().any(|c| c != '.'))
        .collect::<Vec<_>>()
        .join("/")
}

struct FnFactory<F>(F);

#[async_trait]
impl<F> ServiceFactory for FnFactory<F>
where
    F: Fn(&StrDict) -> Result<Box<dyn Service>, ServiceError> + Send + Sync,
{
    async fn create(&self, init_params: &StrDict) -> Result<Box<dyn Service>, ServiceError> {
        (self.0)(init_params)
    }
}

/// Services hosted by this node.
pub struct ServiceRegistry {
    services: Arc<DashMap<String, Arc<dyn ServiceFactory>>>,
    admin: Option<Arc<dyn AdminFactory>>,
    index_name: String,
    admin_name: String,
    admin_pattern: Regex,
}

impl ServiceRegistry {
    /// An empty registry. `index_name` answers `/`; `admin_name` is never addressable.
    pub fn new(index_name: &str, admin_name: &str) -> Result<Self, regex::Error> {
        let admin_pattern = Regex::new(&format!(r"^{}(?:/|$)", regex::escape(admin_name)))?;
        Ok(Self {
            services: Arc::new(DashMap::new()),
            admin: None,
            index_name: index_name.to_string(),
            admin_name: admin_name.to_string(),
            admin_pattern,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn admin_name(&self) -> &str {
        &self.admin_name
    }

    /// Registers `factory` under `name` (sanitized), replacing any previous entry.
    pub fn register(&self, name: &str, factory: impl ServiceFactory + 'static) {
        let name = sanitize_path(name);
        tracing::debug!(service = %name, "registered service");
        self.services.insert(name, Arc::new(factory));
    }

    /// Registers a plain constructor.
    pub fn register_fn<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&StrDict) -> Result<Box<dyn Service>, ServiceError> + Send + Sync + 'static,
    {
        self.register(name, FnFactory(constructor));
    }

    pub fn set_admin(&mut self, factory: impl AdminFactory + 'static) {
        self.admin = Some(Arc::new(factory));
    }

    pub fn admin(&self) -> Option<Arc<dyn AdminFactory>> {
        self.admin.clone()
    }

    /// Sorted names of the hosted services.
    pub fn names(&self) -> Vec<String> {
        catalog(&self.services)
    }

    /// Live view of the service names, for listing services.
    pub fn catalog(&self) -> Catalog {
        Catalog(self.services.clone())
    }

    /// Service name a request path refers to.
    pub fn service_name(&self, path: &str) -> String {
        match sanitize_path(path) {
            name if name.is_empty() => self.index_name.clone(),
            name => name,
        }
    }

    /// Whether `path` addresses the administrative service.
    pub fn is_admin_path(&self, path: &str) -> bool {
        self.admin_pattern.is_match(&sanitize_path(path))
    }

    /// Local factory for `path`, if this node hosts it.
    pub fn resolve(&self, path: &str) -> Option<(String, Arc<dyn ServiceFactory>)> {
        if self.is_admin_path(path) {
            return None;
        }
        let name = self.service_name(path);
        let factory = self.services.get(&name).map(|entry| entry.value().clone())?;
        Some((name, factory))
    }
}

/// Names of the services of a registry.
#[derive(Clone)]
pub struct Catalog(Arc<DashMap<String, Arc<dyn ServiceFactory>>>);

impl Catalog {
    pub fn names(&self) -> Vec<String> {
        catalog(&self.0)
    }
}

fn catalog(services: &DashMap<String, Arc<dyn ServiceFactory>>) -> Vec<String> {
    let mut names: Vec<String> = services.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .field("index_name", &self.index_name)
            .field("admin_name", &self.admin_name)
            .field("has_admin", &self.admin.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::EchoService;

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new("index", "admin").unwrap();
        registry.register_fn("echo", |_| Ok(Box::new(EchoService::new()) as Box<dyn Service>));
        registry.register_fn("index", |_| Ok(Box::new(EchoService::new()) as Box<dyn Service>));
        registry
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/echo"), "echo");
        assert_eq!(sanitize_path("//files/../../etc/./passwd"), "files/etc/passwd");
        assert_eq!(sanitize_path("/a b/c;d"), "ab/cd");
        assert_eq!(sanitize_path("/"), "");
        assert_eq!(sanitize_path("/.../x"), "x");
    }

    #[test]
    fn test_root_resolves_to_index() {
        let registry = registry();
        let (name, _) = registry.resolve("/").unwrap();
        assert_eq!(name, "index");
    }

    #[test]
    fn test_unknown_path_is_not_local() {
        let registry = registry();
        assert!(registry.resolve("/files").is_none());
        assert!(registry.resolve("/echo/sub").is_none());
        assert!(registry.resolve("/echo").is_some());
    }

    #[test]
    fn test_admin_path_variants_detected() {
        let registry = registry();
        for path in ["/admin", "admin", "//admin/", "/./admin/users", "/../admin"] {
            assert!(registry.is_admin_path(path), "{path}");
            assert!(registry.resolve(path).is_none());
        }
        assert!(!registry.is_admin_path("/administrator"));
        assert!(!registry.is_admin_path("/echo/admin"));
    }

    #[test]
    fn test_catalog_sees_later_registrations() {
        let registry = registry();
        let catalog = registry.catalog();
        registry.register_fn("zeta", |_| Ok(Box::new(EchoService::new()) as Box<dyn Service>));
        assert_eq!(catalog.names(), vec!["echo", "index", "zeta"]);
    }
}
