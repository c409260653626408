//! Read-only source of service descriptors.
//!
//! The engine only consumes the [`Catalog`] trait. [`FsCatalog`] discovers
//! services on disk, [`StaticCatalog`] is an in-memory variant for embedding
//! and tests.

mod fs;
mod model;

pub use fs::{FsCatalog, IMPLEMENTATION_FILE, METADATA_FILE};
pub use model::{ApiRoute, EnvironmentSpec, PORT_VAR, ServiceDescriptor, env_value_to_string};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::ServiceName;

/// Supplies immutable service descriptors and their implementation entry points.
pub trait Catalog: Send + Sync {
    /// All known services, ordered by name.
    fn list_services(&self) -> Vec<Arc<ServiceDescriptor>>;

    fn get_service(&self, name: &str) -> Option<Arc<ServiceDescriptor>>;

    /// Path of the service's implementation entry point, if it exists.
    fn implementation_path(&self, name: &str) -> Option<PathBuf>;

    /// Re-read descriptors from the backing store; returns the service count.
    fn reload(&self) -> anyhow::Result<usize> {
        Ok(self.list_services().len())
    }
}

struct StaticEntry {
    descriptor: Arc<ServiceDescriptor>,
    entry_point: Option<PathBuf>,
}

/// In-memory catalog built up front.
#[derive(Default)]
pub struct StaticCatalog {
    services: BTreeMap<ServiceName, StaticEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor and, optionally, its entry point.
    pub fn with_service(mut self, descriptor: ServiceDescriptor, entry_point: Option<PathBuf>) -> Self {
        self.services.insert(
            descriptor.name.clone(),
            StaticEntry {
                descriptor: Arc::new(descriptor),
                entry_point,
            },
        );
        self
    }
}

impl Catalog for StaticCatalog {
    fn list_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.services.values().map(|e| e.descriptor.clone()).collect()
    }

    fn get_service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).map(|e| e.descriptor.clone())
    }

    fn implementation_path(&self, name: &str) -> Option<PathBuf> {
        self.services.get(name).and_then(|e| e.entry_point.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog_lookup() {
        let catalog = StaticCatalog::new()
            .with_service(ServiceDescriptor::new("ocr"), None)
            .with_service(
                ServiceDescriptor::new("calc"),
                Some(PathBuf::from("/srv/services/calc/service.py")),
            );

        let names: Vec<_> = catalog
            .list_services()
            .iter()
            .map(|d| d.name.to_string())
            .collect();
        assert_eq!(names, vec!["calc", "ocr"]);

        assert!(catalog.get_service("calc").is_some());
        assert!(catalog.get_service("missing").is_none());
        assert!(catalog.implementation_path("ocr").is_none());
        assert_eq!(
            catalog.implementation_path("calc"),
            Some(PathBuf::from("/srv/services/calc/service.py"))
        );
    }
}
