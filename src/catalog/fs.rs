use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::{Catalog, ServiceDescriptor};
use crate::types::ServiceName;

/// Descriptor file inside each service directory.
pub const METADATA_FILE: &str = "service.json";
/// Implementation entry point inside each service directory.
pub const IMPLEMENTATION_FILE: &str = "service.py";

const REQUIRED_FIELDS: [&str; 4] = ["name", "version", "api_routes", "dependencies"];

/// Catalog backed by a directory of service implementations.
///
/// Every sub-directory holding a valid `service.json` is a service; its
/// directory name is the service name.
pub struct FsCatalog {
    services_dir: PathBuf,
    services: RwLock<BTreeMap<ServiceName, Arc<ServiceDescriptor>>>,
}

impl FsCatalog {
    /// Create a catalog and run an initial scan.
    pub fn load(services_dir: impl Into<PathBuf>) -> Result<Self> {
        let catalog = Self {
            services_dir: services_dir.into(),
            services: RwLock::new(BTreeMap::new()),
        };
        catalog.rescan()?;
        Ok(catalog)
    }

    pub fn services_dir(&self) -> &Path {
        &self.services_dir
    }

    /// Re-read every descriptor from disk. Returns the number of valid services.
    pub fn rescan(&self) -> Result<usize> {
        info!("Scanning services directory {}", self.services_dir.display());

        let mut found = BTreeMap::new();
        if !self.services_dir.is_dir() {
            warn!(
                "Services directory {} does not exist",
                self.services_dir.display()
            );
        } else {
            for entry in fs::read_dir(&self.services_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let dir_name = entry.file_name().to_string_lossy().to_string();

                match parse_descriptor(&entry.path()) {
                    Some(mut descriptor) => {
                        descriptor.name = ServiceName::new(dir_name.clone());
                        info!(
                            service = %dir_name,
                            version = descriptor.version.as_deref().unwrap_or("unknown"),
                            "Loaded service"
                        );
                        found.insert(descriptor.name.clone(), Arc::new(descriptor));
                    }
                    None => warn!("Directory `{dir_name}` has no valid service definition"),
                }
            }
        }

        let count = found.len();
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        *services = found;
        info!("Service scan complete, {} valid services", count);
        Ok(count)
    }
}

/// Parse and validate `<dir>/service.json`. Invalid descriptors are logged and skipped.
fn parse_descriptor(dir: &Path) -> Option<ServiceDescriptor> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return None;
    }

    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Malformed {}: {}", path.display(), e);
            return None;
        }
    };

    for field in REQUIRED_FIELDS {
        if value.get(field).is_none() {
            warn!("{} is missing required field `{}`", path.display(), field);
            return None;
        }
    }

    match serde_json::from_value(value) {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            warn!("Invalid descriptor {}: {}", path.display(), e);
            None
        }
    }
}

impl Catalog for FsCatalog {
    fn list_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.values().cloned().collect()
    }

    fn get_service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.get(name).cloned()
    }

    fn implementation_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.services_dir.join(name).join(IMPLEMENTATION_FILE);
        path.exists().then_some(path)
    }

    fn reload(&self) -> Result<usize> {
        self.rescan()
    }
}
