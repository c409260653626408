//! Environment provisioning: one isolated runtime per service, with its
//! declared dependencies installed and independently verified.
//!
//! A service's source directory is `repo_dir/<repo_path>` when the descriptor
//! declares a `repo_path`, else `repo_dir/<service name>`. Its runtime lives
//! in `<source dir>/<runtime_dir_name>`.
//!
//! Verification never trusts the installer's exit code alone: after every
//! install the runtime's package inventory is listed and each declared
//! requirement is cross-checked against it.

pub mod manifest;
pub mod requirement;
pub mod runtime;

pub use manifest::{Manifest, ManifestKind, RequirementSet};
pub use requirement::{Requirement, canonicalize_name};
pub use runtime::{InstalledPackage, Runtime, RuntimeHandle, VenvRuntime};

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::ServiceName;
use crate::utils::KeyedLocks;

/// Provisioner-owned state for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentRecord {
    pub service_name: ServiceName,
    pub runtime_path: PathBuf,
    /// Interpreter present and declared dependencies verified.
    pub ready: bool,
}

/// Result of the read-only environment check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentStatus {
    pub runtime_exists: bool,
    pub dependencies_installed: bool,
    pub is_ready: bool,
    pub manifest_kind: Option<ManifestKind>,
}

pub struct Provisioner {
    catalog: Arc<dyn Catalog>,
    runtime: Arc<dyn Runtime>,
    repo_dir: PathBuf,
    runtime_dir_name: String,
    records: RwLock<HashMap<ServiceName, EnvironmentRecord>>,
    locks: KeyedLocks,
}

impl Provisioner {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        runtime: Arc<dyn Runtime>,
        repo_dir: impl Into<PathBuf>,
        runtime_dir_name: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            runtime,
            repo_dir: repo_dir.into(),
            runtime_dir_name: runtime_dir_name.into(),
            records: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Source directory of a service. Falls back to `repo_dir/<name>` when
    /// the catalog declares no override (or does not know the service).
    pub fn source_dir(&self, service_name: &str) -> PathBuf {
        match self
            .catalog
            .get_service(service_name)
            .and_then(|d| d.repo_path.clone())
        {
            Some(repo_path) => self.repo_dir.join(repo_path),
            None => self.repo_dir.join(service_name),
        }
    }

    pub fn runtime_path(&self, service_name: &str) -> PathBuf {
        self.source_dir(service_name).join(&self.runtime_dir_name)
    }

    /// The service's runtime, if one exists on disk.
    pub fn get_environment(&self, service_name: &str) -> Option<RuntimeHandle> {
        let handle = RuntimeHandle::new(self.runtime_path(service_name));
        handle.exists().then_some(handle)
    }

    /// Ensure the service has a runtime. Idempotent: an existing runtime is
    /// returned untouched.
    pub async fn provision(&self, service_name: &ServiceName) -> OrchestratorResult<RuntimeHandle> {
        let _guard = self.locks.lock(service_name).await;

        if let Some(handle) = self.get_environment(service_name.as_str()) {
            info!(service = %service_name, "Runtime already exists at {}", handle.root.display());
            self.touch_record(service_name, &handle, None).await;
            return Ok(handle);
        }

        let source_dir = self.source_dir(service_name.as_str());
        if !source_dir.is_dir() {
            error!(service = %service_name, "Source directory {} does not exist", source_dir.display());
            return Err(OrchestratorError::Provisioning(format!(
                "source directory {} for `{}` does not exist",
                source_dir.display(),
                service_name
            )));
        }

        let path = source_dir.join(&self.runtime_dir_name);
        let handle = self.runtime.create_runtime(&path).await.map_err(|e| {
            error!(service = %service_name, "Runtime creation failed: {e:#}");
            OrchestratorError::Provisioning(format!(
                "failed to create runtime at {}: {:#}",
                path.display(),
                e
            ))
        })?;

        info!(service = %service_name, "Runtime created at {}", handle.root.display());
        self.touch_record(service_name, &handle, Some(false)).await;
        Ok(handle)
    }

    /// Install the service's declared dependencies and verify them.
    ///
    /// Returns `false` when the runtime or manifest is missing, the installer
    /// fails, or the post-install inventory does not satisfy the manifest.
    /// Already-satisfied dependencies are not reinstalled. When the manifest
    /// has entries the inventory cannot confirm (editable installs, URLs,
    /// computed lists), the installer runs at least once per process.
    pub async fn install_dependencies(&self, service_name: &ServiceName) -> bool {
        let _guard = self.locks.lock(service_name).await;
        info!(service = %service_name, "Installing dependencies");

        let Some(handle) = self.get_environment(service_name.as_str()) else {
            error!(service = %service_name, "No runtime to install into");
            return false;
        };

        let source_dir = self.source_dir(service_name.as_str());
        let Some(manifest) = manifest::detect(&source_dir) else {
            warn!(service = %service_name, "No dependency manifest found in {}", source_dir.display());
            self.touch_record(service_name, &handle, Some(false)).await;
            return false;
        };
        info!(service = %service_name, "Using manifest {}", manifest.kind.file_name());

        let requirements = match manifest.requirements() {
            Ok(set) => set,
            Err(e) => {
                error!(service = %service_name, "Unreadable manifest: {e:#}");
                self.touch_record(service_name, &handle, Some(false)).await;
                return false;
            }
        };

        if !requirements.complete {
            warn!(
                service = %service_name,
                "Manifest has entries that cannot be verified against the inventory"
            );
        }

        if self.satisfied(service_name, &handle, &requirements).await {
            info!(service = %service_name, "Dependencies already satisfied");
            self.touch_record(service_name, &handle, Some(true)).await;
            return true;
        }

        match self.runtime.install_manifest(&handle, &manifest).await {
            Ok(0) => {}
            Ok(code) => {
                error!(service = %service_name, "Installer exited with code {}", code);
                self.touch_record(service_name, &handle, Some(false)).await;
                return false;
            }
            Err(e) => {
                error!(service = %service_name, "Installer failed: {e:#}");
                self.touch_record(service_name, &handle, Some(false)).await;
                return false;
            }
        }

        let ok = self.verify(service_name, &handle, &requirements.requirements).await;
        if ok {
            info!(service = %service_name, "Dependencies installed and verified");
        } else {
            error!(service = %service_name, "Dependency verification failed after install");
        }
        self.touch_record(service_name, &handle, Some(ok)).await;
        ok
    }

    /// Read-only check. Never creates, installs or updates records.
    ///
    /// When the manifest has entries the inventory cannot confirm, readiness
    /// additionally requires a successful install recorded by this process.
    pub async fn check_environment(&self, service_name: &ServiceName) -> EnvironmentStatus {
        let source_dir = self.source_dir(service_name.as_str());
        let manifest = manifest::detect(&source_dir);
        let mut status = EnvironmentStatus {
            manifest_kind: manifest.as_ref().map(|m| m.kind),
            ..Default::default()
        };

        let Some(handle) = self.get_environment(service_name.as_str()) else {
            warn!(service = %service_name, "Runtime does not exist");
            return status;
        };
        status.runtime_exists = true;

        let Some(manifest) = manifest else {
            warn!(service = %service_name, "No dependency manifest found");
            return status;
        };

        status.dependencies_installed = match manifest.requirements() {
            Ok(set) => self.satisfied(service_name, &handle, &set).await,
            Err(e) => {
                warn!(service = %service_name, "Unreadable manifest: {e:#}");
                false
            }
        };
        status.is_ready = status.runtime_exists && status.dependencies_installed;

        if status.is_ready {
            info!(service = %service_name, "Environment ready");
        } else {
            warn!(service = %service_name, "Environment not ready");
        }
        status
    }

    pub async fn record(&self, service_name: &str) -> Option<EnvironmentRecord> {
        self.records.read().await.get(service_name).cloned()
    }

    pub async fn records(&self) -> Vec<EnvironmentRecord> {
        let mut out: Vec<_> = self.records.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        out
    }

    /// Whether the environment already meets `set`. A set the inventory
    /// cannot fully confirm also needs a successful install recorded by this
    /// process.
    async fn satisfied(&self, service_name: &ServiceName, handle: &RuntimeHandle, set: &RequirementSet) -> bool {
        if !self.verify(service_name, handle, &set.requirements).await {
            return false;
        }
        set.is_conclusive() || self.record(service_name.as_str()).await.is_some_and(|r| r.ready)
    }

    /// Cross-check `requirements` against the runtime's own inventory.
    async fn verify(
        &self,
        service_name: &ServiceName,
        handle: &RuntimeHandle,
        requirements: &[Requirement],
    ) -> bool {
        let installed = match self.runtime.list_installed_packages(handle).await {
            Ok(pkgs) => pkgs,
            Err(e) => {
                warn!(service = %service_name, "Could not list installed packages: {e:#}");
                return false;
            }
        };

        let unmet = unmet_requirements(requirements, &installed);
        for problem in &unmet {
            warn!(service = %service_name, "Unmet requirement: {}", problem);
        }
        unmet.is_empty()
    }

    /// Create or update the record; `ready = None` keeps the current flag.
    async fn touch_record(&self, service_name: &ServiceName, handle: &RuntimeHandle, ready: Option<bool>) {
        let mut records = self.records.write().await;
        let record = records
            .entry(service_name.clone())
            .or_insert_with(|| EnvironmentRecord {
                service_name: service_name.clone(),
                runtime_path: handle.root.clone(),
                ready: false,
            });
        record.runtime_path = handle.root.clone();
        if let Some(ready) = ready {
            record.ready = ready && handle.exists();
        }
    }
}

/// Human-readable description of every requirement the inventory fails.
pub fn unmet_requirements(requirements: &[Requirement], installed: &[InstalledPackage]) -> Vec<String> {
    let inventory: HashMap<String, &str> = installed
        .iter()
        .map(|p| (canonicalize_name(&p.name), p.version.as_str()))
        .collect();

    requirements
        .iter()
        .filter_map(|req| match inventory.get(&req.name) {
            None => Some(format!("{} is not installed", req)),
            Some(version) if !req.is_satisfied_by(version) => {
                Some(format!("{} required, {} installed", req, version))
            }
            Some(_) => None,
        })
        .collect()
}
