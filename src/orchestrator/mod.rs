//! The orchestrator facade: one object exposing the whole Manager API
//! (provisioning plus lifecycle) over an explicitly injected catalog,
//! runtime, launcher and port reclaimer.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{Catalog, FsCatalog, ServiceDescriptor};
use crate::config::OrchestratorConfig;
use crate::environment::{
    EnvironmentRecord, EnvironmentStatus, Provisioner, Runtime, RuntimeHandle, VenvRuntime,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::process::{
    CommandLauncher, InstanceStatus, Launcher, LifecycleManager, LifecycleState, PortReclaimer,
    StartReport, SystemReclaimer,
};
use crate::types::ServiceName;

/// Listing entry combining the descriptor with live lifecycle data.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub name: ServiceName,
    pub version: Option<String>,
    pub routes: Vec<String>,
    pub state: LifecycleState,
    pub port: Option<u16>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<dyn Catalog>,
    provisioner: Arc<Provisioner>,
    manager: LifecycleManager,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        catalog: Arc<dyn Catalog>,
        runtime: Arc<dyn Runtime>,
        launcher: Arc<dyn Launcher>,
        reclaimer: Arc<dyn PortReclaimer>,
    ) -> OrchestratorResult<Self> {
        let provisioner = Arc::new(Provisioner::new(
            catalog.clone(),
            runtime,
            &config.repo_dir,
            &config.runtime_dir_name,
        ));
        let manager = LifecycleManager::new(
            config.clone(),
            catalog.clone(),
            provisioner.clone(),
            launcher,
            reclaimer,
        )?;

        Ok(Self {
            config,
            catalog,
            provisioner,
            manager,
        })
    }

    /// Production wiring: services discovered on disk, Python virtual
    /// environments, real OS processes.
    pub fn from_config(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(FsCatalog::load(&config.services_dir)?);
        let runtime = Arc::new(VenvRuntime::new(
            config.python.clone(),
            config.upgrade_installer,
            config.install_timeout,
        ));
        let orchestrator = Self::new(
            config,
            catalog,
            runtime,
            Arc::new(CommandLauncher::new()),
            Arc::new(SystemReclaimer::default()),
        )?;
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn list_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.catalog.list_services()
    }

    pub fn get_service(&self, name: &str) -> OrchestratorResult<Arc<ServiceDescriptor>> {
        self.catalog
            .get_service(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service `{}`", name)))
    }

    pub async fn summaries(&self) -> Vec<ServiceSummary> {
        let mut out = Vec::new();
        for descriptor in self.catalog.list_services() {
            let name = descriptor.name.as_str();
            let port = self.manager.get_status(name).await.map(|s| s.port);
            out.push(ServiceSummary {
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                routes: descriptor.api_routes.iter().map(|r| r.path.clone()).collect(),
                state: self.manager.lifecycle_state(name).await,
                port,
            });
        }
        out
    }

    /// Re-read the catalog's backing store.
    pub fn reload_catalog(&self) -> OrchestratorResult<usize> {
        let count = self.catalog.reload()?;
        info!("Catalog reloaded, {} services", count);
        Ok(count)
    }

    /// A service is valid when both its descriptor and its implementation
    /// entry point resolve.
    pub fn validate_service(&self, name: &str) -> bool {
        if self.catalog.get_service(name).is_none() {
            warn!(service = %name, "Service has no descriptor");
            return false;
        }
        if self.catalog.implementation_path(name).is_none() {
            warn!(service = %name, "Service has no implementation entry point");
            return false;
        }
        true
    }

    pub async fn check_environment(&self, name: &str) -> EnvironmentStatus {
        self.provisioner.check_environment(&ServiceName::new(name)).await
    }

    pub async fn provision(&self, name: &str) -> OrchestratorResult<RuntimeHandle> {
        self.provisioner.provision(&ServiceName::new(name)).await
    }

    pub async fn install_dependencies(&self, name: &str) -> bool {
        self.provisioner.install_dependencies(&ServiceName::new(name)).await
    }

    pub async fn environment_record(&self, name: &str) -> Option<EnvironmentRecord> {
        self.provisioner.record(name).await
    }

    pub async fn start(&self, name: &str, overrides: &Map<String, Value>) -> OrchestratorResult<StartReport> {
        self.manager.start(name, overrides).await
    }

    pub async fn stop(&self, name: &str) -> bool {
        self.manager.stop(name).await
    }

    pub async fn get_status(&self, name: &str) -> Option<InstanceStatus> {
        self.manager.get_status(name).await
    }

    pub async fn lifecycle_state(&self, name: &str) -> LifecycleState {
        self.manager.lifecycle_state(name).await
    }

    pub async fn execute(&self, name: &str, params: &Value) -> OrchestratorResult<Value> {
        self.manager.execute(name, params).await
    }

    /// Stop every running service; used on shutdown.
    pub async fn stop_all(&self) -> Vec<ServiceName> {
        let stopped = self.manager.stop_all().await;
        if !stopped.is_empty() {
            info!("Stopped {} services", stopped.len());
        }
        stopped
    }
}
