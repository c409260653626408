// Core modules
mod config;
mod error;
mod types;
mod utils;

pub mod api;
pub mod catalog;
pub mod environment;
pub mod orchestrator;
pub mod process;

// Re-export key types and functions
pub use config::{OrchestratorConfig, PortConflictPolicy, RetryPolicy, resolve_config_path};
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use types::ServiceName;

pub use catalog::{ApiRoute, Catalog, FsCatalog, ServiceDescriptor, StaticCatalog};
pub use environment::{EnvironmentRecord, EnvironmentStatus, Provisioner, Runtime, VenvRuntime};
pub use orchestrator::{Orchestrator, ServiceSummary};
pub use process::{
    CommandLauncher, InstanceStatus, Launcher, LifecycleManager, LifecycleState, PortReclaimer,
    ProcessHandle, RunningInstance, StartReport, SystemReclaimer,
};

use anyhow::Result;
use std::sync::Arc;

/// Convenience function to build a production orchestrator from the resolved
/// configuration file (or defaults).
pub fn create_orchestrator() -> Result<Arc<Orchestrator>> {
    let config = OrchestratorConfig::load()?;
    Ok(Arc::new(Orchestrator::from_config(config)?))
}
