//! Process lifecycle management.
//!
//! The [`LifecycleManager`] starts each service as an independent OS process
//! bound to its declared port, waits for the port to come up, performs the
//! `/init` handshake and tracks the resulting [`RunningInstance`]. At most
//! one start/stop transition is in flight per service name; the instance
//! table itself is only locked briefly so status queries never wait behind a
//! slow start.

pub mod client;
pub mod handle;
pub mod port;

pub use client::{INIT_PATH, ServiceClient};
pub use handle::{ChildProcess, CommandLauncher, LaunchSpec, Launcher, ProcessHandle, ProcessState};
pub use port::{PortReclaimer, SystemReclaimer, is_port_in_use};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, PORT_VAR, ServiceDescriptor, env_value_to_string};
use crate::config::{OrchestratorConfig, PortConflictPolicy};
use crate::environment::Provisioner;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::ServiceName;
use crate::utils::{KeyedLocks, read_tail};

/// Per-service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// A live child process registered for a service.
#[derive(Clone)]
pub struct RunningInstance {
    pub service_name: ServiceName,
    pub handle: Arc<dyn ProcessHandle>,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub state: LifecycleState,
}

/// Point-in-time view of a registered instance. `running` is checked live, not
/// cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub service_name: ServiceName,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub state: LifecycleState,
}

/// Outcome of a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub success: bool,
    pub port: u16,
    pub message: String,
}

pub struct LifecycleManager {
    config: OrchestratorConfig,
    catalog: Arc<dyn Catalog>,
    provisioner: Arc<Provisioner>,
    launcher: Arc<dyn Launcher>,
    reclaimer: Arc<dyn PortReclaimer>,
    client: ServiceClient,
    instances: RwLock<HashMap<ServiceName, RunningInstance>>,
    states: RwLock<HashMap<ServiceName, LifecycleState>>,
    transitions: KeyedLocks,
}

impl LifecycleManager {
    pub fn new(
        config: OrchestratorConfig,
        catalog: Arc<dyn Catalog>,
        provisioner: Arc<Provisioner>,
        launcher: Arc<dyn Launcher>,
        reclaimer: Arc<dyn PortReclaimer>,
    ) -> OrchestratorResult<Self> {
        let client = ServiceClient::new(config.host.clone(), config.http_timeout)?;
        Ok(Self {
            config,
            catalog,
            provisioner,
            launcher,
            reclaimer,
            client,
            instances: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            transitions: KeyedLocks::new(),
        })
    }

    /// Start a service and wait until it has accepted its `/init` handshake.
    ///
    /// `overrides` are merged over the declared environment variables
    /// (overrides win). `PORT` always comes from the descriptor. Starting a
    /// service that already has a live instance is a no-op that reports the
    /// existing port.
    pub async fn start(
        &self,
        service_name: &str,
        overrides: &Map<String, Value>,
    ) -> OrchestratorResult<StartReport> {
        let descriptor = self.catalog.get_service(service_name).ok_or_else(|| {
            error!(service = %service_name, "Unknown service");
            OrchestratorError::NotFound(format!("service `{}`", service_name))
        })?;
        let service = descriptor.name.clone();
        let _transition = self.transitions.lock(&service).await;

        if let Some(report) = self.reuse_existing(&service).await {
            return Ok(report);
        }

        let entry_point = self.catalog.implementation_path(service.as_str()).ok_or_else(|| {
            error!(service = %service, "Implementation entry point is missing");
            OrchestratorError::NotFound(format!("implementation entry point of `{}`", service))
        })?;
        let port = descriptor.declared_port().inspect_err(|e| {
            error!(service = %service, "{}", e);
        })?;

        self.set_state(&service, LifecycleState::Starting).await;
        info!(service = %service, port, "Starting service");

        match self.bring_up(&descriptor, &entry_point, port, overrides).await {
            Ok(handle) => {
                let instance = RunningInstance {
                    service_name: service.clone(),
                    handle,
                    port,
                    started_at: Utc::now(),
                    state: LifecycleState::Ready,
                };
                self.instances.write().await.insert(service.clone(), instance);
                self.set_state(&service, LifecycleState::Ready).await;
                info!(service = %service, port, "Service is ready");
                Ok(StartReport {
                    success: true,
                    port,
                    message: format!("Service started, listening on port {}", port),
                })
            }
            Err(e) => {
                self.set_state(&service, LifecycleState::Failed).await;
                error!(service = %service, "Start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Terminate a registered instance (graceful, then forced) and forget it.
    /// Returns `false` when nothing was registered.
    pub async fn stop(&self, service_name: &str) -> bool {
        let service = ServiceName::new(service_name);
        let _transition = self.transitions.lock(&service).await;

        let Some(instance) = self.instances.write().await.remove(service_name) else {
            debug!(service = %service, "Stop requested but no instance is registered");
            return false;
        };

        if !instance.handle.terminate(self.config.stop_timeout).await {
            warn!(service = %service, pid = ?instance.handle.id(), "Could not confirm process termination");
        }
        self.set_state(&service, LifecycleState::Stopped).await;
        info!(service = %service, "Service stopped");
        true
    }

    pub async fn get_status(&self, service_name: &str) -> Option<InstanceStatus> {
        let instance = self.instances.read().await.get(service_name).cloned()?;
        let (running, exit_code) = match instance.handle.state().await {
            ProcessState::Running => (true, None),
            ProcessState::Exited(code) => (false, code),
        };
        Some(InstanceStatus {
            service_name: instance.service_name,
            pid: instance.handle.id(),
            port: instance.port,
            started_at: instance.started_at,
            running,
            exit_code,
            state: if running { instance.state } else { LifecycleState::Failed },
        })
    }

    /// Last recorded transition. A `Ready` service whose process has died
    /// reports `Failed`.
    pub async fn lifecycle_state(&self, service_name: &str) -> LifecycleState {
        let recorded = self
            .states
            .read()
            .await
            .get(service_name)
            .copied()
            .unwrap_or(LifecycleState::NotStarted);

        if recorded == LifecycleState::Ready {
            if let Some(status) = self.get_status(service_name).await {
                return status.state;
            }
        }
        recorded
    }

    /// Invoke the service's first declared route with `params` as JSON body.
    pub async fn execute(&self, service_name: &str, params: &Value) -> OrchestratorResult<Value> {
        let instance = self.instances.read().await.get(service_name).cloned();
        let Some(instance) = instance else {
            error!(service = %service_name, "Execute requested but service is not running");
            return Err(OrchestratorError::NotRunning(service_name.to_string()));
        };
        if !instance.handle.is_alive().await {
            error!(service = %service_name, "Execute requested but the process has exited");
            return Err(OrchestratorError::NotRunning(service_name.to_string()));
        }

        let descriptor = self.catalog.get_service(service_name).ok_or_else(|| {
            OrchestratorError::NotFound(format!("service `{}`", service_name))
        })?;
        let route = descriptor.first_route().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "service `{}` declares no API routes",
                service_name
            ))
        })?;

        info!(service = %service_name, route = %route.path, "Executing service");
        self.client
            .post_json(instance.port, &route.path, params)
            .await
            .inspect_err(|e| error!(service = %service_name, "Execution failed: {}", e))
    }

    /// Names of services with a registered instance.
    pub async fn running_services(&self) -> Vec<ServiceName> {
        let mut names: Vec<_> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every registered instance; returns the names stopped.
    pub async fn stop_all(&self) -> Vec<ServiceName> {
        let mut stopped = Vec::new();
        for name in self.running_services().await {
            if self.stop(name.as_str()).await {
                stopped.push(name);
            }
        }
        stopped
    }

    async fn set_state(&self, service: &ServiceName, state: LifecycleState) {
        self.states.write().await.insert(service.clone(), state);
    }

    /// Report a live registered instance, or clear out a dead one.
    async fn reuse_existing(&self, service: &ServiceName) -> Option<StartReport> {
        let existing = self.instances.read().await.get(service).cloned()?;
        if existing.handle.is_alive().await {
            info!(service = %service, port = existing.port, "Service is already running");
            return Some(StartReport {
                success: true,
                port: existing.port,
                message: format!("Service already running on port {}", existing.port),
            });
        }

        warn!(service = %service, "Registered instance has exited, restarting");
        self.instances.write().await.remove(service);
        existing.handle.terminate(self.config.stop_timeout).await;
        None
    }

    /// Steps from port arbitration to a successful handshake. Any process
    /// launched here is terminated before an error is returned.
    async fn bring_up(
        &self,
        descriptor: &ServiceDescriptor,
        entry_point: &Path,
        port: u16,
        overrides: &Map<String, Value>,
    ) -> OrchestratorResult<Arc<dyn ProcessHandle>> {
        let service = &descriptor.name;
        self.arbitrate_port(service, port).await?;

        let spec = self.launch_spec(descriptor, entry_point, port, overrides);
        let handle = self.launcher.launch(&spec).await.map_err(|e| {
            OrchestratorError::Internal(format!("failed to launch `{}`: {:#}", service, e))
        })?;
        info!(service = %service, pid = ?handle.id(), log = %spec.log_file.display(), "Process launched");

        self.wait_until_up(service, handle.as_ref(), port, &spec.log_file).await?;
        self.handshake(descriptor, handle.as_ref(), port, &spec.log_file).await?;
        Ok(handle)
    }

    async fn arbitrate_port(&self, service: &ServiceName, port: u16) -> OrchestratorResult<()> {
        let host = self.config.host.as_str();
        if !is_port_in_use(host, port) {
            return Ok(());
        }

        if self.config.port_conflict == PortConflictPolicy::Fail {
            return Err(OrchestratorError::PortConflict {
                port,
                message: "port is in use and reclaiming is disabled".to_string(),
            });
        }

        info!(service = %service, port, "Port is occupied, terminating the occupant");
        let pids = self.reclaimer.reclaim(port).await.map_err(|e| OrchestratorError::PortConflict {
            port,
            message: format!("could not terminate the occupying process: {:#}", e),
        })?;

        let policy = self.config.reclaim;
        for _ in 0..policy.max_attempts {
            if !is_port_in_use(host, port) {
                info!(service = %service, port, ?pids, "Port reclaimed");
                return Ok(());
            }
            tokio::time::sleep(policy.interval()).await;
        }
        if !is_port_in_use(host, port) {
            return Ok(());
        }

        Err(OrchestratorError::PortConflict {
            port,
            message: format!("port still in use after terminating {:?}", pids),
        })
    }

    fn launch_spec(
        &self,
        descriptor: &ServiceDescriptor,
        entry_point: &Path,
        port: u16,
        overrides: &Map<String, Value>,
    ) -> LaunchSpec {
        let service = &descriptor.name;
        let env = merge_env(descriptor, overrides, port);

        let program = match self.provisioner.get_environment(service.as_str()) {
            Some(runtime) => runtime.interpreter(),
            None => {
                warn!(service = %service, "No provisioned runtime, using {}", self.config.python);
                PathBuf::from(&self.config.python)
            }
        };

        let port_str = port.to_string();
        let args = self
            .config
            .launch_args
            .iter()
            .map(|arg| {
                arg.replace("{service}", service.as_str())
                    .replace("{host}", &self.config.host)
                    .replace("{port}", &port_str)
            })
            .collect();

        LaunchSpec {
            service: service.clone(),
            program,
            args,
            env,
            cwd: entry_point
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            log_file: self.config.logs_dir.join(format!("{}.log", service)),
            host: self.config.host.clone(),
            port,
        }
    }

    /// Poll until the port is bound by a live process. An exited process
    /// fails immediately with its log tail.
    async fn wait_until_up(
        &self,
        service: &ServiceName,
        handle: &dyn ProcessHandle,
        port: u16,
        log_file: &Path,
    ) -> OrchestratorResult<()> {
        let policy = self.config.startup;
        for attempt in 1..=policy.max_attempts {
            if let ProcessState::Exited(code) = handle.state().await {
                let log_tail = read_tail(log_file, self.config.log_tail_bytes);
                error!(service = %service, ?code, "Process exited during startup: {}", log_tail);
                return Err(OrchestratorError::ProcessExited { code, log_tail });
            }

            if is_port_in_use(&self.config.host, port) && handle.is_alive().await {
                info!(service = %service, port, "Port is bound");
                return Ok(());
            }

            debug!(service = %service, "Waiting for service to start ({}/{})", attempt, policy.max_attempts);
            tokio::time::sleep(policy.interval()).await;
        }

        handle.terminate(self.config.stop_timeout).await;
        Err(OrchestratorError::StartupTimeout(format!(
            "`{}` did not bind port {} after {} attempts",
            service, port, policy.max_attempts
        )))
    }

    async fn handshake(
        &self,
        descriptor: &ServiceDescriptor,
        handle: &dyn ProcessHandle,
        port: u16,
        log_file: &Path,
    ) -> OrchestratorResult<()> {
        let service = &descriptor.name;
        let policy = self.config.handshake;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=policy.max_attempts {
            if !handle.is_alive().await {
                let log_tail = read_tail(log_file, self.config.log_tail_bytes);
                error!(service = %service, "Process exited during initialization");
                handle.terminate(self.config.stop_timeout).await;
                return Err(OrchestratorError::Handshake(format!(
                    "service process exited during initialization: {}",
                    log_tail
                )));
            }

            match self.client.init(port, descriptor).await {
                Ok(()) => {
                    info!(service = %service, "Initialization handshake succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        "Initialization attempt {}/{} failed: {}",
                        attempt,
                        policy.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval()).await;
            }
        }

        if !handle.terminate(self.config.stop_timeout).await {
            warn!(service = %service, pid = ?handle.id(), "Could not confirm process termination");
        }
        Err(OrchestratorError::Handshake(last_error))
    }
}

/// Declared variables overlaid with caller overrides. `PORT` is pinned to
/// the declared port.
fn merge_env(descriptor: &ServiceDescriptor, overrides: &Map<String, Value>, port: u16) -> BTreeMap<String, String> {
    let mut env = descriptor.declared_env_vars();
    for (key, value) in overrides {
        if key == PORT_VAR {
            warn!(service = %descriptor.name, "Ignoring {} override {}", PORT_VAR, value);
            continue;
        }
        env.insert(key.clone(), env_value_to_string(value));
    }
    env.insert(PORT_VAR.to_string(), port.to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ApiRoute, StaticCatalog};
    use crate::config::RetryPolicy;
    use crate::environment::{InstalledPackage, Manifest, Runtime, RuntimeHandle};
    use crate::error::ErrorKind;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::task::JoinHandle;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Bind the port and answer `/init` with the given status.
        Serve(StatusCode),
        /// Write a traceback to the log and exit.
        Crash(i32),
        /// Stay alive without ever binding.
        Hang,
        /// Bind the port and fail `/init` with 503 for the first N calls.
        FlakyInit(usize),
        /// Bind the port, then exit while answering the first `/init`.
        DieOnInit,
    }

    struct FakeProcess {
        alive: Arc<AtomicBool>,
        exit_code: Option<i32>,
        server: Mutex<Option<JoinHandle<()>>>,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn state(&self) -> ProcessState {
            if self.alive.load(Ordering::SeqCst) {
                ProcessState::Running
            } else {
                ProcessState::Exited(self.exit_code)
            }
        }

        async fn terminate(&self, _grace: Duration) -> bool {
            if let Some(server) = self.server.lock().unwrap().take() {
                server.abort();
            }
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.store(true, Ordering::SeqCst);
            true
        }
    }

    struct FakeLauncher {
        behavior: Behavior,
        launches: AtomicUsize,
        init_calls: Arc<AtomicUsize>,
        last_spec: Mutex<Option<LaunchSpec>>,
        last_process: Mutex<Option<Arc<FakeProcess>>>,
        terminated: Arc<AtomicBool>,
    }

    impl FakeLauncher {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                launches: AtomicUsize::new(0),
                init_calls: Arc::new(AtomicUsize::new(0)),
                last_spec: Mutex::new(None),
                last_process: Mutex::new(None),
                terminated: Arc::new(AtomicBool::new(false)),
            }
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn init_calls(&self) -> usize {
            self.init_calls.load(Ordering::SeqCst)
        }

        fn terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }

        /// Kill the last launched process behind the manager's back.
        fn crash(&self) {
            let process = self.last_process.lock().unwrap().clone().unwrap();
            if let Some(server) = process.server.lock().unwrap().take() {
                server.abort();
            }
            process.alive.store(false, Ordering::SeqCst);
        }
    }

    fn calc_router(init: Router) -> Router {
        init.route(
            "/calculate",
            post(|Json(p): Json<Value>| async move {
                let a = p["a"].as_i64().unwrap_or(0);
                let b = p["b"].as_i64().unwrap_or(0);
                Json(json!({ "result": a + b }))
            }),
        )
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.last_spec.lock().unwrap() = Some(spec.clone());

            let alive = Arc::new(AtomicBool::new(true));
            let init_calls = self.init_calls.clone();
            let router = match self.behavior {
                Behavior::Serve(init_status) => Some(Router::new().route(
                    INIT_PATH,
                    post(move || async move {
                        init_calls.fetch_add(1, Ordering::SeqCst);
                        init_status
                    }),
                )),
                Behavior::FlakyInit(failures) => Some(Router::new().route(
                    INIT_PATH,
                    post(move || async move {
                        if init_calls.fetch_add(1, Ordering::SeqCst) < failures {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        }
                    }),
                )),
                Behavior::DieOnInit => {
                    let alive = alive.clone();
                    Some(Router::new().route(
                        INIT_PATH,
                        post(move || async move {
                            init_calls.fetch_add(1, Ordering::SeqCst);
                            alive.store(false, Ordering::SeqCst);
                            StatusCode::INTERNAL_SERVER_ERROR
                        }),
                    ))
                }
                Behavior::Crash(_) | Behavior::Hang => None,
            };

            let mut exit_code = None;
            let server = match router {
                Some(router) => {
                    let listener = tokio::net::TcpListener::bind((spec.host.as_str(), spec.port)).await?;
                    let router = calc_router(router);
                    Some(tokio::spawn(async move {
                        let _ = axum::serve(listener, router).await;
                    }))
                }
                None => None,
            };
            if let Behavior::Crash(code) = self.behavior {
                std::fs::create_dir_all(spec.log_file.parent().unwrap())?;
                std::fs::write(&spec.log_file, "Traceback (most recent call last):\nImportError: boom\n")?;
                alive.store(false, Ordering::SeqCst);
                exit_code = Some(code);
            }

            let process = Arc::new(FakeProcess {
                alive,
                exit_code,
                server: Mutex::new(server),
                terminated: self.terminated.clone(),
            });
            *self.last_process.lock().unwrap() = Some(process.clone());
            Ok(process)
        }
    }

    /// Holds the "unrelated process" socket and releases it when asked to
    /// reclaim, unless stubborn.
    struct FakeReclaimer {
        occupant: Mutex<Option<std::net::TcpListener>>,
        stubborn: bool,
        calls: AtomicUsize,
    }

    impl FakeReclaimer {
        fn empty() -> Self {
            Self {
                occupant: Mutex::new(None),
                stubborn: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn occupying(port: u16, stubborn: bool) -> Self {
            let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
            Self {
                occupant: Mutex::new(Some(listener)),
                stubborn,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PortReclaimer for FakeReclaimer {
        async fn reclaim(&self, _port: u16) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.stubborn {
                self.occupant.lock().unwrap().take();
            }
            Ok(vec![1234])
        }
    }

    struct NoRuntime;

    #[async_trait]
    impl Runtime for NoRuntime {
        async fn create_runtime(&self, path: &Path) -> Result<RuntimeHandle> {
            Ok(RuntimeHandle::new(path))
        }

        async fn install_manifest(&self, _h: &RuntimeHandle, _m: &Manifest) -> Result<i32> {
            Ok(0)
        }

        async fn list_installed_packages(&self, _h: &RuntimeHandle) -> Result<Vec<InstalledPackage>> {
            Ok(Vec::new())
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn calc_descriptor(port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new("calc")
            .with_env(PORT_VAR, port)
            .with_env("MODE", "slow")
            .with_env("DEBUG", true)
            .with_route(ApiRoute::post("/calculate"))
            .with_route(ApiRoute::post("/never-used"))
    }

    struct Harness {
        dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        reclaimer: Arc<FakeReclaimer>,
        manager: Arc<LifecycleManager>,
    }

    fn harness_with(
        catalog: StaticCatalog,
        behavior: Behavior,
        reclaimer: FakeReclaimer,
        tune: impl FnOnce(&mut OrchestratorConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::with_root(dir.path());
        config.startup = RetryPolicy::new(20, Duration::from_millis(20));
        config.handshake = RetryPolicy::immediate(3);
        config.reclaim = RetryPolicy::new(5, Duration::from_millis(20));
        config.stop_timeout = Duration::from_millis(200);
        tune(&mut config);

        let catalog: Arc<dyn Catalog> = Arc::new(catalog);
        let provisioner = Arc::new(Provisioner::new(
            catalog.clone(),
            Arc::new(NoRuntime),
            &config.repo_dir,
            &config.runtime_dir_name,
        ));
        let launcher = Arc::new(FakeLauncher::new(behavior));
        let reclaimer = Arc::new(reclaimer);
        let manager = LifecycleManager::new(
            config,
            catalog,
            provisioner,
            launcher.clone(),
            reclaimer.clone(),
        )
        .unwrap();

        Harness {
            dir,
            launcher,
            reclaimer,
            manager: Arc::new(manager),
        }
    }

    fn harness(port: u16, behavior: Behavior) -> Harness {
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        harness_with(catalog, behavior, FakeReclaimer::empty(), |_| {})
    }

    #[tokio::test]
    async fn test_calc_start_execute_stop() {
        let port = free_port();
        let h = harness(port, Behavior::Serve(StatusCode::OK));

        let report = h.manager.start("calc", &Map::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.port, port);
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Ready);

        let status = h.manager.get_status("calc").await.unwrap();
        assert!(status.running);
        assert_eq!(status.port, port);
        assert_eq!(status.pid, Some(4242));

        let out = h.manager.execute("calc", &json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!({"result": 5}));

        assert!(h.manager.stop("calc").await);
        assert!(h.launcher.terminated());
        assert!(h.manager.get_status("calc").await.is_none());
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Stopped);

        let err = h.manager.execute("calc", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn test_launch_spec_uses_template_and_log_dir() {
        let port = free_port();
        let h = harness(port, Behavior::Serve(StatusCode::OK));
        h.manager.start("calc", &Map::new()).await.unwrap();

        let spec = h.launcher.last_spec.lock().unwrap().clone().unwrap();
        assert_eq!(spec.cwd, PathBuf::from("/srv/services/calc"));
        assert_eq!(spec.log_file, h.dir.path().join("logs").join("calc.log"));
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert!(spec.args.contains(&port.to_string()));
        assert!(spec.args.contains(&"127.0.0.1".to_string()));
        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_overrides_win_except_port() {
        let port = free_port();
        let h = harness(port, Behavior::Serve(StatusCode::OK));

        let overrides = json!({"MODE": "fast", "PORT": 1, "WORKERS": 4});
        h.manager
            .start("calc", overrides.as_object().unwrap())
            .await
            .unwrap();

        let spec = h.launcher.last_spec.lock().unwrap().clone().unwrap();
        assert_eq!(spec.env["MODE"], "fast");
        assert_eq!(spec.env["WORKERS"], "4");
        assert_eq!(spec.env["DEBUG"], "true");
        assert_eq!(spec.env["PORT"], port.to_string());
        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_execute_without_start_is_not_running() {
        let h = harness(free_port(), Behavior::Serve(StatusCode::OK));
        let err = h.manager.execute("calc", &json!({"a": 1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert_eq!(h.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_service_returns_false() {
        let h = harness(free_port(), Behavior::Serve(StatusCode::OK));
        assert!(!h.manager.stop("calc").await);
        assert!(!h.manager.stop("ghost").await);
        assert!(h.manager.get_status("calc").await.is_none());
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn test_early_exit_fails_fast_with_log_tail() {
        let port = free_port();
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        let h = harness_with(catalog, Behavior::Crash(1), FakeReclaimer::empty(), |c| {
            c.startup = RetryPolicy::new(5, Duration::from_secs(10));
        });

        let started = Instant::now();
        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));

        match err {
            OrchestratorError::ProcessExited { code, log_tail } => {
                assert_eq!(code, Some(1));
                assert!(log_tail.contains("ImportError: boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Failed);
        assert!(h.manager.get_status("calc").await.is_none());
    }

    #[tokio::test]
    async fn test_handshake_failure_terminates_process() {
        let h = harness(free_port(), Behavior::Serve(StatusCode::INTERNAL_SERVER_ERROR));

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(h.launcher.terminated());
        assert!(h.manager.get_status("calc").await.is_none());
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_handshake_retries_transient_init_failures() {
        let h = harness(free_port(), Behavior::FlakyInit(2));

        let report = h.manager.start("calc", &Map::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(h.launcher.init_calls(), 3);
        assert!(!h.launcher.terminated());
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Ready);
        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_handshake_gives_up_after_max_attempts() {
        let h = harness(free_port(), Behavior::FlakyInit(3));

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert_eq!(h.launcher.init_calls(), 3);
        assert!(h.launcher.terminated());
        assert!(h.manager.get_status("calc").await.is_none());
    }

    #[tokio::test]
    async fn test_exit_during_handshake_aborts_and_terminates() {
        let h = harness(free_port(), Behavior::DieOnInit);

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(err.to_string().contains("exited during initialization"));
        assert_eq!(h.launcher.init_calls(), 1);
        assert!(h.launcher.terminated());
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_dead_instance_is_restarted() {
        let port = free_port();
        let h = harness(port, Behavior::Serve(StatusCode::OK));
        h.manager.start("calc", &Map::new()).await.unwrap();

        h.launcher.crash();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h.manager.get_status("calc").await.unwrap();
        assert!(!status.running);
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(h.manager.lifecycle_state("calc").await, LifecycleState::Failed);
        assert!(!h.launcher.terminated());

        let report = h.manager.start("calc", &Map::new()).await.unwrap();
        assert_eq!(report.port, port);
        assert_eq!(report.message, format!("Service started, listening on port {}", port));
        assert_eq!(h.launcher.launches(), 2);
        // the dead handle was cleaned up before relaunching
        assert!(h.launcher.terminated());

        let out = h.manager.execute("calc", &json!({"a": 1, "b": 1})).await.unwrap();
        assert_eq!(out, json!({"result": 2}));
        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_startup_timeout_terminates_process() {
        let port = free_port();
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        let h = harness_with(catalog, Behavior::Hang, FakeReclaimer::empty(), |c| {
            c.startup = RetryPolicy::immediate(3);
        });

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StartupTimeout);
        assert!(h.launcher.terminated());
        assert!(h.manager.get_status("calc").await.is_none());
    }

    #[tokio::test]
    async fn test_occupied_port_is_reclaimed() {
        let port = free_port();
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        let reclaimer = FakeReclaimer::occupying(port, false);
        let h = harness_with(catalog, Behavior::Serve(StatusCode::OK), reclaimer, |_| {});

        let report = h.manager.start("calc", &Map::new()).await.unwrap();
        assert_eq!(report.port, port);
        assert_eq!(h.reclaimer.calls.load(Ordering::SeqCst), 1);
        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_unreclaimable_port_is_a_conflict() {
        let port = free_port();
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        let reclaimer = FakeReclaimer::occupying(port, true);
        let h = harness_with(catalog, Behavior::Serve(StatusCode::OK), reclaimer, |_| {});

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortConflict);
        assert_eq!(h.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_fail_policy_never_reclaims() {
        let port = free_port();
        let catalog = StaticCatalog::new().with_service(
            calc_descriptor(port),
            Some(PathBuf::from("/srv/services/calc/service.py")),
        );
        let reclaimer = FakeReclaimer::occupying(port, false);
        let h = harness_with(catalog, Behavior::Serve(StatusCode::OK), reclaimer, |c| {
            c.port_conflict = PortConflictPolicy::Fail;
        });

        let err = h.manager.start("calc", &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortConflict);
        assert_eq!(h.reclaimer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_launch_once() {
        let port = free_port();
        let h = harness(port, Behavior::Serve(StatusCode::OK));

        let empty = Map::new();
        let (a, b) = tokio::join!(h.manager.start("calc", &empty), h.manager.start("calc", &empty));
        assert_eq!(a.unwrap().port, port);
        assert_eq!(b.unwrap().port, port);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.manager.running_services().await, vec![ServiceName::new("calc")]);

        assert_eq!(h.manager.stop_all().await, vec![ServiceName::new("calc")]);
        assert!(h.manager.running_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_services_fail_before_launch() {
        let catalog = StaticCatalog::new()
            .with_service(calc_descriptor(free_port()), None)
            .with_service(
                ServiceDescriptor::new("portless").with_route(ApiRoute::post("/run")),
                Some(PathBuf::from("/srv/services/portless/service.py")),
            )
            .with_service(
                ServiceDescriptor::new("zero").with_env(PORT_VAR, 0),
                Some(PathBuf::from("/srv/services/zero/service.py")),
            );
        let h = harness_with(catalog, Behavior::Serve(StatusCode::OK), FakeReclaimer::empty(), |_| {});

        let kind = |r: OrchestratorResult<StartReport>| r.unwrap_err().kind();
        assert_eq!(kind(h.manager.start("ghost", &Map::new()).await), ErrorKind::NotFound);
        assert_eq!(kind(h.manager.start("calc", &Map::new()).await), ErrorKind::NotFound);
        assert_eq!(kind(h.manager.start("portless", &Map::new()).await), ErrorKind::Configuration);
        assert_eq!(kind(h.manager.start("zero", &Map::new()).await), ErrorKind::Configuration);
        assert_eq!(h.launcher.launches(), 0);
    }

    #[test]
    fn test_merge_env_pins_port() {
        let descriptor = calc_descriptor(9001);
        let overrides = json!({"PORT": "8000", "EXTRA": null});
        let env = merge_env(&descriptor, overrides.as_object().unwrap(), 9001);
        assert_eq!(env["PORT"], "9001");
        assert_eq!(env["EXTRA"], "");
        assert_eq!(env["MODE"], "slow");
    }
}
