//! Child process handles and the launcher seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::ServiceName;

/// Observed state of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited; the code is `None` when killed by a signal.
    Exited(Option<i32>),
}

#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check of the process.
    async fn state(&self) -> ProcessState;

    /// Graceful termination, escalating to a forced kill once `grace`
    /// elapses. Returns whether the process is confirmed gone.
    async fn terminate(&self, grace: Duration) -> bool;

    async fn is_alive(&self) -> bool {
        self.state().await == ProcessState::Running
    }
}

/// Everything needed to launch one service process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service: ServiceName,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the manager's own environment.
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// Combined stdout/stderr destination.
    pub log_file: PathBuf,
    pub host: String,
    pub port: u16,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>>;
}

/// Launches real OS processes in their own process group.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        if let Some(dir) = spec.log_file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let log = std::fs::File::create(&spec.log_file)
            .with_context(|| format!("opening log file {}", spec.log_file.display()))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // New group so the service outlives the manager and can be
        // signalled as a whole.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP

        info!(
            service = %spec.service,
            "Launching {} {}",
            spec.program.display(),
            spec.args.join(" ")
        );
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", spec.program.display()))?;

        Ok(Arc::new(ChildProcess::new(child)))
    }
}

/// A spawned child owned by the manager.
pub struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => true,
            Err(e) => {
                debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
                false
            }
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn state(&self) -> ProcessState {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Err(e) => {
                warn!("Could not poll process {:?}: {}", self.pid, e);
                ProcessState::Exited(None)
            }
        }
    }

    async fn terminate(&self, grace: Duration) -> bool {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }

        #[cfg(unix)]
        let signalled = self.signal_group(nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let signalled = child.start_kill().is_ok();

        if signalled {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                debug!("Process {:?} exited with {}", self.pid, status);
                return true;
            }
            warn!("Process {:?} ignored termination for {:?}, killing", self.pid, grace);
        }

        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        if let Err(e) = child.start_kill() {
            debug!("start_kill on {:?}: {}", self.pid, e);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Waiting for process {:?} failed: {}", self.pid, e);
                false
            }
            Err(_) => {
                warn!("Process {:?} survived a forced kill", self.pid);
                false
            }
        }
    }
}
