use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

/// Bounded retry policy: at most `max_attempts` tries, `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// A policy with no delay between attempts.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval_ms: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// What to do when a service's declared port is already bound at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortConflictPolicy {
    /// Terminate whatever holds the port, then continue.
    #[default]
    Reclaim,
    /// Refuse to start and report the conflict.
    Fail,
}

/// Raw on-disk shape of `orchestrator.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct OrchestratorJsonConfig {
    #[serde(default)]
    pub root_dir: Option<String>,
    #[serde(default)]
    pub services_dir: Option<String>,
    #[serde(default)]
    pub repo_dir: Option<String>,
    #[serde(default)]
    pub logs_dir: Option<String>,
    #[serde(default)]
    pub runtime_dir_name: Option<String>,
    #[serde(default)]
    pub python: Option<String>,
    #[serde(default)]
    pub upgrade_installer: Option<bool>,
    #[serde(default)]
    pub install_timeout_ms: Option<u64>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub launch_args: Option<Vec<String>>,
    #[serde(default)]
    pub startup: Option<RetryPolicy>,
    #[serde(default)]
    pub handshake: Option<RetryPolicy>,
    #[serde(default)]
    pub reclaim: Option<RetryPolicy>,
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
    #[serde(default)]
    pub http_timeout_ms: Option<u64>,
    #[serde(default)]
    pub log_tail_bytes: Option<usize>,
    #[serde(default)]
    pub port_conflict: Option<PortConflictPolicy>,
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Known root every default path hangs off.
    pub root_dir: PathBuf,
    /// One sub-directory per service, each holding `service.json` and `service.py`.
    pub services_dir: PathBuf,
    /// Source checkouts, one per service.
    pub repo_dir: PathBuf,
    /// Per-service process logs.
    pub logs_dir: PathBuf,
    /// Directory name of the isolated runtime inside a service's source dir.
    pub runtime_dir_name: String,
    /// Interpreter used to create runtimes.
    pub python: String,
    pub upgrade_installer: bool,
    pub install_timeout: Duration,
    pub host: String,
    /// Arguments passed to the runtime interpreter. `{service}`, `{host}` and
    /// `{port}` are substituted at launch.
    pub launch_args: Vec<String>,
    pub startup: RetryPolicy,
    pub handshake: RetryPolicy,
    pub reclaim: RetryPolicy,
    pub stop_timeout: Duration,
    pub http_timeout: Duration,
    pub log_tail_bytes: usize,
    pub port_conflict: PortConflictPolicy,
}

pub fn default_launch_args() -> Vec<String> {
    [
        "-m",
        "uvicorn",
        "service:app",
        "--host",
        "{host}",
        "--port",
        "{port}",
        "--log-level",
        "info",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl OrchestratorConfig {
    /// Defaults rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        Self {
            services_dir: root_dir.join("services"),
            repo_dir: root_dir.join("repo"),
            logs_dir: root_dir.join("logs"),
            root_dir,
            runtime_dir_name: ".venv".to_string(),
            python: "python3".to_string(),
            upgrade_installer: true,
            install_timeout: Duration::from_secs(600),
            host: "127.0.0.1".to_string(),
            launch_args: default_launch_args(),
            startup: RetryPolicy::new(10, Duration::from_millis(500)),
            handshake: RetryPolicy::new(3, Duration::from_millis(500)),
            reclaim: RetryPolicy::new(10, Duration::from_millis(100)),
            stop_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(30),
            log_tail_bytes: 4096,
            port_conflict: PortConflictPolicy::Reclaim,
        }
    }

    pub fn from_json(cfg: OrchestratorJsonConfig) -> Self {
        let root_dir = cfg
            .root_dir
            .map(|p| PathBuf::from(expand_env_vars(&p)))
            .unwrap_or_else(|| PathBuf::from("."));
        let mut out = Self::with_root(root_dir);

        if let Some(p) = cfg.services_dir {
            out.services_dir = out.root_dir.join(expand_env_vars(&p));
        }
        if let Some(p) = cfg.repo_dir {
            out.repo_dir = out.root_dir.join(expand_env_vars(&p));
        }
        if let Some(p) = cfg.logs_dir {
            out.logs_dir = out.root_dir.join(expand_env_vars(&p));
        }
        if let Some(name) = cfg.runtime_dir_name {
            out.runtime_dir_name = name;
        }
        if let Some(python) = cfg.python {
            out.python = expand_env_vars(&python);
        }
        if let Some(flag) = cfg.upgrade_installer {
            out.upgrade_installer = flag;
        }
        if let Some(ms) = cfg.install_timeout_ms {
            out.install_timeout = Duration::from_millis(ms);
        }
        if let Some(host) = cfg.host {
            out.host = host;
        }
        if let Some(args) = cfg.launch_args {
            out.launch_args = args.into_iter().map(|a| expand_env_vars(&a)).collect();
        }
        if let Some(policy) = cfg.startup {
            out.startup = policy;
        }
        if let Some(policy) = cfg.handshake {
            out.handshake = policy;
        }
        if let Some(policy) = cfg.reclaim {
            out.reclaim = policy;
        }
        if let Some(ms) = cfg.stop_timeout_ms {
            out.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cfg.http_timeout_ms {
            out.http_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = cfg.log_tail_bytes {
            out.log_tail_bytes = bytes;
        }
        if let Some(policy) = cfg.port_conflict {
            out.port_conflict = policy;
        }

        out
    }

    /// Load from the resolved config file, or fall back to defaults rooted at
    /// the current directory when none exists.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::info!("No orchestrator.json found, using defaults");
                Ok(Self::with_root("."))
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let cfg: OrchestratorJsonConfig = serde_json::from_str(&raw)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(Self::from_json(cfg))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::with_root(".")
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("ORCHESTRATOR_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("service-orchestrator")
            .join("orchestrator.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("orchestrator.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
