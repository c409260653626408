//! Isolated per-service runtimes.
//!
//! [`Runtime`] is the seam between the provisioner and the toolchain that
//! actually creates environments and installs packages. [`VenvRuntime`]
//! drives a Python interpreter (`-m venv`, `-m pip`).

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::manifest::{Manifest, ManifestKind};

/// Location of an isolated runtime on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeHandle {
    pub root: PathBuf,
}

impl RuntimeHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The runtime's own interpreter.
    pub fn interpreter(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts").join("python.exe")
        } else {
            self.root.join("bin").join("python")
        }
    }

    /// A runtime exists when its interpreter does.
    pub fn exists(&self) -> bool {
        self.interpreter().exists()
    }
}

/// One entry of a runtime's package inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

impl InstalledPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a fresh runtime rooted at `path`.
    async fn create_runtime(&self, path: &Path) -> Result<RuntimeHandle>;

    /// Run the runtime's package installer against `manifest`; returns the
    /// installer's exit code.
    async fn install_manifest(&self, handle: &RuntimeHandle, manifest: &Manifest) -> Result<i32>;

    /// Enumerate installed packages from the runtime's own inventory.
    async fn list_installed_packages(&self, handle: &RuntimeHandle) -> Result<Vec<InstalledPackage>>;
}

/// Python virtual environments driven through `python -m venv` and `-m pip`.
pub struct VenvRuntime {
    python: String,
    upgrade_installer: bool,
    timeout: Duration,
}

impl VenvRuntime {
    pub fn new(python: impl Into<String>, upgrade_installer: bool, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            upgrade_installer,
            timeout,
        }
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {}: {:?}", what, cmd.as_std());
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", what, self.timeout))?
            .with_context(|| format!("failed to spawn {}", what))?;

        if !output.status.success() {
            error!(
                "{} exited with {}\nstdout:\n{}\nstderr:\n{}",
                what,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        } else {
            debug!("{} output:\n{}", what, String::from_utf8_lossy(&output.stdout));
        }

        Ok(output)
    }
}

#[async_trait]
impl Runtime for VenvRuntime {
    async fn create_runtime(&self, path: &Path) -> Result<RuntimeHandle> {
        info!("Creating runtime at {}", path.display());

        let mut cmd = Command::new(&self.python);
        cmd.arg("-m").arg("venv").arg(path);
        let output = self.run(cmd, "venv creation").await?;
        if !output.status.success() {
            bail!(
                "venv creation failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let handle = RuntimeHandle::new(path);
        if !handle.exists() {
            bail!(
                "venv created but interpreter {} is missing",
                handle.interpreter().display()
            );
        }
        Ok(handle)
    }

    async fn install_manifest(&self, handle: &RuntimeHandle, manifest: &Manifest) -> Result<i32> {
        let python = handle.interpreter();
        info!(
            "Installing from {} with {}",
            manifest.path.display(),
            python.display()
        );

        let mut cmd = Command::new(&python);
        match manifest.kind {
            ManifestKind::PinnedList => {
                if self.upgrade_installer {
                    let mut upgrade = Command::new(&python);
                    upgrade.args(["-m", "pip", "install", "--upgrade", "pip"]);
                    match self.run(upgrade, "pip upgrade").await {
                        Ok(out) if out.status.success() => {}
                        Ok(_) => warn!("pip upgrade failed, continuing with the bundled pip"),
                        Err(e) => warn!("pip upgrade failed: {e:#}"),
                    }
                }
                cmd.args(["-m", "pip", "install", "-r"]).arg(&manifest.path);
            }
            ManifestKind::BuildScript => {
                cmd.arg(&manifest.path).arg("install").current_dir(manifest.dir());
            }
            ManifestKind::ProjectManifest => {
                cmd.args(["-m", "pip", "install"]).arg(manifest.dir());
            }
        }

        let output = self.run(cmd, "dependency installation").await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    async fn list_installed_packages(&self, handle: &RuntimeHandle) -> Result<Vec<InstalledPackage>> {
        let mut cmd = Command::new(handle.interpreter());
        cmd.args(["-m", "pip", "list", "--format=json"]);
        let output = self.run(cmd, "package listing").await?;
        if !output.status.success() {
            bail!(
                "pip list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let packages: Vec<InstalledPackage> = serde_json::from_slice(&output.stdout)
            .context("pip list returned malformed JSON")?;
        debug!(
            "Installed packages: {:?}",
            packages.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );
        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_handle_exists_tracks_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let handle = RuntimeHandle::new(dir.path().join(".venv"));
        assert!(!handle.exists());

        let interpreter = handle.interpreter();
        std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
        std::fs::write(&interpreter, "").unwrap();
        assert!(handle.exists());
    }

    #[test]
    fn test_installed_package_inventory_format() {
        let raw = r#"[{"name": "numpy", "version": "1.1.0"}, {"name": "pip", "version": "24.0"}]"#;
        let packages: Vec<InstalledPackage> = serde_json::from_str(raw).unwrap();
        assert_eq!(packages[0], InstalledPackage::new("numpy", "1.1.0"));
        assert_eq!(packages.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = VenvRuntime::new(
            "definitely-not-a-python-binary",
            false,
            Duration::from_secs(5),
        );
        let result = runtime.create_runtime(&dir.path().join(".venv")).await;
        assert!(result.is_err());
    }
}
