//! Port probing and reclaiming.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A port is in use when binding it on `host` fails.
pub fn is_port_in_use(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_err()
}

/// Frees a port held by some other process.
#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// Terminate whatever process holds `port`; returns the pids signalled.
    async fn reclaim(&self, port: u16) -> Result<Vec<u32>>;
}

/// Looks the holder up with `lsof` (`netstat` on Windows) and force-kills it.
#[derive(Debug, Clone)]
pub struct SystemReclaimer {
    timeout: Duration,
}

impl Default for SystemReclaimer {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl SystemReclaimer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn output(&self, cmd: &mut Command) -> Result<String> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("port lookup timed out after {:?}", self.timeout))?
            .context("failed to run port lookup")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn holders(&self, port: u16) -> Result<Vec<u32>> {
        if cfg!(windows) {
            let out = self.output(Command::new("netstat").arg("-ano")).await?;
            Ok(netstat_listeners(&out, port))
        } else {
            let out = self
                .output(Command::new("lsof").arg("-ti").arg(format!(":{}", port)))
                .await?;
            Ok(parse_pids(&out))
        }
    }

    #[cfg(unix)]
    async fn kill(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .with_context(|| format!("failed to kill pid {}", pid))
    }

    #[cfg(not(unix))]
    async fn kill(&self, pid: u32) -> Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/F", "/PID", &pid.to_string()]);
        self.output(&mut cmd).await.map(|_| ())
    }
}

#[async_trait]
impl PortReclaimer for SystemReclaimer {
    async fn reclaim(&self, port: u16) -> Result<Vec<u32>> {
        let own = std::process::id();
        let pids: Vec<u32> = self
            .holders(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own)
            .collect();

        if pids.is_empty() {
            warn!("No process found holding port {}", port);
            return Ok(pids);
        }

        for pid in &pids {
            info!("Killing pid {} holding port {}", pid, port);
            self.kill(*pid).await?;
        }
        Ok(pids)
    }
}

fn parse_pids(raw: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = raw
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Pids from `netstat -ano` lines listening on `port`.
fn netstat_listeners(raw: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = raw
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let local = cols.get(1)?;
            if !local.ends_with(&suffix) || !line.contains("LISTENING") {
                return None;
            }
            cols.last()?.parse().ok()
        })
        .collect();
    debug!("netstat holders of {}: {:?}", port, pids);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use("127.0.0.1", port));

        drop(listener);
        assert!(!is_port_in_use("127.0.0.1", port));
    }

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("4242\n17\n4242\n"), vec![17, 4242]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn test_netstat_listeners() {
        let raw = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:9001           0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:19001        0.0.0.0:0              LISTENING       77
  TCP    127.0.0.1:51000        127.0.0.1:9001         ESTABLISHED     900
";
        assert_eq!(netstat_listeners(raw, 9001), vec![5120]);
    }
}
