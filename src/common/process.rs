//! External process supervision
//!
//! Manages the lifecycle of a delegated child process (`kubectl port-forward`,
//! the full-tunnel helper):
//! - Spawning with piped output
//! - Liveness checks
//! - Collecting the tail of stderr for failure reports
//! - Graceful shutdown (SIGTERM, then kill)
//!
//! Restarts are not done here; the owner decides whether to spawn again.

use crate::{Error, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Time allowed for a graceful exit after SIGTERM
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines of output kept for diagnostics
const OUTPUT_TAIL_LINES: usize = 20;

/// Proxy variables a registered global proxy writes into this process's environment
pub const PROXY_ENV_KEYS: &[&str] = &[
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "all_proxy",
    "ALL_PROXY",
    "no_proxy",
    "NO_PROXY",
];

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Stopped on request
    Stopped,
    /// Process is running
    Running,
    /// Process exited on its own
    Exited(Option<i32>),
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(Some(code)) => write!(f, "exited({})", code),
            ProcessState::Exited(None) => write!(f, "exited(signal)"),
        }
    }
}

/// Command line of a delegated process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable name or path
    pub executable: PathBuf,
    /// Arguments
    pub args: Vec<OsString>,
    /// Variables set for the child only
    pub env: Vec<(OsString, OsString)>,
    /// Variables removed from the inherited environment
    pub env_removed: Vec<OsString>,
    /// Delay after spawn before the first liveness check
    pub settle: Duration,
}

impl ProcessSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        ProcessSpec {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            env_removed: Vec::new(),
            settle: Duration::from_millis(500),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env_removed.push(key.into());
        self
    }

    /// Do not pass the proxy variables on: a delegated process dials the
    /// cluster directly, never through the tunnel it is carrying
    pub fn without_proxy_env(self) -> Self {
        PROXY_ENV_KEYS.iter().fold(self, |spec, key| spec.env_remove(*key))
    }

    pub fn display(&self) -> String {
        let mut line = self.executable.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// A supervised child process
pub struct ManagedProcess {
    spec: ProcessSpec,
    child: Mutex<Option<Child>>,
    output: Arc<SyncMutex<VecDeque<String>>>,
    state_tx: watch::Sender<ProcessState>,
}

impl ManagedProcess {
    /// Spawn the process and wait for it to settle
    pub async fn spawn(spec: ProcessSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.executable);
        for key in &spec.env_removed {
            cmd.env_remove(key);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k, v)));
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting {}", spec.display());

        let mut child = cmd.spawn().map_err(|e| {
            Error::process(format!("failed to spawn {:?}: {}", spec.executable, e))
        })?;

        let output = Arc::new(SyncMutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_output(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_output(stderr, output.clone()));
        }

        debug!("{:?} started with PID {}", spec.executable, child.id().unwrap_or(0));

        let (state_tx, _) = watch::channel(ProcessState::Running);
        let process = ManagedProcess {
            spec,
            child: Mutex::new(Some(child)),
            output,
            state_tx,
        };

        sleep(process.spec.settle).await;

        if process.is_alive().await {
            Ok(process)
        } else {
            Err(Error::process(format!(
                "{:?} exited immediately: {}",
                process.spec.executable,
                process.output_tail()
            )))
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Last lines written by the process
    pub fn output_tail(&self) -> String {
        self.output
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Check if the child process is alive
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    self.state_tx.send_replace(ProcessState::Exited(status.code()));
                    false
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Wait until the process exits on its own
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        let mut rx = self.subscribe();
        loop {
            if !self.is_alive().await {
                let mut guard = self.child.lock().await;
                return match guard.as_mut() {
                    Some(child) => child.try_wait().ok().flatten(),
                    None => None,
                };
            }
            // poll periodically; stop() flips the state channel
            tokio::select! {
                _ = sleep(Duration::from_millis(250)) => {}
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() == ProcessState::Stopped {
                        return None;
                    }
                }
            }
        }
    }

    /// Stop the process; safe to call repeatedly
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            match timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{:?} exited with status: {}", self.spec.executable, status);
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for {:?}: {}", self.spec.executable, e);
                }
                Err(_) => {
                    warn!("{:?} didn't exit gracefully, forcing kill", self.spec.executable);
                    let _ = child.kill().await;
                }
            }
        }
        self.state_tx.send_replace(ProcessState::Stopped);
    }
}

async fn collect_output<R>(reader: R, output: Arc<SyncMutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "kube_tunnel::process", "{}", line);
        let mut tail = output.lock();
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Exited(Some(1)).to_string(), "exited(1)");
    }

    #[test]
    fn test_spec_display() {
        let spec = ProcessSpec::new("kubectl").arg("port-forward").arg("pod/x");
        assert_eq!(spec.display(), "kubectl port-forward pod/x");
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let result = ManagedProcess::spawn(ProcessSpec::new("/nonexistent/kubectl")).await;
        assert!(matches!(result, Err(Error::Process(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_stop() {
        let mut spec = ProcessSpec::new("sleep").arg("30");
        spec.settle = Duration::from_millis(50);
        let process = ManagedProcess::spawn(spec).await.unwrap();
        assert!(process.is_alive().await);
        process.stop().await;
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
        assert!(!process.is_alive().await);
    }

    #[test]
    fn test_spec_without_proxy_env() {
        let spec = ProcessSpec::new("kubectl").without_proxy_env();
        for key in ["https_proxy", "HTTPS_PROXY", "ALL_PROXY", "no_proxy"] {
            assert!(spec.env_removed.iter().any(|k| k == key), "{}", key);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_does_not_inherit_proxy_env() {
        // what EnvProxyRegistry::apply leaves behind in this process
        std::env::set_var("ALL_PROXY", "socks5://127.0.0.1:42999");

        let mut spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("echo \"all=${ALL_PROXY:-unset} extra=$KT_EXTRA\"; exit 7")
            .without_proxy_env()
            .env("KT_EXTRA", "yes");
        spec.settle = Duration::from_millis(300);
        let err = ManagedProcess::spawn(spec).await.err().unwrap().to_string();
        std::env::remove_var("ALL_PROXY");
        assert!(err.contains("all=unset extra=yes"), "{}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_reports_output() {
        let mut spec = ProcessSpec::new("sh").arg("-c").arg("echo boom >&2; exit 3");
        spec.settle = Duration::from_millis(300);
        let err = ManagedProcess::spawn(spec).await.err().unwrap();
        assert!(err.to_string().contains("exited immediately"));
    }
}
