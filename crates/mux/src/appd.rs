//! Supervision of an embedded application child process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long an orderly stop may take before escalating to SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while supervising an embedded application.
#[derive(Debug, Error)]
pub enum AppdError {
    #[error("application process already running")]
    AlreadyRunning,

    #[error("failed to spawn '{path}': {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to signal application process: {0}")]
    Signal(String),

    #[error("failed to wait for application process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Handle to an embedded application binary.
///
/// The process is a two-state machine, Stopped ↔ Running, observed through
/// actual wait status rather than a flag: a child that died between calls is
/// seen as stopped on the next query.
pub struct Appd {
    path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl Appd {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            child: Mutex::new(None),
        }
    }

    /// Path of the supervised executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the long-running application server: `<binary> start <args..>`.
    ///
    /// The child inherits stdio and is expected to bind its wire endpoint
    /// before answering requests. Fails if a child is already running.
    pub async fn start(&self, args: Vec<String>) -> Result<(), AppdError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if still_running(child) {
                return Err(AppdError::AlreadyRunning);
            }
        }

        let child = Command::new(&self.path)
            .arg("start")
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AppdError::Spawn {
                path: self.path.display().to_string(),
                source,
            })?;

        *guard = Some(child);
        Ok(())
    }

    /// Orderly termination: SIGTERM, a bounded wait, then SIGKILL.
    /// Idempotent on a stopped process.
    pub async fn stop(&self) -> Result<(), AppdError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => return Err(AppdError::Signal(err.to_string())),
            }
        }
        #[cfg(not(unix))]
        child.start_kill().map_err(AppdError::Wait)?;

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(err)) => Err(AppdError::Wait(err)),
            Err(_elapsed) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "application did not stop within {STOP_TIMEOUT:?}, sending SIGKILL"
                );
                child.start_kill().map_err(AppdError::Wait)?;
                child.wait().await.map_err(AppdError::Wait)?;
                Ok(())
            }
        }
    }

    /// Whether the child process is currently alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            None => false,
            Some(child) => {
                if still_running(child) {
                    true
                } else {
                    // reaped; drop the handle
                    *guard = None;
                    false
                }
            }
        }
    }

    pub async fn is_stopped(&self) -> bool {
        !self.is_running().await
    }

    /// Build a one-shot sub-process invocation of the same binary, used for
    /// pre-handlers. The caller runs it to completion and inspects the exit
    /// status.
    pub fn create_exec_command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg(subcommand);
        cmd
    }
}

fn still_running(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(None) => true,
        // exited, or the handle is in a state we cannot query; either way the
        // process is not usable as a running application
        Ok(Some(_)) | Err(_) => false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write a small shell script that behaves like an embedded app binary:
    /// `start` blocks, `migrate` succeeds, `fail` exits non-zero.
    fn fake_appd(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("appd.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$1\" in\n  start) exec sleep 60 ;;\n  migrate) exit 0 ;;\n  fail) exit 1 ;;\nesac\nexit 2\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn start_and_stop_transitions() {
        let dir = TempDir::new().unwrap();
        let appd = Appd::new(fake_appd(&dir));

        assert!(appd.is_stopped().await);
        appd.start(vec![]).await.unwrap();
        assert!(appd.is_running().await);

        appd.stop().await.unwrap();
        assert!(appd.is_stopped().await);
    }

    #[tokio::test]
    async fn start_fails_when_already_running() {
        let dir = TempDir::new().unwrap();
        let appd = Appd::new(fake_appd(&dir));

        appd.start(vec![]).await.unwrap();
        let err = appd.start(vec![]).await.unwrap_err();
        assert!(matches!(err, AppdError::AlreadyRunning));

        appd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let appd = Appd::new(fake_appd(&dir));

        appd.stop().await.unwrap();
        appd.start(vec![]).await.unwrap();
        appd.stop().await.unwrap();
        appd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dead_child_is_observed_as_stopped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.sh");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let appd = Appd::new(path);
        appd.start(vec![]).await.unwrap();

        // the child exits on its own; the handle must observe it
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(appd.is_stopped().await);

        // and a restart is permitted afterwards
        appd.start(vec![]).await.unwrap();
        appd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exec_command_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let appd = Appd::new(fake_appd(&dir));

        let status = appd.create_exec_command("migrate").status().await.unwrap();
        assert!(status.success());

        let status = appd.create_exec_command("fail").status().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let appd = Appd::new("/nonexistent/meridiand-v1");
        let err = appd.start(vec![]).await.unwrap_err();
        assert!(matches!(err, AppdError::Spawn { .. }));
        assert!(appd.is_stopped().await);
    }
}
