//! Shell backend: run a rendered command line under `sh -c`
//!
//! The child runs in its own process group so a timeout can take down the
//! whole pipeline it started, not just the shell.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::BackendError;

/// How long output may keep flowing after the shell itself has exited
const DRAIN_GRACE: Duration = Duration::from_millis(100);

pub struct ShellBackend {
    program: String,
}

impl ShellBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `command` and return its stdout.
    ///
    /// The shell's exit status decides the result. Non-zero exit is
    /// `ExecutionFailed` carrying stderr; on timeout the process group is
    /// killed and reaped before `Timeout` is returned. Background jobs still
    /// holding the output pipes shortly after exit are killed with the group.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<Vec<u8>, BackendError> {
        debug!("Shell executing: {} -c {:?}", self.program, command);

        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(command)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::SpawnFailed(format!("{}: {e}", self.program)))?;
        let mut group = ProcessGroupGuard::new(child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out = Vec::new();
        let mut err = Vec::new();

        let outcome = {
            let drain = async {
                tokio::try_join!(read_into(stdout, &mut out), read_into(stderr, &mut err))
                    .map(|_| ())
            };
            tokio::pin!(drain);

            let finished = tokio::time::timeout(timeout, async {
                let mut drained = false;
                let status = loop {
                    tokio::select! {
                        status = child.wait() => break status?,
                        res = &mut drain, if !drained => {
                            res?;
                            drained = true;
                        }
                    }
                };
                if !drained {
                    // Exited, but a background job still holds the pipes
                    match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
                        Ok(res) => res?,
                        Err(_) => {
                            debug!("Output pipes still open after exit, killing process group");
                            group.kill();
                            tokio::time::timeout(DRAIN_GRACE, &mut drain)
                                .await
                                .unwrap_or(Ok(()))?;
                        }
                    }
                }
                Ok::<_, std::io::Error>(status)
            })
            .await;
            finished
        };

        match outcome {
            Ok(Ok(status)) => {
                group.disarm();
                if status.success() {
                    Ok(out)
                } else {
                    Err(BackendError::ExecutionFailed {
                        exit_code: status.code().unwrap_or(-1),
                        stderr: super::snippet(&String::from_utf8_lossy(&err)),
                    })
                }
            }
            Ok(Err(e)) => {
                group.kill();
                let _ = child.wait().await;
                Err(BackendError::ExecutionFailed {
                    exit_code: -1,
                    stderr: format!("i/o error while collecting output: {e}"),
                })
            }
            Err(_) => {
                warn!("Shell command timed out after {:?}, killing process group", timeout);
                group.kill();
                let _ = child.wait().await;
                Err(BackendError::Timeout(timeout))
            }
        }
    }
}

/// Append everything read from `pipe` to `buf`; data read so far survives
/// cancellation
async fn read_into<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Kills the child's process group unless disarmed, including when the
/// execution future is dropped mid-flight.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process group {pgid}: {e}"),
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn backend() -> ShellBackend {
        ShellBackend::new("/bin/sh")
    }

    #[tokio::test]
    async fn test_shell_echo() {
        let out = backend()
            .execute("echo 42", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, b"42\n");
    }

    #[tokio::test]
    async fn test_shell_pipeline() {
        let out = backend()
            .execute("printf 'a\\nb\\nc\\n' | wc -l | tr -d ' '", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "3");
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit() {
        let err = backend()
            .execute("echo boom >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::ExecutionFailed {
                exit_code: 3,
                stderr: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_shell_timeout_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let command = format!("sleep 2 && touch {}", marker.display());

        let start = Instant::now();
        let err = backend()
            .execute(&command, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_secs(1));

        // The killed group must not finish its work later
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_shell_background_job_does_not_hold_result() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("echo 42; (sleep 1; touch {}) &", marker.display());

        let start = Instant::now();
        let out = backend()
            .execute(&command, Duration::from_millis(800))
            .await
            .unwrap();
        assert_eq!(out, b"42\n");
        assert!(start.elapsed() < Duration::from_millis(800));

        // The leftover job went down with the group
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_shell_missing_program() {
        let err = ShellBackend::new("/nonexistent/shell")
            .execute("true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SpawnFailed(_)));
    }
}
