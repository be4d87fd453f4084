//! OS process lookup and termination for listening ports

use crate::error::ProcessError;
use tokio::process::Command;
use tracing::{debug, info};

/// Find and signal the processes bound to a port
#[allow(async_fn_in_trait)]
pub trait ProcessControl {
    /// Ids of processes with a TCP socket listening on `port`
    async fn listening_pids(&self, port: u16) -> Result<Vec<u32>, ProcessError>;

    /// Ask `pid` to terminate
    fn terminate(&self, pid: u32) -> Result<(), ProcessError>;
}

/// [`ProcessControl`] backed by `lsof` and SIGTERM
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    async fn listening_pids(&self, port: u16) -> Result<Vec<u32>, ProcessError> {
        let output = Command::new("lsof")
            .args(["-nP", "-t"])
            .arg(format!("-iTCP:{}", port))
            .arg("-sTCP:LISTEN")
            .output()
            .await
            .map_err(|e| ProcessError::Lookup {
                port,
                reason: format!("could not run lsof: {}", e),
            })?;

        let pids = lsof_result(
            port,
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )?;
        debug!(port, ?pids, "Resolved listening processes");
        Ok(pids)
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        info!(pid, "Sending SIGTERM");

        #[cfg(unix)]
        {
            let pid_t = libc::pid_t::try_from(pid).map_err(|_| ProcessError::Signal {
                pid,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"),
            })?;
            let result = unsafe { libc::kill(pid_t, libc::SIGTERM) };
            if result != 0 {
                return Err(ProcessError::Signal {
                    pid,
                    source: std::io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let status = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string()])
                .status()
                .map_err(|source| ProcessError::Signal { pid, source })?;
            if !status.success() {
                return Err(ProcessError::Signal {
                    pid,
                    source: std::io::Error::other(format!("taskkill exited with {}", status)),
                });
            }
            Ok(())
        }
    }
}

/// Interpret an `lsof -t` run.
///
/// A silent exit 1 is how lsof reports that nothing matched. Any other
/// failure is a lookup error, so a running listener is never taken for absent.
pub fn lsof_result(
    port: u16,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> Result<Vec<u32>, ProcessError> {
    match code {
        Some(0) => Ok(parse_pids(stdout)),
        Some(1) if stdout.trim().is_empty() && stderr.trim().is_empty() => {
            debug!(port, "lsof found no listener");
            Ok(Vec::new())
        }
        _ => {
            let status = code.map_or_else(|| "a signal".to_string(), |c| format!("status {}", c));
            let detail = stderr.trim();
            let reason = if detail.is_empty() {
                format!("lsof exited with {}", status)
            } else {
                format!("lsof exited with {}: {}", status, detail)
            };
            Err(ProcessError::Lookup { port, reason })
        }
    }
}

/// Parse `lsof -t` output: one pid per line, deduplicated, order kept
pub fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in output.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}
