use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Fail,
    Timeout,
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Ok => write!(f, "ok"),
            ProbeOutcome::Fail => write!(f, "fail"),
            ProbeOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

/// Run a shell probe with a hard deadline.
///
/// The child is polled in `slice` increments; on expiry it is killed with
/// SIGKILL and the probe counts as [`ProbeOutcome::Timeout`]. This blocks
/// the caller for at most `timeout`, which is the contract for every
/// probe on the event-loop thread.
pub fn run_probe(
    command: &str,
    timeout: Duration,
    slice: Duration,
) -> Result<ProbeOutcome, SupervisorError> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(SupervisorError::Probe)?;

    let start = Instant::now();
    loop {
        match child.try_wait().map_err(SupervisorError::Probe)? {
            Some(status) => {
                return Ok(if status.success() {
                    ProbeOutcome::Ok
                } else {
                    ProbeOutcome::Fail
                });
            }
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ProbeOutcome::Timeout);
            }
            None => std::thread::sleep(slice),
        }
    }
}
