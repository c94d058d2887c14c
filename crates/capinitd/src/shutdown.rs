use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::daemon::Daemon;

const GRACE: Duration = Duration::from_secs(5);

/// Terminate every managed process, give them the grace window, then
/// force-kill the remainder. As PID 1 we must never exit, so the caller
/// drops into the emergency shell afterwards.
pub fn shutdown(daemon: &mut Daemon) {
    info!("shutting down managed components");

    for idx in daemon.table.indices().collect::<Vec<_>>() {
        daemon.supervisor.terminate_component(&daemon.table, idx);
    }

    let deadline = Instant::now() + GRACE;
    while Instant::now() < deadline {
        daemon.drain_exits();
        if daemon.table.iter().all(|c| c.pid.is_none()) {
            info!("all components stopped");
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    for idx in daemon.table.indices().collect::<Vec<_>>() {
        if daemon.table.get(idx).and_then(|c| c.pid).is_some() {
            warn!(
                component = daemon.table.get(idx).map(|c| c.name()).unwrap_or(""),
                "did not stop in time; killing"
            );
            daemon.supervisor.kill_component(&daemon.table, idx);
        }
    }
    daemon.drain_exits();
}

/// Replace the daemon with an interactive shell. PID 1 exiting panics
/// the kernel, so this is the terminal fallback for both shutdown and
/// unrecoverable boot errors.
pub fn emergency_shell() -> ! {
    error!("dropping to emergency shell");
    let err = Command::new("/bin/sh").exec();
    // exec only returns on failure; nothing left but to idle.
    error!(error = %err, "emergency shell exec failed");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
