mod daemon;
mod event_loop;
mod kexec;
mod reload;
mod server;
mod shutdown;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::daemon::{Daemon, Options};

/// PID-1 init daemon around a declarative capability dependency graph.
///
/// Single-threaded by construction: the current-thread runtime keeps
/// every table mutation on one thread, so the registry, component table
/// and in-flight handoffs need no locks.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Options::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let pid1 = std::process::id() == 1;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid1,
        config_dir = %opts.config_dir.display(),
        "capinitd starting"
    );

    let mut daemon = match Daemon::new(opts) {
        Ok(daemon) => daemon,
        Err(e) => {
            // Configuration errors refuse to boot, but PID 1 must never
            // crash: hand the console to an operator instead.
            error!(error = %format!("{:#}", e), "boot failed");
            if pid1 {
                shutdown::emergency_shell();
            }
            return Err(e);
        }
    };

    kexec::resume_from_manifest(&mut daemon);

    let result = event_loop::run(&mut daemon).await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "event loop failed");
    }

    if pid1 {
        shutdown::emergency_shell();
    }
    result
}
