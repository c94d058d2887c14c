use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::Signal;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::server;
use crate::{reload, shutdown};

/// The single thread of control.
///
/// One `select!` waits on child-exit notifications (tokio's signal stream
/// is the self-pipe: the handler only wakes the loop, reaping happens
/// here), control connections, declaration-directory changes, and the
/// reload/dump signals, capped at one second so the periodic scans fire
/// on idle systems. Every iteration then runs the fixed tick: drain
/// exits, readiness poll, health poll, oom scan, fixed-point resolve.
/// The effect of one event is observed in full before the next is
/// serviced.
pub async fn run(daemon: &mut Daemon) -> anyhow::Result<()> {
    std::fs::create_dir_all(&daemon.opts.run_dir)
        .with_context(|| format!("creating {}", daemon.opts.run_dir.display()))?;
    let socket_path = daemon.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "control socket ready");

    let mut sigchld = signal(SignalKind::child()).context("SIGCHLD stream")?;
    let mut sighup = signal(SignalKind::hangup()).context("SIGHUP stream")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("SIGUSR1 stream")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("SIGUSR2 stream")?;
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM stream")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT stream")?;

    // Declaration-directory watch. The notify callback runs on the
    // watcher's own thread and only pushes a wakeup token; all reload
    // work happens on this thread.
    let (watch_tx, mut watch_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let _ = watch_tx.send(());
                }
            }
        })
        .context("creating config watcher")?;
    if let Err(e) = watcher.watch(&daemon.opts.config_dir, RecursiveMode::NonRecursive) {
        warn!(dir = %daemon.opts.config_dir.display(), error = %e, "config watch unavailable; reload via SIGHUP only");
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Bring the graph up before the first wait.
    daemon.resolve();
    info!("entering event loop");

    loop {
        tokio::select! {
            _ = sigchld.recv() => {
                daemon.drain_exits();
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => server::handle_connection(daemon, stream).await,
                    Err(e) => warn!(error = %e, "control accept failed"),
                }
            }
            Some(()) = watch_rx.recv() => {
                // Editors and package managers touch several files in one
                // burst; coalesce before reloading.
                while watch_rx.try_recv().is_ok() {}
                info!("declaration directory changed");
                reload::reload(daemon);
            }
            _ = sighup.recv() => {
                info!("reload requested");
                reload::reload(daemon);
            }
            _ = sigusr1.recv() => {
                daemon.route_ready_signal(Signal::SIGUSR1);
            }
            _ = sigusr2.recv() => {
                daemon.dump_state();
            }
            _ = sigterm.recv() => {
                info!("terminate requested");
                break;
            }
            _ = sigint.recv() => {
                info!("interrupt requested");
                break;
            }
            _ = interval.tick() => {}
        }

        daemon.tick();
    }

    shutdown::shutdown(daemon);
    Ok(())
}
