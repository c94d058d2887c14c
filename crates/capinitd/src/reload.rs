use std::time::Instant;

use capinit_domain::ComponentState;
use capinit_graph::{CapabilityRegistry, ComponentTable, ValidationMode, validate_graph};
use tracing::{info, warn};

use crate::daemon::Daemon;

/// Carried-over runtime state for one surviving component.
struct Snapshot {
    name: String,
    pid: Option<i32>,
    state: ComponentState,
    restart_count: u32,
    last_restart: Option<Instant>,
    health_failures: u32,
}

/// Configuration reload: snapshot each component's runtime identity,
/// rebuild the table from the declaration directory, restore by name,
/// re-register capabilities for the survivors that are providing, then
/// validate (warn-only, always) and resolve.
///
/// Components that vanished from the directory are terminated; their
/// processes would otherwise run unsupervised.
pub fn reload(daemon: &mut Daemon) {
    let specs = match capinit_config::load_components(&daemon.opts.config_dir) {
        Ok(specs) => specs,
        Err(e) => {
            warn!(error = %e, "reload aborted; keeping the running configuration");
            return;
        }
    };

    let snapshots: Vec<Snapshot> = daemon
        .table
        .iter()
        .map(|c| Snapshot {
            name: c.name().to_string(),
            pid: c.pid,
            state: c.state,
            restart_count: c.restart_count,
            last_restart: c.last_restart,
            health_failures: c.health_failures,
        })
        .collect();

    let mut registry = CapabilityRegistry::new();
    let mut table = ComponentTable::with_kernel(&mut registry);
    for spec in specs {
        if table.index_of(spec.name.as_str()).is_some() {
            warn!(component = %spec.name, "duplicate declaration; keeping the first");
            continue;
        }
        table.insert(spec, &mut registry);
    }

    // Restore runtime state by name; indices may have moved.
    for snap in &snapshots {
        if snap.name == "kernel" {
            continue;
        }
        match table.index_of(&snap.name) {
            Some(idx) => {
                let c = table.get_mut(idx).expect("index from lookup");
                c.pid = snap.pid;
                c.state = snap.state;
                c.restart_count = snap.restart_count;
                c.last_restart = snap.last_restart;
                c.health_failures = snap.health_failures;
            }
            None => {
                if let Some(pid) = snap.pid {
                    info!(component = %snap.name, pid, "removed from configuration; terminating");
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
            }
        }
    }

    // Re-register capabilities for the survivors that are currently
    // providing them; a degraded survivor keeps its degraded flag.
    for idx in table.indices().collect::<Vec<_>>() {
        let Some(c) = table.get(idx) else { continue };
        let providing = c.state.provides_active() || c.state == ComponentState::Degraded;
        if !providing {
            continue;
        }
        let degraded = c.state == ComponentState::Degraded;
        let provides: Vec<String> =
            c.spec.provides.iter().map(|p| p.as_str().to_string()).collect();
        for cap in provides {
            registry.register(&cap, idx);
            if degraded {
                registry.mark_degraded(&cap, true);
            }
        }
    }

    daemon.table = table;
    daemon.registry = registry;
    daemon.metrics.reloads += 1;

    // Runtime reload never refuses on a cycle.
    let _ = validate_graph(&daemon.table, ValidationMode::WarnOnly);
    daemon.resolve();
    info!(components = daemon.table.len() - 1, "configuration reloaded");
}
