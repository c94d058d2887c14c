use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use capinit_graph::{
    CapabilityRegistry, ComponentTable, ValidationMode, resolve_full, validate_graph,
};
use capinit_handoff::HandoffEngine;
use capinit_snapshot::{CheckpointEngine, CriuEngine, SnapshotStore};
use capinit_supervisor::{Supervisor, SupervisorConfig, poll_health, poll_readiness, signal_ready};
use capinit_domain::ComponentState;
use clap::Parser;
use nix::sys::signal::Signal;
use tracing::{info, warn};

/// Capability-graph init daemon.
#[derive(Debug, Parser, Clone)]
#[command(name = "capinitd", version, about)]
pub struct Options {
    /// Directory of component declaration files.
    #[arg(long, default_value = "/etc/capinit/components")]
    pub config_dir: PathBuf,

    /// Runtime directory: per-component logs, control socket, transient
    /// checkpoints.
    #[arg(long, default_value = "/run/capinit")]
    pub run_dir: PathBuf,

    /// Persistent state directory: durable checkpoints, kexec staging.
    #[arg(long, default_value = "/var/lib/capinit")]
    pub state_dir: PathBuf,

    /// Control socket path. Defaults to `<run-dir>/control.sock`.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    #[arg(long, default_value = "/sys/fs/cgroup")]
    pub cgroup_root: PathBuf,

    /// Log a startup dependency cycle instead of refusing to boot.
    #[arg(long)]
    pub warn_cycles: bool,

    /// Skip cgroup and namespace work (unprivileged runs).
    #[arg(long)]
    pub no_isolation: bool,

    /// Checkpoint/restore engine binary.
    #[arg(long, default_value = "criu")]
    pub criu: PathBuf,
}

impl Options {
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.run_dir.join("control.sock"))
    }

    pub fn kexec_staging(&self) -> PathBuf {
        self.state_dir.join("kexec")
    }
}

/// Counters surfaced by the `metrics` control command.
#[derive(Debug)]
pub struct Metrics {
    pub started: Instant,
    pub exits_reaped: u64,
    pub oom_events: u64,
    pub reloads: u64,
    pub upgrades: u64,
    pub upgrade_failures: u64,
    pub resolves: u64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            exits_reaped: 0,
            oom_events: 0,
            reloads: 0,
            upgrades: 0,
            upgrade_failures: 0,
            resolves: 0,
        }
    }
}

/// All daemon state, owned by the event loop. Every subsystem receives a
/// borrow; nothing here is shared across threads.
pub struct Daemon {
    pub opts: Options,
    pub table: ComponentTable,
    pub registry: CapabilityRegistry,
    pub supervisor: Supervisor,
    pub handoff: HandoffEngine,
    pub engine: Box<dyn CheckpointEngine>,
    pub transient: SnapshotStore,
    pub persistent: SnapshotStore,
    pub metrics: Metrics,
}

impl Daemon {
    pub fn new(opts: Options) -> anyhow::Result<Self> {
        let specs = capinit_config::load_components(&opts.config_dir).with_context(|| {
            format!("loading declarations from {}", opts.config_dir.display())
        })?;
        info!(count = specs.len(), dir = %opts.config_dir.display(), "loaded component declarations");

        let mut registry = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut registry);
        for spec in specs {
            if table.index_of(spec.name.as_str()).is_some() {
                warn!(component = %spec.name, "duplicate declaration; keeping the first");
                continue;
            }
            table.insert(spec, &mut registry);
        }

        let mode = if opts.warn_cycles {
            ValidationMode::WarnOnly
        } else {
            ValidationMode::Strict
        };
        validate_graph(&table, mode).context("startup graph validation")?;

        let supervisor = Supervisor::new(SupervisorConfig {
            run_dir: opts.run_dir.clone(),
            cgroup_root: opts.cgroup_root.clone(),
            isolation: !opts.no_isolation,
            ..SupervisorConfig::default()
        });

        let transient = SnapshotStore::new(opts.run_dir.join("checkpoints"));
        let persistent = SnapshotStore::new(opts.state_dir.join("checkpoints"));
        let engine: Box<dyn CheckpointEngine> = Box::new(CriuEngine::new(&opts.criu));

        Ok(Self {
            opts,
            table,
            registry,
            supervisor,
            handoff: HandoffEngine::default(),
            engine,
            transient,
            persistent,
            metrics: Metrics::new(),
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.opts.socket_path()
    }

    pub fn resolve(&mut self) {
        self.metrics.resolves += 1;
        resolve_full(&mut self.table, &mut self.registry, &mut self.supervisor);
    }

    /// Reap exited children and fold the results into the graph.
    pub fn drain_exits(&mut self) {
        let affected = self
            .supervisor
            .drain_exits(&mut self.table, &mut self.registry);
        self.metrics.exits_reaped += affected.len() as u64;
    }

    /// The fixed per-iteration work: drain exits, readiness poll, health
    /// poll, oom scan, then a fixed-point resolve. Runs on every loop
    /// iteration, even idle ones.
    pub fn tick(&mut self) {
        self.drain_exits();
        poll_readiness(&mut self.supervisor, &mut self.table, &mut self.registry);
        poll_health(&mut self.supervisor, &mut self.table, &mut self.registry);
        self.scan_oom();
        self.resolve();
    }

    /// An oom kill inside a component's cgroup is treated as a crash.
    fn scan_oom(&mut self) {
        for idx in self.supervisor.scan_oom(&self.table) {
            self.metrics.oom_events += 1;
            let name = self
                .table
                .get(idx)
                .map(|c| c.name().to_string())
                .unwrap_or_default();
            warn!(component = %name, "oom kill in cgroup; treating as crash");
            self.registry.withdraw_provider(idx);
            self.supervisor.kill_component(&self.table, idx);
            if let Some(c) = self.table.get_mut(idx) {
                c.state = ComponentState::Failed;
                c.pid = None;
            }
        }
    }

    /// Route an externally delivered readiness signal.
    pub fn route_ready_signal(&mut self, sig: Signal) {
        signal_ready(&mut self.table, &mut self.registry, sig);
        self.resolve();
    }

    /// SIGUSR2 handler body: dump the state table to the log.
    pub fn dump_state(&self) {
        info!("state dump requested");
        for c in self.table.iter() {
            info!(
                component = %c.name(),
                state = %c.state,
                pid = c.pid.unwrap_or(0),
                restarts = c.restart_count,
                "state"
            );
        }
        for cap in self.registry.iter() {
            info!(
                capability = %cap.name,
                active = cap.active,
                degraded = cap.degraded,
                provider = cap.provider.map(|p| p as i64).unwrap_or(-1),
                "capability"
            );
        }
    }
}
