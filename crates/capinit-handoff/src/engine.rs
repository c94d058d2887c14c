use std::fs::OpenOptions;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use capinit_domain::{ComponentState, HandoffKind, ReadinessMethod};
use capinit_graph::{CapabilityRegistry, ComponentTable};
use capinit_snapshot::{CheckpointEngine, SnapshotMeta, SnapshotStore};
use capinit_supervisor::{Supervisor, wait_for_exit};
use nix::sys::signal::{Signal, kill};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::{Pid, dup2};
use tracing::{debug, info, warn};

use crate::context::{HandoffContext, HandoffPhase};
use crate::error::HandoffError;

/// Well-known descriptor number the replacement process inherits one end
/// of the handoff socket on.
pub const HANDOFF_FD: i32 = 4;
/// Environment variable advertising [`HANDOFF_FD`] to the replacement.
pub const HANDOFF_FD_ENV: &str = "CAPINIT_HANDOFF_FD";
/// Literal completion marker the replacement writes once it owns every
/// transferred descriptor.
pub const HANDOFF_MARKER: &[u8] = b"HANDOFF_COMPLETE\n";
/// Delivered to the old process to begin descriptor transfer.
pub const HANDOFF_SIGNAL: Signal = Signal::SIGUSR1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Checkpoint,
    FdPassing,
    Restart,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Checkpoint => write!(f, "checkpoint"),
            Strategy::FdPassing => write!(f, "fd-passing"),
            Strategy::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug)]
pub struct UpgradeReport {
    pub component: String,
    /// The strategy that completed the upgrade.
    pub strategy: Strategy,
    pub new_pid: Option<i32>,
    /// Strategies that failed before the winning one, with their errors.
    pub fallbacks: Vec<(Strategy, String)>,
}

/// Zero-downtime upgrade driver.
///
/// Three strategies in descending order of state preservation; the
/// component's declared preference picks the entry point and each failure
/// falls through to the next. A component is never left partial: either
/// the new pid owns the record and the old pid is reaped, or the old pid
/// remains and the request returns the error.
#[derive(Debug, Clone)]
pub struct HandoffEngine {
    /// Deadline for the completion marker after signalling the old process.
    pub marker_timeout: Duration,
    /// Grace the old process gets to exit on its own after a successful
    /// transfer.
    pub settle: Duration,
    /// Terminate-to-kill window for the plain restart path.
    pub stop_timeout: Duration,
    /// Poll increment for exit waits.
    pub slice: Duration,
}

impl Default for HandoffEngine {
    fn default() -> Self {
        Self {
            marker_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            slice: Duration::from_millis(100),
        }
    }
}

impl HandoffEngine {
    pub fn upgrade(
        &self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        sup: &mut Supervisor,
        engine: &dyn CheckpointEngine,
        transient: &SnapshotStore,
        idx: usize,
    ) -> Result<UpgradeReport, HandoffError> {
        let (name, running, preference) = {
            let c = table.get(idx).ok_or(HandoffError::UnknownComponent(idx))?;
            (c.name().to_string(), c.state.is_running() && c.pid.is_some(), c.spec.handoff)
        };
        if !running {
            return Err(HandoffError::NotRunning(name));
        }

        let strategies: &[Strategy] = match preference {
            HandoffKind::Checkpoint => {
                &[Strategy::Checkpoint, Strategy::FdPassing, Strategy::Restart]
            }
            HandoffKind::FdPassing => &[Strategy::FdPassing, Strategy::Restart],
            HandoffKind::None => &[Strategy::Restart],
        };

        let mut fallbacks = Vec::new();
        for &strategy in strategies {
            let attempt = match strategy {
                Strategy::Checkpoint => self.try_checkpoint(table, registry, idx, engine, transient),
                Strategy::FdPassing => self.try_fd_passing(table, registry, sup, idx),
                Strategy::Restart => self.restart(table, registry, sup, idx),
            };
            match attempt {
                Ok(new_pid) => {
                    info!(component = %name, strategy = %strategy, new_pid, "upgrade complete");
                    return Ok(UpgradeReport {
                        component: name,
                        strategy,
                        new_pid,
                        fallbacks,
                    });
                }
                Err(e) => {
                    warn!(component = %name, strategy = %strategy, error = %e, "upgrade strategy failed");
                    fallbacks.push((strategy, e.to_string()));
                }
            }
        }

        Err(HandoffError::UpgradeFailed {
            component: name,
            attempts: fallbacks,
        })
    }

    // ── Level 1: checkpoint/restore ───────────────────────────────────────────

    fn try_checkpoint(
        &self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
        engine: &dyn CheckpointEngine,
        transient: &SnapshotStore,
    ) -> Result<Option<i32>, HandoffError> {
        if !engine.supported() {
            return Err(HandoffError::EngineUnsupported);
        }

        let (name, old_pid, capabilities, preserve_fds) = {
            let c = table.get(idx).ok_or(HandoffError::UnknownComponent(idx))?;
            (
                c.name().to_string(),
                c.pid.ok_or_else(|| HandoffError::NotRunning(c.name().to_string()))?,
                c.spec
                    .provides
                    .iter()
                    .map(|p| p.as_str().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                c.spec.checkpoint.preserve_fds.clone(),
            )
        };

        let mut ctx = HandoffContext::new(idx, self.marker_timeout);
        let id = SnapshotStore::new_id();
        let dir = transient.create_dir(&name, &id)?;

        // The image is taken with the process left running so a failure
        // at any point below leaves the component untouched.
        let result = (|| -> Result<i32, HandoffError> {
            ctx.advance(HandoffPhase::Ready);
            engine.checkpoint(old_pid, &dir, true)?;

            let meta = SnapshotMeta {
                component_name: name.clone(),
                original_pid: old_pid,
                timestamp: SnapshotStore::timestamp_of(&id).unwrap_or_else(|| {
                    SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0)
                }),
                image_size: transient.entry_size(&name, &id),
                capabilities,
                criu_version: engine.version().unwrap_or_default(),
                leave_running: true,
                preserve_fds,
            };
            transient.save_meta(&name, &id, &meta)?;

            if ctx.expired() {
                return Err(HandoffError::Expired(ctx.phase));
            }
            ctx.advance(HandoffPhase::Transferring);
            engine.validate(&dir)?;
            let new_pid = engine.restore(&dir)?;

            ctx.advance(HandoffPhase::Completing);
            Ok(new_pid)
        })();

        match result {
            Ok(new_pid) => {
                ctx.new_pid = Some(new_pid);
                self.retire_old(old_pid);
                self.adopt(table, registry, idx, new_pid);
                debug!(handoff = %ctx.id, new_pid = ctx.new_pid, "checkpoint handoff complete");
                Ok(Some(new_pid))
            }
            Err(e) => {
                let phase = ctx.fail();
                warn!(
                    handoff = %ctx.id,
                    component = %name,
                    phase = %phase,
                    error = %e,
                    "checkpoint handoff failed"
                );
                if let Err(cleanup) = transient.remove(&name, &id) {
                    warn!(component = %name, id = %id, error = %cleanup, "checkpoint cleanup failed");
                }
                Err(e)
            }
        }
    }

    // ── Level 2: descriptor passing ───────────────────────────────────────────

    fn try_fd_passing(
        &self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        sup: &mut Supervisor,
        idx: usize,
    ) -> Result<Option<i32>, HandoffError> {
        let (name, old_pid, binary, args) = {
            let c = table.get(idx).ok_or(HandoffError::UnknownComponent(idx))?;
            (
                c.name().to_string(),
                c.pid.ok_or_else(|| HandoffError::NotRunning(c.name().to_string()))?,
                c.spec.binary.clone(),
                c.spec.args.clone(),
            )
        };

        let mut ctx = HandoffContext::new(idx, self.marker_timeout);

        // One end stays with us to watch for the completion marker; the
        // other is pinned to the well-known descriptor in the fresh
        // instance. The actual descriptor transfer between old and new
        // process rides the socket's ancillary data and is their contract,
        // not ours.
        let (parent_end, child_end): (OwnedFd, OwnedFd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| HandoffError::Socket(std::io::Error::from_raw_os_error(e as i32)))?;

        let log_path = sup.log_path(&name);
        let open_log = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .map_err(HandoffError::Spawn)
        };

        let child_raw = child_end.as_raw_fd();
        let mut command = Command::new(&binary);
        command
            .args(&args)
            .env(HANDOFF_FD_ENV, HANDOFF_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(open_log()?))
            .stderr(Stdio::from(open_log()?));
        unsafe {
            command.pre_exec(move || {
                dup2(child_raw, HANDOFF_FD)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        ctx.advance(HandoffPhase::Ready);
        let child = command.spawn().map_err(HandoffError::Spawn)?;
        let new_pid = child.id() as i32;
        drop(child);
        drop(child_end);
        ctx.new_pid = Some(new_pid);

        // Tell the old process to start handing its descriptors over.
        ctx.advance(HandoffPhase::Transferring);
        if let Err(e) = kill(Pid::from_raw(old_pid), HANDOFF_SIGNAL) {
            warn!(component = %name, pid = old_pid, error = %e, "handoff signal failed");
        }

        let stream = UnixStream::from(parent_end);
        match self.await_marker(&stream, &ctx) {
            Ok(()) => {
                ctx.advance(HandoffPhase::Completing);
                self.retire_old(old_pid);
                self.adopt(table, registry, idx, new_pid);
                debug!(handoff = %ctx.id, new_pid = ctx.new_pid, "fd-passing handoff complete");
                Ok(Some(new_pid))
            }
            Err(e) => {
                let phase = ctx.fail();
                warn!(
                    handoff = %ctx.id,
                    component = %name,
                    phase = %phase,
                    new_pid = ctx.new_pid,
                    error = %e,
                    "fd-passing handoff failed"
                );
                let _ = kill(Pid::from_raw(new_pid), Signal::SIGKILL);
                wait_for_exit(new_pid, self.settle, self.slice);
                Err(e)
            }
        }
    }

    fn await_marker(&self, stream: &UnixStream, ctx: &HandoffContext) -> Result<(), HandoffError> {
        let mut got = Vec::with_capacity(HANDOFF_MARKER.len());
        let mut buf = [0u8; 64];

        loop {
            if ctx.expired() {
                return Err(HandoffError::MarkerTimeout {
                    phase: ctx.phase,
                    waited_secs: ctx.timeout.as_secs(),
                });
            }
            let remaining = ctx
                .deadline()
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            stream
                .set_read_timeout(Some(remaining))
                .map_err(HandoffError::Socket)?;

            match (&mut &*stream).read(&mut buf) {
                Ok(0) => return Err(HandoffError::SocketClosed),
                Ok(n) => {
                    got.extend_from_slice(&buf[..n]);
                    if got.len() >= HANDOFF_MARKER.len() {
                        return if &got[..HANDOFF_MARKER.len()] == HANDOFF_MARKER {
                            Ok(())
                        } else {
                            Err(HandoffError::SocketClosed)
                        };
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HandoffError::Socket(e)),
            }
        }
    }

    // ── Level 3: plain restart ────────────────────────────────────────────────

    fn restart(
        &self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        sup: &mut Supervisor,
        idx: usize,
    ) -> Result<Option<i32>, HandoffError> {
        let old_pid = table
            .get(idx)
            .ok_or(HandoffError::UnknownComponent(idx))?
            .pid;

        registry.withdraw_provider(idx);

        if let Some(pid) = old_pid {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            if !wait_for_exit(pid, self.stop_timeout, self.slice) {
                warn!(pid, "component ignored terminate; killing");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                wait_for_exit(pid, self.settle, self.slice);
            }
        }

        if let Some(c) = table.get_mut(idx) {
            c.pid = None;
            c.state = ComponentState::Inactive;
            c.restart_count = 0;
            c.last_restart = None;
            c.health_failures = 0;
            c.ready_wait_start = None;
        }

        sup.start(table, registry, idx)
            .map_err(|e| HandoffError::Restart(e.to_string()))?;
        Ok(table.get(idx).and_then(|c| c.pid))
    }

    // ── Shared tail ───────────────────────────────────────────────────────────

    /// Give the outgoing process its settle window, then force it out and
    /// reap it.
    fn retire_old(&self, old_pid: i32) {
        let _ = kill(Pid::from_raw(old_pid), Signal::SIGTERM);
        if !wait_for_exit(old_pid, self.settle, self.slice) {
            let _ = kill(Pid::from_raw(old_pid), Signal::SIGKILL);
            wait_for_exit(old_pid, self.settle, self.slice);
        }
    }

    /// The new pid takes over the component record. With a readiness
    /// method configured the component proves itself again; otherwise its
    /// capabilities are re-registered immediately.
    fn adopt(
        &self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
        new_pid: i32,
    ) {
        let (needs_readiness, provides) = {
            let Some(c) = table.get_mut(idx) else { return };
            c.pid = Some(new_pid);
            c.health_failures = 0;
            c.last_health = None;
            c.last_health_ok = None;
            let needs_readiness = !matches!(c.spec.readiness.method, ReadinessMethod::None);
            if needs_readiness {
                c.state = ComponentState::ReadyWait;
                c.ready_wait_start = Some(Instant::now());
            } else {
                c.state = ComponentState::Active;
            }
            (
                needs_readiness,
                c.spec.provides.iter().map(|p| p.as_str().to_string()).collect::<Vec<_>>(),
            )
        };

        if needs_readiness {
            registry.withdraw_provider(idx);
        } else {
            for cap in provides {
                registry.register(&cap, idx);
            }
        }
    }
}
