use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use capinit_domain::{ComponentKind, ComponentState, IsolationSpec, ReadinessMethod};
use capinit_graph::{
    CapabilityRegistry, ComponentTable, GraphError, Starter,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::cgroup::CgroupDriver;
use crate::error::SupervisorError;
use crate::isolation::{EXIT_ISOLATION, child_setup};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-component log files live here as `<name>.log`.
    pub run_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub daemon_group: String,
    /// When false, cgroup and namespace work is skipped entirely
    /// (unprivileged runs, tests).
    pub isolation: bool,
    /// Window for the restart storm check.
    pub backoff_window: Duration,
    /// Restarts within the window before start refuses.
    pub backoff_limit: u32,
    /// Poll increment for probe and exit waits.
    pub probe_slice: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/run/capinit"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            daemon_group: "capinit".to_string(),
            isolation: true,
            backoff_window: Duration::from_secs(30),
            backoff_limit: 5,
            probe_slice: Duration::from_millis(100),
        }
    }
}

/// Process lifecycle driver: fork/exec with isolation, cgroup placement,
/// exit routing, restart backoff.
#[derive(Debug)]
pub struct Supervisor {
    pub cfg: SupervisorConfig,
    cgroups: CgroupDriver,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        let mut cgroups = CgroupDriver::new(
            cfg.cgroup_root.clone(),
            cfg.daemon_group.clone(),
            cfg.isolation,
        );
        cgroups.setup();
        Self { cfg, cgroups }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.cfg.run_dir.join(format!("{}.log", name))
    }

    fn cgroup_name(table: &ComponentTable, idx: usize) -> String {
        table
            .get(idx)
            .map(|c| {
                c.spec
                    .resources
                    .cgroup
                    .clone()
                    .unwrap_or_else(|| c.name().to_string())
            })
            .unwrap_or_default()
    }

    /// Start one component.
    ///
    /// Enforces restart backoff, creates the cgroup, spawns the child with
    /// isolation applied between fork and exec, places the pid in the
    /// cgroup with its limits, and performs the start-side state
    /// transition: no readiness method ⇒ `Active` with capabilities
    /// registered synchronously, otherwise `ReadyWait` with registration
    /// deferred to the readiness poller.
    pub fn start(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
    ) -> Result<(), SupervisorError> {
        let (name, binary, args, iso, kind, readiness_none, restart_count, last_restart) = {
            let c = table.get(idx).ok_or(SupervisorError::UnknownComponent(idx))?;
            (
                c.name().to_string(),
                c.spec.binary.clone(),
                c.spec.args.clone(),
                if self.cfg.isolation {
                    c.spec.isolation.clone()
                } else {
                    IsolationSpec::default()
                },
                c.spec.kind,
                matches!(c.spec.readiness.method, ReadinessMethod::None),
                c.restart_count,
                c.last_restart,
            )
        };

        if restart_count >= self.cfg.backoff_limit {
            if let Some(t) = last_restart {
                if t.elapsed() < self.cfg.backoff_window {
                    return Err(SupervisorError::Backoff {
                        component: name,
                        count: restart_count,
                    });
                }
            }
        }

        let group = Self::cgroup_name(table, idx);
        self.cgroups.create(&group)?;

        std::fs::create_dir_all(&self.cfg.run_dir).map_err(|e| SupervisorError::Io {
            path: self.cfg.run_dir.display().to_string(),
            source: e,
        })?;
        let log_path = self.log_path(&name);
        let open_log = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .map_err(|e| SupervisorError::Io {
                    path: log_path.display().to_string(),
                    source: e,
                })
        };
        let stdout = open_log()?;
        let stderr = open_log()?;

        let mut command = Command::new(&binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        unsafe {
            command.pre_exec(move || child_setup(&iso));
        }

        let child = command.spawn().map_err(|e| SupervisorError::Spawn {
            component: name.clone(),
            source: e,
        })?;
        let pid = child.id() as i32;
        // Reaping happens through the SIGCHLD drain, not through the Child
        // handle.
        drop(child);

        self.cgroups.attach(&group, pid);
        if let Some(c) = table.get(idx) {
            self.cgroups.apply_limits(&group, &c.spec.resources);
        }

        // A oneshot stays in Starting until it exits; its capabilities are
        // established by a successful exit, never by the spawn itself.
        let immediate = readiness_none && kind != ComponentKind::Oneshot;

        let now = Instant::now();
        if let Some(c) = table.get_mut(idx) {
            c.pid = Some(pid);
            c.restart_count += 1;
            c.last_restart = Some(now);
            c.health_failures = 0;
            c.last_health = None;
            if kind == ComponentKind::Oneshot {
                c.state = ComponentState::Starting;
                c.ready_wait_start = None;
            } else if immediate {
                c.state = ComponentState::Active;
                c.ready_wait_start = None;
            } else {
                c.state = ComponentState::ReadyWait;
                c.ready_wait_start = Some(now);
            }
        }

        if immediate {
            let provides: Vec<String> = table
                .get(idx)
                .map(|c| c.spec.provides.iter().map(|p| p.as_str().to_string()).collect())
                .unwrap_or_default();
            for cap in provides {
                registry.register(&cap, idx);
            }
        }

        info!(component = %name, pid, kind = %kind, "started");
        Ok(())
    }

    /// Reap every exited child without blocking and route known pids
    /// through [`Self::handle_exit`]. Returns the affected component
    /// indices.
    pub fn drain_exits(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
    ) -> Vec<usize> {
        let mut affected = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if let Some(idx) = self.route_exit(table, registry, pid.as_raw(), Some(code)) {
                        affected.push(idx);
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    debug!(pid = pid.as_raw(), signal = %sig, "child killed by signal");
                    if let Some(idx) = self.route_exit(table, registry, pid.as_raw(), None) {
                        affected.push(idx);
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        affected
    }

    fn route_exit(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        pid: i32,
        status: Option<i32>,
    ) -> Option<usize> {
        match table.by_pid(pid) {
            Some(idx) => {
                self.handle_exit(table, registry, idx, status);
                Some(idx)
            }
            None => {
                // As PID 1 we also inherit and reap unrelated orphans.
                debug!(pid, "reaped orphan");
                None
            }
        }
    }

    /// Apply the exit contract: oneshot exit 0 establishes its
    /// capabilities permanently; everything else is a failure that
    /// withdraws them. `status` is the exit code, or `None` for a
    /// signal death.
    pub fn handle_exit(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
        status: Option<i32>,
    ) {
        let group = Self::cgroup_name(table, idx);
        let Some(c) = table.get_mut(idx) else { return };
        let name = c.name().to_string();
        let oneshot_done = c.spec.kind == ComponentKind::Oneshot && status == Some(0);

        c.pid = None;
        c.ready_wait_start = None;

        if oneshot_done {
            c.state = ComponentState::OneshotDone;
            let provides: Vec<String> =
                c.spec.provides.iter().map(|p| p.as_str().to_string()).collect();
            for cap in provides {
                registry.register(&cap, idx);
            }
            info!(component = %name, "oneshot completed");
        } else {
            if status == Some(EXIT_ISOLATION) {
                warn!(component = %name, code = EXIT_ISOLATION, "child failed isolation setup");
            }
            c.state = ComponentState::Failed;
            registry.withdraw_provider(idx);
            warn!(component = %name, status = ?status, "component exited; marked failed");
        }

        self.cgroups.remove(&group);
    }

    /// Send the terminate signal to a component's process.
    pub fn terminate_component(&self, table: &ComponentTable, idx: usize) {
        self.signal_component(table, idx, Signal::SIGTERM);
    }

    pub fn kill_component(&self, table: &ComponentTable, idx: usize) {
        self.signal_component(table, idx, Signal::SIGKILL);
    }

    pub fn signal_component(&self, table: &ComponentTable, idx: usize, sig: Signal) {
        if let Some(pid) = table.get(idx).and_then(|c| c.pid) {
            if let Err(e) = kill(Pid::from_raw(pid), sig) {
                debug!(pid, signal = %sig, error = %e, "signal delivery failed");
            }
        }
    }

    /// New oom-kill events since the last scan, as component indices.
    pub fn scan_oom(&mut self, table: &ComponentTable) -> Vec<usize> {
        self.cgroups
            .scan_oom()
            .into_iter()
            .filter_map(|group| {
                (0..table.len()).find(|&idx| Self::cgroup_name(table, idx) == group)
            })
            .collect()
    }
}

impl Starter for Supervisor {
    fn start(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
    ) -> Result<(), GraphError> {
        Supervisor::start(self, table, registry, idx)
            .map_err(|e| GraphError::StartFailed(e.to_string()))
    }

    fn terminate(&mut self, table: &mut ComponentTable, idx: usize) {
        self.terminate_component(table, idx);
    }
}

/// Wait for `pid` to exit, reaping it, polling in `slice` increments up
/// to `timeout`. Returns true once the process is gone (or was never
/// ours to wait for).
pub fn wait_for_exit(pid: i32, timeout: Duration, slice: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(pid, error = %e, "waitpid failed");
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capinit_domain::{CapabilityName, ComponentSpec};

    fn test_supervisor() -> (Supervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            run_dir: dir.path().to_path_buf(),
            isolation: false,
            probe_slice: Duration::from_millis(10),
            ..SupervisorConfig::default()
        };
        (Supervisor::new(cfg), dir)
    }

    fn table_with(spec: ComponentSpec) -> (ComponentTable, CapabilityRegistry, usize) {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec, &mut reg);
        (table, reg, idx)
    }

    fn drain_until_exit(
        sup: &mut Supervisor,
        table: &mut ComponentTable,
        reg: &mut CapabilityRegistry,
        idx: usize,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while table.get(idx).unwrap().pid.is_some() {
            sup.drain_exits(table, reg);
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn service_start_registers_capabilities_immediately() {
        let (mut sup, _dir) = test_supervisor();
        let mut spec = ComponentSpec::new("sleeper", "/bin/sleep");
        spec.args = vec!["30".to_string()];
        spec.provides = vec![CapabilityName::new("zzz")];
        let (mut table, mut reg, idx) = table_with(spec);

        sup.start(&mut table, &mut reg, idx).unwrap();
        let c = table.get(idx).unwrap();
        assert_eq!(c.state, ComponentState::Active);
        assert!(c.pid.is_some());
        assert!(reg.active("zzz"));
        assert_eq!(reg.provider("zzz"), Some(idx));

        sup.terminate_component(&table, idx);
        drain_until_exit(&mut sup, &mut table, &mut reg, idx);

        let c = table.get(idx).unwrap();
        assert_eq!(c.state, ComponentState::Failed);
        assert!(c.pid.is_none());
        assert!(!reg.active("zzz"));
    }

    #[test]
    fn oneshot_success_becomes_done_and_keeps_capabilities() {
        let (mut sup, _dir) = test_supervisor();
        let mut spec = ComponentSpec::new("task", "/bin/true");
        spec.kind = ComponentKind::Oneshot;
        spec.provides = vec![CapabilityName::new("prepared")];
        let (mut table, mut reg, idx) = table_with(spec);

        sup.start(&mut table, &mut reg, idx).unwrap();
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Starting);
        assert!(!reg.active("prepared"), "oneshot output waits for exit 0");

        drain_until_exit(&mut sup, &mut table, &mut reg, idx);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::OneshotDone);
        assert!(reg.active("prepared"));
    }

    #[test]
    fn oneshot_failure_is_failed() {
        let (mut sup, _dir) = test_supervisor();
        let mut spec = ComponentSpec::new("task", "/bin/false");
        spec.kind = ComponentKind::Oneshot;
        spec.provides = vec![CapabilityName::new("prepared")];
        let (mut table, mut reg, idx) = table_with(spec);

        sup.start(&mut table, &mut reg, idx).unwrap();
        drain_until_exit(&mut sup, &mut table, &mut reg, idx);

        assert_eq!(table.get(idx).unwrap().state, ComponentState::Failed);
        assert!(!reg.active("prepared"));
    }

    #[test]
    fn readiness_method_defers_registration() {
        let (mut sup, _dir) = test_supervisor();
        let mut spec = ComponentSpec::new("slow", "/bin/sleep");
        spec.args = vec!["30".to_string()];
        spec.provides = vec![CapabilityName::new("slow-cap")];
        spec.readiness.method = ReadinessMethod::File("/nonexistent/ready".into());
        let (mut table, mut reg, idx) = table_with(spec);

        sup.start(&mut table, &mut reg, idx).unwrap();
        let c = table.get(idx).unwrap();
        assert_eq!(c.state, ComponentState::ReadyWait);
        assert!(c.ready_wait_start.is_some());
        assert!(!reg.active("slow-cap"), "registration must wait for readiness");

        sup.kill_component(&table, idx);
        drain_until_exit(&mut sup, &mut table, &mut reg, idx);
    }

    #[test]
    fn backoff_refuses_restart_storm() {
        let (mut sup, _dir) = test_supervisor();
        let spec = ComponentSpec::new("flappy", "/bin/true");
        let (mut table, mut reg, idx) = table_with(spec);

        {
            let c = table.get_mut(idx).unwrap();
            c.restart_count = 5;
            c.last_restart = Some(Instant::now());
        }
        let err = sup.start(&mut table, &mut reg, idx).unwrap_err();
        assert!(matches!(err, SupervisorError::Backoff { .. }));
    }

    #[test]
    fn spawn_failure_is_reported_not_fatal() {
        let (mut sup, _dir) = test_supervisor();
        let spec = ComponentSpec::new("ghost", "/nonexistent/binary");
        let (mut table, mut reg, idx) = table_with(spec);

        let err = sup.start(&mut table, &mut reg, idx).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Inactive);
        assert!(table.get(idx).unwrap().pid.is_none());
    }

    #[test]
    fn wait_for_exit_reaps_terminated_child() {
        let (mut sup, _dir) = test_supervisor();
        let mut spec = ComponentSpec::new("victim", "/bin/sleep");
        spec.args = vec!["30".to_string()];
        let (mut table, mut reg, idx) = table_with(spec);

        sup.start(&mut table, &mut reg, idx).unwrap();
        let pid = table.get(idx).unwrap().pid.unwrap();
        sup.kill_component(&table, idx);
        assert!(wait_for_exit(pid, Duration::from_secs(5), Duration::from_millis(10)));
    }
}
