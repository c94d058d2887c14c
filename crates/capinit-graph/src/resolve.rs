use std::time::{Duration, Instant};

use capinit_domain::ComponentState;
use tracing::{debug, warn};

use crate::error::GraphError;
use crate::registry::CapabilityRegistry;
use crate::table::{ComponentTable, requirements_met};

/// Minimum gap between restart attempts of a failed component.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// The seam between the resolver and the process supervisor.
///
/// `start` owns the full start contract: it must leave the component in
/// `Starting`/`ReadyWait`/`Active` (registering provided capabilities
/// where the contract says so) or return an error and leave it untouched.
/// `terminate` delivers the terminate signal to the component's process
/// without mutating table state.
///
/// Tests substitute a deterministic fake so resolution can be exercised
/// without forking real processes.
pub trait Starter {
    fn start(
        &mut self,
        table: &mut ComponentTable,
        registry: &mut CapabilityRegistry,
        idx: usize,
    ) -> Result<(), GraphError>;

    fn terminate(&mut self, table: &mut ComponentTable, idx: usize);
}

/// Sweep the table once, executing at most one state transition per
/// component. Returns the number of transitions performed.
pub fn resolve_once(
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    starter: &mut dyn Starter,
) -> usize {
    let now = Instant::now();
    let mut transitions = 0;

    for idx in table.indices().collect::<Vec<_>>() {
        let (state, reqs_ok) = {
            let c = match table.get(idx) {
                Some(c) => c,
                None => continue,
            };
            (c.state, requirements_met(c, registry))
        };

        match state {
            ComponentState::Inactive if reqs_ok => {
                match starter.start(table, registry, idx) {
                    Ok(()) => transitions += 1,
                    Err(e) => {
                        let name = table.get(idx).map(|c| c.name().to_string()).unwrap_or_default();
                        warn!(component = %name, error = %e, "start failed");
                    }
                }
            }

            ComponentState::ReadyWait if !reqs_ok => {
                // A dependency vanished while we were waiting for readiness.
                // Nothing was registered yet, so there is nothing to withdraw.
                starter.terminate(table, idx);
                if let Some(c) = table.get_mut(idx) {
                    debug!(component = %c.name(), "dependency lost during ready-wait");
                    c.state = ComponentState::Failed;
                    c.pid = None;
                    c.ready_wait_start = None;
                }
                transitions += 1;
            }

            ComponentState::Active | ComponentState::Degraded if !reqs_ok => {
                registry.withdraw_provider(idx);
                starter.terminate(table, idx);
                if let Some(c) = table.get_mut(idx) {
                    warn!(component = %c.name(), "required capability lost; stopping");
                    c.state = ComponentState::Failed;
                    c.pid = None;
                }
                transitions += 1;
            }

            ComponentState::Failed if reqs_ok => {
                let eligible = table
                    .get(idx)
                    .and_then(|c| c.last_restart)
                    .map_or(true, |t| now.duration_since(t) >= RETRY_BACKOFF);
                if eligible {
                    if let Some(c) = table.get_mut(idx) {
                        debug!(component = %c.name(), "requirements restored; scheduling retry");
                        c.state = ComponentState::Inactive;
                    }
                    transitions += 1;
                }
            }

            // Starting, ReadyWait with deps intact, Active/Degraded with
            // deps intact, OneshotDone, Failed with unmet deps: stable
            // within a sweep.
            _ => {}
        }
    }

    transitions
}

/// Drive [`resolve_once`] to a fixed point.
///
/// Bounded at 2·n sweeps; exceeding the bound indicates a probable
/// dependency cycle and the sweep stops. The system recovers on the next
/// external event, which is always followed by another `resolve_full`.
pub fn resolve_full(
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    starter: &mut dyn Starter,
) {
    let bound = 2 * table.len().max(1);
    for _ in 0..bound {
        if resolve_once(table, registry, starter) == 0 {
            return;
        }
    }
    warn!(bound, "resolve did not reach a fixed point; probable dependency cycle");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::KERNEL_INDEX;
    use capinit_domain::{CapabilityName, ComponentKind, ComponentSpec, ReadinessMethod};

    /// Deterministic supervisor stand-in: every start succeeds instantly
    /// and follows the real start contract's state/registration rules.
    #[derive(Default)]
    struct FakeStarter {
        started: Vec<usize>,
        terminated: Vec<usize>,
        next_pid: i32,
    }

    impl Starter for FakeStarter {
        fn start(
            &mut self,
            table: &mut ComponentTable,
            registry: &mut CapabilityRegistry,
            idx: usize,
        ) -> Result<(), GraphError> {
            self.started.push(idx);
            self.next_pid += 1;
            let pid = 1000 + self.next_pid;

            let c = table.get_mut(idx).expect("valid index");
            c.pid = Some(pid);
            c.restart_count += 1;
            c.last_restart = Some(Instant::now());

            match (c.spec.kind, &c.spec.readiness.method) {
                (ComponentKind::Oneshot, _) => {
                    // Oneshot runs to completion immediately in the fake.
                    c.state = ComponentState::OneshotDone;
                    c.pid = None;
                    let provides: Vec<String> =
                        c.spec.provides.iter().map(|p| p.as_str().to_string()).collect();
                    for cap in provides {
                        registry.register(&cap, idx);
                    }
                }
                (_, ReadinessMethod::None) => {
                    c.state = ComponentState::Active;
                    let provides: Vec<String> =
                        c.spec.provides.iter().map(|p| p.as_str().to_string()).collect();
                    for cap in provides {
                        registry.register(&cap, idx);
                    }
                }
                _ => {
                    c.state = ComponentState::ReadyWait;
                    c.ready_wait_start = Some(Instant::now());
                }
            }
            Ok(())
        }

        fn terminate(&mut self, _table: &mut ComponentTable, idx: usize) {
            self.terminated.push(idx);
        }
    }

    fn spec(name: &str, provides: &[&str], requires: &[&str]) -> ComponentSpec {
        let mut s = ComponentSpec::new(name, "/bin/true");
        s.provides = provides.iter().map(|c| CapabilityName::new(*c)).collect();
        s.requires = requires.iter().map(|c| CapabilityName::new(*c)).collect();
        s
    }

    fn chain() -> (ComponentTable, CapabilityRegistry, usize, usize, usize) {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let a = table.insert(spec("a", &["x"], &[]), &mut reg);
        let b = table.insert(spec("b", &["y"], &["x"]), &mut reg);
        let c = table.insert(spec("c", &[], &["y"]), &mut reg);
        (table, reg, a, b, c)
    }

    #[test]
    fn cold_boot_starts_chain_in_dependency_order() {
        let (mut table, mut reg, a, b, c) = chain();
        let mut starter = FakeStarter::default();

        resolve_full(&mut table, &mut reg, &mut starter);

        assert_eq!(starter.started, vec![a, b, c]);
        for idx in [a, b, c] {
            assert_eq!(table.get(idx).unwrap().state, ComponentState::Active);
        }
        assert!(reg.active("x"));
        assert!(reg.active("y"));
    }

    #[test]
    fn fixed_point_within_two_n_sweeps() {
        let (mut table, mut reg, ..) = chain();
        let mut starter = FakeStarter::default();
        let bound = 2 * table.len();

        let mut sweeps = 0;
        loop {
            sweeps += 1;
            assert!(sweeps <= bound, "did not converge within 2n sweeps");
            if resolve_once(&mut table, &mut reg, &mut starter) == 0 {
                break;
            }
        }
        assert!(table.iter().skip(1).all(|c| c.state == ComponentState::Active));
    }

    #[test]
    fn oneshot_preserves_capabilities_after_exit() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let mut init_task = spec("init-task", &["filesystem"], &[]);
        init_task.kind = ComponentKind::Oneshot;
        let t = table.insert(init_task, &mut reg);
        let s = table.insert(spec("svc", &[], &["filesystem"]), &mut reg);

        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);

        assert_eq!(table.get(t).unwrap().state, ComponentState::OneshotDone);
        assert_eq!(table.get(s).unwrap().state, ComponentState::Active);
        assert!(reg.active("filesystem"), "oneshot output must stay active");
    }

    #[test]
    fn dependency_loss_cascades() {
        let (mut table, mut reg, _a, b, c) = chain();
        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);

        // b's process dies: supervisor marks it failed and withdraws y.
        reg.withdraw_provider(b);
        {
            let comp = table.get_mut(b).unwrap();
            comp.state = ComponentState::Failed;
            comp.pid = None;
        }

        // One sweep: c loses its requirement and fails too.
        resolve_once(&mut table, &mut reg, &mut starter);
        assert_eq!(table.get(c).unwrap().state, ComponentState::Failed);
        assert!(starter.terminated.contains(&c));
        assert!(!reg.active("y"));
    }

    #[test]
    fn failed_component_retries_after_backoff() {
        let (mut table, mut reg, _a, b, c) = chain();
        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);

        reg.withdraw_provider(b);
        {
            let comp = table.get_mut(b).unwrap();
            comp.state = ComponentState::Failed;
            comp.pid = None;
            // Restart attempt was recent: backoff must hold it.
            comp.last_restart = Some(Instant::now());
        }
        resolve_full(&mut table, &mut reg, &mut starter);
        assert_eq!(table.get(b).unwrap().state, ComponentState::Failed);

        // Pretend the backoff window has elapsed.
        let past = Instant::now().checked_sub(RETRY_BACKOFF + Duration::from_secs(1));
        table.get_mut(b).unwrap().last_restart = past;
        table.get_mut(c).unwrap().last_restart = past;
        resolve_full(&mut table, &mut reg, &mut starter);

        assert_eq!(table.get(b).unwrap().state, ComponentState::Active);
        assert_eq!(table.get(c).unwrap().state, ComponentState::Active);
        assert!(reg.active("y"));
    }

    #[test]
    fn ready_wait_component_fails_when_dependency_withdraws() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let a = table.insert(spec("a", &["x"], &[]), &mut reg);
        let mut slow = spec("slow", &[], &["x"]);
        slow.readiness.method = ReadinessMethod::File("/tmp/never".into());
        let s = table.insert(slow, &mut reg);

        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);
        assert_eq!(table.get(s).unwrap().state, ComponentState::ReadyWait);

        reg.withdraw_provider(a);
        {
            let comp = table.get_mut(a).unwrap();
            comp.state = ComponentState::Failed;
            comp.pid = None;
            comp.last_restart = Some(Instant::now());
        }
        resolve_once(&mut table, &mut reg, &mut starter);
        assert_eq!(table.get(s).unwrap().state, ComponentState::Failed);
        assert!(starter.terminated.contains(&s));
    }

    #[test]
    fn unsatisfiable_requirement_never_starts() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec("orphan", &[], &["no-such-cap"]), &mut reg);

        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Inactive);
        assert!(starter.started.is_empty());
    }

    #[test]
    fn kernel_pseudo_component_is_never_swept() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let mut starter = FakeStarter::default();
        resolve_full(&mut table, &mut reg, &mut starter);
        assert!(starter.started.is_empty());
        assert_eq!(
            table.get(KERNEL_INDEX).unwrap().state,
            ComponentState::OneshotDone
        );
    }
}
