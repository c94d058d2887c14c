use std::time::{Duration, Instant};

use capinit_domain::{ComponentState, ReadinessMethod};
use capinit_graph::{CapabilityRegistry, ComponentTable};
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::probe::{ProbeOutcome, run_probe};
use crate::spawn::Supervisor;

/// Ceiling for a single readiness command probe.
const MAX_PROBE: Duration = Duration::from_secs(10);

fn promote(table: &mut ComponentTable, registry: &mut CapabilityRegistry, idx: usize) {
    let provides: Vec<String> = {
        let Some(c) = table.get_mut(idx) else { return };
        c.state = ComponentState::Active;
        c.ready_wait_start = None;
        c.ready_last_probe = None;
        info!(component = %c.name(), "ready");
        c.spec.provides.iter().map(|p| p.as_str().to_string()).collect()
    };
    for cap in provides {
        registry.register(&cap, idx);
    }
}

/// One readiness sweep over every component in `ReadyWait`.
///
/// A component past its readiness deadline is terminated and marked
/// failed; otherwise its configured method is evaluated. The SIGNAL
/// method is never driven here — only [`signal_ready`] promotes it.
pub fn poll_readiness(
    sup: &mut Supervisor,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
) {
    let now = Instant::now();
    let slice = sup.cfg.probe_slice;

    for idx in table.indices().collect::<Vec<_>>() {
        let Some(c) = table.get(idx) else { continue };
        if c.state != ComponentState::ReadyWait {
            continue;
        }

        let started = c.ready_wait_start.unwrap_or(now);
        let spec = c.spec.readiness.clone();
        let name = c.name().to_string();

        let elapsed = now.duration_since(started);
        if elapsed >= spec.timeout {
            warn!(component = %name, elapsed_secs = elapsed.as_secs(), "readiness timeout; terminating");
            sup.terminate_component(table, idx);
            if let Some(c) = table.get_mut(idx) {
                c.state = ComponentState::Failed;
                c.pid = None;
                c.ready_wait_start = None;
            }
            continue;
        }

        let ready = match &spec.method {
            ReadinessMethod::File(path) => path.exists(),
            ReadinessMethod::Command(cmd) => {
                let due = table
                    .get(idx)
                    .and_then(|c| c.ready_last_probe)
                    .map_or(true, |t| now.duration_since(t) >= spec.interval);
                if !due {
                    continue;
                }
                if let Some(c) = table.get_mut(idx) {
                    c.ready_last_probe = Some(now);
                }
                let budget = MAX_PROBE.min(spec.timeout - elapsed);
                match run_probe(cmd, budget, slice) {
                    Ok(ProbeOutcome::Ok) => true,
                    Ok(_) => false,
                    Err(e) => {
                        warn!(component = %name, error = %e, "readiness probe failed to run");
                        false
                    }
                }
            }
            ReadinessMethod::Signal(_) | ReadinessMethod::None => continue,
        };

        if ready {
            promote(table, registry, idx);
        }
    }
}

/// Route an externally delivered readiness signal to the components that
/// declared it. A matching component not in `ReadyWait` is an invariant
/// violation: the stray signal is logged and dropped without mutating
/// state. Returns the number of promotions.
pub fn signal_ready(
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    sig: Signal,
) -> usize {
    let mut promoted = 0;
    for idx in table.indices().collect::<Vec<_>>() {
        let Some(c) = table.get(idx) else { continue };
        if c.spec.readiness.method != ReadinessMethod::Signal(sig) {
            continue;
        }
        if c.state == ComponentState::ReadyWait {
            promote(table, registry, idx);
            promoted += 1;
        } else {
            warn!(component = %c.name(), state = %c.state, "readiness signal while not waiting; ignored");
        }
    }
    if promoted == 0 {
        warn!(signal = %sig, "readiness signal matched no waiting component");
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::SupervisorConfig;
    use capinit_domain::{CapabilityName, ComponentSpec};

    fn fixture(method: ReadinessMethod, timeout: Duration) -> (Supervisor, ComponentTable, CapabilityRegistry, usize) {
        let cfg = SupervisorConfig {
            run_dir: std::env::temp_dir(),
            isolation: false,
            probe_slice: Duration::from_millis(10),
            ..SupervisorConfig::default()
        };
        let sup = Supervisor::new(cfg);

        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let mut spec = ComponentSpec::new("waiting", "/bin/true");
        spec.provides = vec![CapabilityName::new("served")];
        spec.readiness.method = method;
        spec.readiness.timeout = timeout;
        spec.readiness.interval = Duration::from_millis(0);
        let idx = table.insert(spec, &mut reg);
        {
            let c = table.get_mut(idx).unwrap();
            c.state = ComponentState::ReadyWait;
            c.ready_wait_start = Some(Instant::now());
        }
        (sup, table, reg, idx)
    }

    #[test]
    fn file_readiness_promotes_when_path_appears() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");
        let (mut sup, mut table, mut reg, idx) =
            fixture(ReadinessMethod::File(marker.clone()), Duration::from_secs(30));

        poll_readiness(&mut sup, &mut table, &mut reg);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::ReadyWait);
        assert!(!reg.active("served"));

        std::fs::write(&marker, b"").unwrap();
        poll_readiness(&mut sup, &mut table, &mut reg);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Active);
        assert!(reg.active("served"));
    }

    #[test]
    fn command_readiness_probes() {
        let (mut sup, mut table, mut reg, idx) = fixture(
            ReadinessMethod::Command("exit 0".into()),
            Duration::from_secs(30),
        );
        poll_readiness(&mut sup, &mut table, &mut reg);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Active);
    }

    #[test]
    fn readiness_deadline_fails_component() {
        let (mut sup, mut table, mut reg, idx) = fixture(
            ReadinessMethod::File("/nonexistent/ready".into()),
            Duration::from_millis(50),
        );
        table.get_mut(idx).unwrap().ready_wait_start =
            Instant::now().checked_sub(Duration::from_secs(1));

        poll_readiness(&mut sup, &mut table, &mut reg);
        let c = table.get(idx).unwrap();
        assert_eq!(c.state, ComponentState::Failed);
        assert!(c.pid.is_none());
        assert!(!reg.active("served"));
    }

    #[test]
    fn signal_readiness_is_not_polled() {
        let (mut sup, mut table, mut reg, idx) = fixture(
            ReadinessMethod::Signal(Signal::SIGUSR1),
            Duration::from_secs(30),
        );
        poll_readiness(&mut sup, &mut table, &mut reg);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::ReadyWait);

        let promoted = signal_ready(&mut table, &mut reg, Signal::SIGUSR1);
        assert_eq!(promoted, 1);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Active);
        assert!(reg.active("served"));
    }

    #[test]
    fn stray_readiness_signal_is_dropped() {
        let (_sup, mut table, mut reg, idx) = fixture(
            ReadinessMethod::Signal(Signal::SIGUSR1),
            Duration::from_secs(30),
        );
        table.get_mut(idx).unwrap().state = ComponentState::Active;
        let promoted = signal_ready(&mut table, &mut reg, Signal::SIGUSR1);
        assert_eq!(promoted, 0);
        assert_eq!(table.get(idx).unwrap().state, ComponentState::Active);
    }
}
