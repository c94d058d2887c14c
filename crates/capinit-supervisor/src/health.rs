use std::time::Instant;

use capinit_domain::ComponentState;
use capinit_graph::{CapabilityRegistry, ComponentTable};
use tracing::{debug, info, warn};

use crate::probe::{ProbeOutcome, run_probe};
use crate::spawn::Supervisor;

/// One health sweep over every `Active`/`Degraded` component with a
/// configured probe.
///
/// A probe not older than its interval is skipped. Consecutive failures
/// carry across the `Active → Degraded` transition: the degraded
/// threshold flips the per-capability degraded flag, the restart
/// threshold withdraws capabilities and forces a failure for the
/// resolver to restart.
pub fn poll_health(
    sup: &mut Supervisor,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
) {
    let now = Instant::now();
    let slice = sup.cfg.probe_slice;

    for idx in table.indices().collect::<Vec<_>>() {
        let Some(c) = table.get(idx) else { continue };
        if !matches!(c.state, ComponentState::Active | ComponentState::Degraded) {
            continue;
        }
        let Some(health) = c.spec.health.clone() else { continue };
        if c.last_health.map_or(false, |t| now.duration_since(t) < health.interval) {
            continue;
        }
        let name = c.name().to_string();

        let outcome = match run_probe(&health.command, health.timeout, slice) {
            Ok(o) => o,
            Err(e) => {
                warn!(component = %name, error = %e, "health probe failed to run");
                ProbeOutcome::Fail
            }
        };

        let force_restart = {
            let Some(c) = table.get_mut(idx) else { continue };
            c.last_health = Some(now);
            c.last_health_ok = Some(outcome == ProbeOutcome::Ok);

            match (outcome, c.state) {
                (ProbeOutcome::Ok, ComponentState::Active) => {
                    c.health_failures = 0;
                    false
                }
                (ProbeOutcome::Ok, ComponentState::Degraded) => {
                    c.health_failures = 0;
                    c.state = ComponentState::Active;
                    info!(component = %name, "health recovered");
                    registry.mark_provider_degraded(idx, false);
                    false
                }
                (_, ComponentState::Active) => {
                    c.health_failures += 1;
                    debug!(component = %name, failures = c.health_failures, outcome = %outcome, "health probe failed");
                    if c.health_failures >= health.fail_threshold {
                        c.state = ComponentState::Degraded;
                        warn!(component = %name, failures = c.health_failures, "degraded");
                        registry.mark_provider_degraded(idx, true);
                    }
                    false
                }
                (_, ComponentState::Degraded) => {
                    c.health_failures += 1;
                    debug!(component = %name, failures = c.health_failures, outcome = %outcome, "health probe failed");
                    c.health_failures >= health.restart_threshold
                }
                _ => false,
            }
        };

        if force_restart {
            warn!(component = %name, "restart threshold reached; forcing restart");
            registry.withdraw_provider(idx);
            sup.terminate_component(table, idx);
            if let Some(c) = table.get_mut(idx) {
                c.health_failures = 0;
                c.state = ComponentState::Failed;
                c.pid = None;
            }
        }
    }
}
