use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

/// State machine of one in-flight upgrade. Timeouts abort the upgrade and
/// leave the component unchanged; `Failed` is reachable from every
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffPhase {
    Preparing,
    Ready,
    Transferring,
    Completing,
    Failed,
}

impl std::fmt::Display for HandoffPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandoffPhase::Preparing => "preparing",
            HandoffPhase::Ready => "ready",
            HandoffPhase::Transferring => "transferring",
            HandoffPhase::Completing => "completing",
            HandoffPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Ephemeral record of one upgrade attempt, alive from request to
/// completion or abort.
#[derive(Debug)]
pub struct HandoffContext {
    pub id: Uuid,
    /// Component-table index of the component being swapped.
    pub component: usize,
    pub new_pid: Option<i32>,
    pub started: Instant,
    pub timeout: Duration,
    pub phase: HandoffPhase,
}

impl HandoffContext {
    pub fn new(component: usize, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            component,
            new_pid: None,
            started: Instant::now(),
            timeout,
            phase: HandoffPhase::Preparing,
        }
    }

    /// Move to the next phase, logging the transition.
    pub fn advance(&mut self, phase: HandoffPhase) {
        debug!(
            handoff = %self.id,
            component = self.component,
            from = %self.phase,
            to = %phase,
            "handoff phase"
        );
        self.phase = phase;
    }

    /// Sink into `Failed`, returning the phase the upgrade died in.
    pub fn fail(&mut self) -> HandoffPhase {
        let at = self.phase;
        self.phase = HandoffPhase::Failed;
        at
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_through_phases_and_fail_records_where() {
        let mut ctx = HandoffContext::new(3, Duration::from_secs(10));
        assert_eq!(ctx.phase, HandoffPhase::Preparing);

        ctx.advance(HandoffPhase::Ready);
        ctx.advance(HandoffPhase::Transferring);
        let died_in = ctx.fail();
        assert_eq!(died_in, HandoffPhase::Transferring);
        assert_eq!(ctx.phase, HandoffPhase::Failed);
    }

    #[test]
    fn expiry_tracks_the_deadline() {
        let fresh = HandoffContext::new(0, Duration::from_secs(60));
        assert!(!fresh.expired());
        assert!(fresh.deadline() > Instant::now());

        let spent = HandoffContext::new(0, Duration::ZERO);
        assert!(spent.expired());
    }
}
