use thiserror::Error;

use crate::context::HandoffPhase;
use crate::engine::Strategy;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("component '{0}' is not running")]
    NotRunning(String),

    #[error("unknown component index {0}")]
    UnknownComponent(usize),

    #[error("checkpoint engine reports no support")]
    EngineUnsupported,

    #[error("checkpoint error: {0}")]
    Snapshot(#[from] capinit_snapshot::SnapshotError),

    #[error("handoff marker not received within {waited_secs}s ({phase} phase)")]
    MarkerTimeout { phase: HandoffPhase, waited_secs: u64 },

    #[error("upgrade deadline expired in {0} phase")]
    Expired(HandoffPhase),

    #[error("handoff socket closed before completion marker")]
    SocketClosed,

    #[error("handoff socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("spawning replacement process failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("restart failed: {0}")]
    Restart(String),

    #[error("upgrade of '{component}' failed: {}", render_attempts(.attempts))]
    UpgradeFailed {
        component: String,
        attempts: Vec<(Strategy, String)>,
    },
}

fn render_attempts(attempts: &[(Strategy, String)]) -> String {
    attempts
        .iter()
        .map(|(s, e)| format!("{}: {}", s, e))
        .collect::<Vec<_>>()
        .join("; ")
}
