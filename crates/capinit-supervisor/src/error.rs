use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("restart backoff: {component} restarted {count} times within the window")]
    Backoff { component: String, count: u32 },

    #[error("unknown component index {0}")]
    UnknownComponent(usize),

    #[error("component {component} is not running")]
    NotRunning { component: String },

    #[error("spawn failed for {component}: {source}")]
    Spawn {
        component: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe failed to run: {0}")]
    Probe(#[source] std::io::Error),
}
