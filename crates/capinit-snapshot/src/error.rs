use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata error in {path}: {source}")]
    Meta {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no checkpoint found for component '{0}'")]
    NotFound(String),

    #[error("checkpoint engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("checkpoint operation failed: {0}")]
    EngineFailed(String),

    #[error("checkpoint image invalid: {0}")]
    InvalidImage(String),
}

impl SnapshotError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
