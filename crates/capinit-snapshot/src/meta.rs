use serde::{Deserialize, Serialize};

/// Checkpoint engine version triple, recorded in every sidecar so a
/// restore can refuse images from an incompatible engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The `metadata.json` sidecar inside each checkpoint directory.
///
/// Writing emits exactly these fields; reading tolerates extras from
/// newer writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub component_name: String,
    pub original_pid: i32,
    /// Seconds since epoch at creation.
    pub timestamp: u64,
    pub image_size: u64,
    /// Comma-separated capability names preserved across the swap.
    pub capabilities: String,
    pub criu_version: EngineVersion,
    pub leave_running: bool,
    pub preserve_fds: Vec<i32>,
}

impl SnapshotMeta {
    pub fn capability_list(&self) -> Vec<&str> {
        self.capabilities
            .split(',')
            .filter(|s| !s.is_empty())
            .collect()
    }
}
