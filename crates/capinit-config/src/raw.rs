use serde::Deserialize;

/// Raw representation of one declaration file. Sections map 1:1 to the
/// bracketed headers of the on-disk format; everything is strings and
/// integers here, converted to domain types by the loader.
#[derive(Debug, Deserialize)]
pub struct RawDeclaration {
    pub component: RawComponent,
    pub provides: Option<RawCapabilitySet>,
    pub requires: Option<RawCapabilitySet>,
    pub optional: Option<RawCapabilitySet>,
    pub lifecycle: Option<RawLifecycle>,
    pub resources: Option<RawResources>,
    pub isolation: Option<RawIsolation>,
    pub checkpoint: Option<RawCheckpoint>,
}

#[derive(Debug, Deserialize)]
pub struct RawComponent {
    pub name: String,
    pub binary: String,
    /// "service" (default) or "oneshot".
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawCapabilitySet {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawLifecycle {
    pub reload_signal: Option<String>,
    /// "fd-passing", "checkpoint", or "state-file" (accepted, unimplemented).
    pub handoff: Option<String>,
    pub readiness_file: Option<String>,
    pub readiness_check: Option<String>,
    pub readiness_signal: Option<String>,
    /// Seconds; default 30.
    pub readiness_timeout: Option<u64>,
    /// Seconds between COMMAND readiness probes; default 1.
    pub readiness_interval: Option<u64>,
    pub health_check: Option<String>,
    /// Seconds; default 30.
    pub health_interval: Option<u64>,
    /// Seconds; default 10.
    pub health_timeout: Option<u64>,
    /// Consecutive failures before degraded; default 3.
    pub health_fail_threshold: Option<u32>,
    /// Consecutive failures before forced restart; default 5.
    pub health_restart_threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawResources {
    pub cgroup: Option<String>,
    /// Sizes accept a decimal with a K/M/G suffix.
    pub memory_max: Option<String>,
    pub memory_high: Option<String>,
    pub cpu_weight: Option<u32>,
    /// cgroup2 `cpu.max` syntax, written verbatim.
    pub cpu_max: Option<String>,
    pub io_weight: Option<u32>,
    pub pids_max: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawIsolation {
    /// Comma-separated list: mount, pid, net, uts, ipc, user.
    pub namespaces: Option<String>,
    pub root: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawCheckpoint {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub preserve_fds: Vec<i32>,
    pub leave_running: Option<bool>,
    pub memory_estimate: Option<String>,
    /// Hours; overrides the store default for this component.
    pub max_age: Option<u64>,
}
