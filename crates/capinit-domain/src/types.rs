use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName(pub String);

impl ComponentName {
    pub fn new(s: impl Into<String>) -> Self {
        ComponentName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityName(pub String);

impl CapabilityName {
    pub fn new(s: impl Into<String>) -> Self {
        CapabilityName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Long-running process; any exit is a failure.
    Service,
    /// Runs once; exit 0 permanently establishes its provided capabilities.
    Oneshot,
}

impl ComponentKind {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "service" => Ok(ComponentKind::Service),
            "oneshot" => Ok(ComponentKind::Oneshot),
            other => Err(DomainError::UnknownComponentKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Service => write!(f, "service"),
            ComponentKind::Oneshot => write!(f, "oneshot"),
        }
    }
}

/// Lifecycle state of a component.
///
/// Transitions:
///   Inactive → Starting → ReadyWait → Active ↔ Degraded
///   Starting → Active (no readiness method)
///   Starting → OneshotDone (oneshot, exit 0)
///   ReadyWait | Active | Degraded → Failed (exit, timeout, dependency loss)
///   Failed → Inactive (requirements hold again, backoff elapsed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Inactive,
    Starting,
    ReadyWait,
    Active,
    Degraded,
    OneshotDone,
    Failed,
}

impl ComponentState {
    /// True while `pid` refers to a live process.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ComponentState::Starting
                | ComponentState::ReadyWait
                | ComponentState::Active
                | ComponentState::Degraded
        )
    }

    /// True while this component's provided capabilities are active.
    pub fn provides_active(&self) -> bool {
        matches!(self, ComponentState::Active | ComponentState::OneshotDone)
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::Inactive => "inactive",
            ComponentState::Starting => "starting",
            ComponentState::ReadyWait => "ready-wait",
            ComponentState::Active => "active",
            ComponentState::Degraded => "degraded",
            ComponentState::OneshotDone => "oneshot-done",
            ComponentState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Preferred zero-downtime upgrade strategy. Each level falls back to the
/// next on failure, ending at plain restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffKind {
    #[default]
    None,
    FdPassing,
    Checkpoint,
}

impl std::fmt::Display for HandoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffKind::None => write!(f, "none"),
            HandoffKind::FdPassing => write!(f, "fd-passing"),
            HandoffKind::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

// ── Readiness ─────────────────────────────────────────────────────────────────

/// How the daemon decides a started service is actually serving requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadinessMethod {
    /// Process exists ⇒ ready. `Starting → Active` is immediate.
    #[default]
    None,
    /// Ready once the path exists (any file type).
    File(PathBuf),
    /// Ready once a shell-invoked probe returns exit 0.
    Command(String),
    /// Ready only when the named signal reaches the event loop and is routed
    /// to this component; the poller never drives it.
    Signal(Signal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSpec {
    pub method: ReadinessMethod,
    /// Deadline from fork to readiness; exceeded ⇒ failed and terminated.
    pub timeout: Duration,
    /// Minimum spacing between COMMAND probe attempts.
    pub interval: Duration,
}

impl Default for ReadinessSpec {
    fn default() -> Self {
        Self {
            method: ReadinessMethod::None,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(1),
        }
    }
}

// ── Health checks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSpec {
    /// Shell command; exit 0 = healthy.
    pub command: String,
    /// Spacing between probes. A probe newer than this is not repeated.
    pub interval: Duration,
    /// Per-probe deadline; SIGKILL on expiry, counted as a failure.
    pub timeout: Duration,
    /// Consecutive failures before `Active → Degraded`.
    pub fail_threshold: u32,
    /// Consecutive failures before a forced restart (`Degraded → Failed`).
    pub restart_threshold: u32,
}

impl HealthSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            fail_threshold: 3,
            restart_threshold: 5,
        }
    }
}

// ── Resources and isolation ───────────────────────────────────────────────────

/// Per-component cgroup limits. `None` fields are left at the kernel default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    /// Override for the cgroup directory name (defaults to the component name).
    pub cgroup: Option<String>,
    pub memory_max: Option<u64>,
    pub memory_high: Option<u64>,
    /// Relative cpu share, clamped to [1, 10000].
    pub cpu_weight: Option<u32>,
    /// Ceiling in cgroup2 `cpu.max` syntax ("quota period" or "max").
    pub cpu_max: Option<String>,
    /// Relative io share, clamped to [1, 10000].
    pub io_weight: Option<u32>,
    pub pids_max: Option<u32>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_max.is_none()
            && self.memory_high.is_none()
            && self.cpu_weight.is_none()
            && self.cpu_max.is_none()
            && self.io_weight.is_none()
            && self.pids_max.is_none()
    }
}

/// Parse a byte size: a decimal followed by an optional single-character
/// K/M/G suffix (case-insensitive, powers of 1024).
pub fn parse_size(s: &str) -> Result<u64, DomainError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DomainError::InvalidSize(s.to_string()));
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1024u64),
        b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        b'0'..=b'9' => (s, 1),
        _ => return Err(DomainError::InvalidSize(s.to_string())),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| DomainError::InvalidSize(s.to_string()))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| DomainError::InvalidSize(s.to_string()))
}

/// Clamp a cpu/io weight into the cgroup2 legal range [1, 10000].
pub fn clamp_weight(w: u32) -> u32 {
    w.clamp(1, 10000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Mount,
    Pid,
    Net,
    Uts,
    Ipc,
    User,
}

impl Namespace {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s.trim() {
            "mount" | "mnt" => Ok(Namespace::Mount),
            "pid" => Ok(Namespace::Pid),
            "net" => Ok(Namespace::Net),
            "uts" => Ok(Namespace::Uts),
            "ipc" => Ok(Namespace::Ipc),
            "user" => Ok(Namespace::User),
            other => Err(DomainError::UnknownNamespace(other.to_string())),
        }
    }

    /// Parse a comma-separated namespace list.
    pub fn parse_list(s: &str) -> Result<Vec<Namespace>, DomainError> {
        s.split(',')
            .filter(|t| !t.trim().is_empty())
            .map(Namespace::parse)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IsolationSpec {
    pub namespaces: Vec<Namespace>,
    /// Chroot directory for the child.
    pub root: Option<PathBuf>,
    /// Applied only when the uts namespace is requested.
    pub hostname: Option<String>,
}

// ── Checkpointing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSpec {
    pub enabled: bool,
    /// Descriptors the engine must carry across checkpoint/restore.
    pub preserve_fds: Vec<i32>,
    /// Leave the old process running while the image is taken.
    pub leave_running: bool,
    /// Operator hint for image sizing; not enforced.
    pub memory_estimate: Option<u64>,
    /// Per-component override of the store's age bound, in hours.
    pub max_age_hours: Option<u64>,
}

impl Default for CheckpointSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            preserve_fds: Vec::new(),
            leave_running: true,
            memory_estimate: None,
            max_age_hours: None,
        }
    }
}

// ── Component declaration ─────────────────────────────────────────────────────

/// Everything a declaration file says about one component. Static for the
/// lifetime of a load; runtime state lives in the component table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub name: ComponentName,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub kind: ComponentKind,
    pub provides: Vec<CapabilityName>,
    pub requires: Vec<CapabilityName>,
    /// Parsed and displayed but ignored by the resolver.
    pub optional: Vec<CapabilityName>,
    pub reload_signal: Option<Signal>,
    pub handoff: HandoffKind,
    pub readiness: ReadinessSpec,
    pub health: Option<HealthSpec>,
    pub resources: ResourceLimits,
    pub isolation: IsolationSpec,
    pub checkpoint: CheckpointSpec,
}

impl ComponentSpec {
    /// A minimal service spec; the loader and tests fill in the rest.
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            name: ComponentName::new(name),
            binary: binary.into(),
            args: Vec::new(),
            kind: ComponentKind::Service,
            provides: Vec::new(),
            requires: Vec::new(),
            optional: Vec::new(),
            reload_signal: None,
            handoff: HandoffKind::None,
            readiness: ReadinessSpec::default(),
            health: None,
            resources: ResourceLimits::default(),
            isolation: IsolationSpec::default(),
            checkpoint: CheckpointSpec::default(),
        }
    }
}
