mod error;
mod signal;
mod types;

pub use error::DomainError;
pub use signal::parse_signal;
pub use types::{
    CapabilityName, CheckpointSpec, ComponentKind, ComponentName, ComponentSpec, ComponentState,
    HandoffKind, HealthSpec, IsolationSpec, Namespace, ReadinessMethod, ReadinessSpec,
    ResourceLimits, clamp_weight, parse_size,
};
