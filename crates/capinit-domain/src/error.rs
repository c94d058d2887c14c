use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid component name: {0}")]
    InvalidComponentName(String),

    #[error("invalid capability name: {0}")]
    InvalidCapabilityName(String),

    #[error("unknown component type '{0}' (expected 'service' or 'oneshot')")]
    UnknownComponentKind(String),

    #[error("unknown handoff strategy '{0}'")]
    UnknownHandoff(String),

    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),

    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    #[error("invalid size '{0}' (expected a decimal with optional K/M/G suffix)")]
    InvalidSize(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
