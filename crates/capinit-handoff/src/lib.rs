mod context;
mod engine;
mod error;

pub use context::{HandoffContext, HandoffPhase};
pub use engine::{
    HANDOFF_FD, HANDOFF_FD_ENV, HANDOFF_MARKER, HANDOFF_SIGNAL, HandoffEngine, Strategy,
    UpgradeReport,
};
pub use error::HandoffError;
