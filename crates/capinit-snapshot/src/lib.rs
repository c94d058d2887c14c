mod engine;
mod error;
mod meta;
mod store;

pub use engine::{CheckpointEngine, CriuEngine, StubEngine};
pub use error::SnapshotError;
pub use meta::{EngineVersion, SnapshotMeta};
pub use store::{
    DEFAULT_KEEP_COUNT, DEFAULT_MAX_AGE_HOURS, SnapshotEntry, SnapshotStore,
};
