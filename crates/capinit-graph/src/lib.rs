mod analysis;
mod error;
mod registry;
mod resolve;
mod table;

pub use analysis::{
    ValidationMode, dependency_order, find_cycle, reverse_dependencies, validate_graph,
};
pub use error::GraphError;
pub use registry::{Capability, CapabilityRegistry};
pub use resolve::{RETRY_BACKOFF, Starter, resolve_full, resolve_once};
pub use table::{
    Component, ComponentTable, KERNEL_INDEX, PLATFORM_CAPABILITIES, requirements_met,
};
