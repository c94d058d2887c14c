mod cgroup;
mod error;
mod health;
mod isolation;
mod probe;
mod readiness;
mod spawn;

pub use cgroup::CgroupDriver;
pub use error::SupervisorError;
pub use health::poll_health;
pub use isolation::EXIT_ISOLATION;
pub use probe::{ProbeOutcome, run_probe};
pub use readiness::{poll_readiness, signal_ready};
pub use spawn::{Supervisor, SupervisorConfig, wait_for_exit};
