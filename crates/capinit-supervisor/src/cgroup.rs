use std::collections::HashMap;
use std::path::{Path, PathBuf};

use capinit_domain::{ResourceLimits, clamp_weight};
use nix::mount::{MsFlags, mount};
use tracing::{debug, warn};

use crate::error::SupervisorError;

const CONTROLLERS: &str = "+cpu +memory +io +pids";

/// cgroup v2 driver. Creates one sub-cgroup per component under the
/// daemon's own group and writes declared limits into it.
///
/// Every write after setup is best-effort: limit and removal failures are
/// warnings, never fatal.
#[derive(Debug)]
pub struct CgroupDriver {
    root: PathBuf,
    daemon_group: String,
    enabled: bool,
    /// Last observed `oom_kill` counter per component group.
    oom_seen: HashMap<String, u64>,
}

impl CgroupDriver {
    pub fn new(root: impl Into<PathBuf>, daemon_group: impl Into<String>, enabled: bool) -> Self {
        Self {
            root: root.into(),
            daemon_group: daemon_group.into(),
            enabled,
            oom_seen: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn daemon_dir(&self) -> PathBuf {
        self.root.join(&self.daemon_group)
    }

    fn component_dir(&self, group: &str) -> PathBuf {
        self.daemon_dir().join(group)
    }

    /// Mount the v2 hierarchy if absent, create the daemon's root group,
    /// and enable the four controllers at the root and the daemon subtree.
    ///
    /// Failure disables the driver with a warning rather than aborting
    /// boot; components then run without resource confinement.
    pub fn setup(&mut self) {
        if !self.enabled {
            return;
        }

        if !self.root.join("cgroup.controllers").exists() {
            if let Err(e) = std::fs::create_dir_all(&self.root).map_err(|e| e.to_string()).and_then(
                |_| {
                    mount(
                        Some("cgroup2"),
                        &self.root,
                        Some("cgroup2"),
                        MsFlags::empty(),
                        None::<&str>,
                    )
                    .map_err(|e| e.to_string())
                },
            ) {
                warn!(root = %self.root.display(), error = %e, "cgroup2 mount failed; disabling resource limits");
                self.enabled = false;
                return;
            }
        }

        if let Err(e) = std::fs::create_dir_all(self.daemon_dir()) {
            warn!(error = %e, "cannot create daemon cgroup; disabling resource limits");
            self.enabled = false;
            return;
        }

        for dir in [self.root.clone(), self.daemon_dir()] {
            let control = dir.join("cgroup.subtree_control");
            if let Err(e) = std::fs::write(&control, CONTROLLERS) {
                warn!(path = %control.display(), error = %e, "enabling cgroup controllers failed");
            }
        }
    }

    pub fn create(&self, group: &str) -> Result<(), SupervisorError> {
        if !self.enabled {
            return Ok(());
        }
        let dir = self.component_dir(group);
        std::fs::create_dir_all(&dir).map_err(|e| SupervisorError::Io {
            path: dir.display().to_string(),
            source: e,
        })
    }

    /// Place `pid` into the group's procs file.
    pub fn attach(&self, group: &str, pid: i32) {
        if !self.enabled {
            return;
        }
        let procs = self.component_dir(group).join("cgroup.procs");
        if let Err(e) = std::fs::write(&procs, pid.to_string()) {
            warn!(group, pid, error = %e, "cgroup attach failed");
        }
    }

    /// Write the declared limits. Individual write failures are warnings.
    pub fn apply_limits(&self, group: &str, limits: &ResourceLimits) {
        if !self.enabled || limits.is_empty() {
            return;
        }
        let dir = self.component_dir(group);

        let mut write = |file: &str, value: String| {
            let path = dir.join(file);
            if let Err(e) = std::fs::write(&path, &value) {
                warn!(path = %path.display(), value, error = %e, "cgroup limit write failed");
            } else {
                debug!(group, file, value, "cgroup limit applied");
            }
        };

        if let Some(v) = limits.memory_max {
            write("memory.max", v.to_string());
        }
        if let Some(v) = limits.memory_high {
            write("memory.high", v.to_string());
        }
        if let Some(v) = limits.cpu_weight {
            write("cpu.weight", clamp_weight(v).to_string());
        }
        if let Some(v) = &limits.cpu_max {
            write("cpu.max", v.clone());
        }
        if let Some(v) = limits.io_weight {
            write("io.weight", clamp_weight(v).to_string());
        }
        if let Some(v) = limits.pids_max {
            write("pids.max", v.to_string());
        }
    }

    /// Remove the group after exit. Best-effort; a non-empty group logs a
    /// warning and stays behind.
    pub fn remove(&mut self, group: &str) {
        if !self.enabled {
            return;
        }
        self.oom_seen.remove(group);
        let dir = self.component_dir(group);
        if !dir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir(&dir) {
            warn!(group, error = %e, "cgroup removal failed (still has members?)");
        }
    }

    /// Scan every component group's `memory.events` for new `oom_kill`
    /// counts. Returns the group names with new kills since the last scan.
    pub fn scan_oom(&mut self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        let mut hit = Vec::new();
        let entries = match std::fs::read_dir(self.daemon_dir()) {
            Ok(entries) => entries,
            Err(_) => return hit,
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let group = entry.file_name().to_string_lossy().to_string();
            let Some(kills) = read_oom_kills(&entry.path()) else {
                continue;
            };
            let seen = self.oom_seen.insert(group.clone(), kills).unwrap_or(0);
            if kills > seen {
                warn!(group = %group, kills, "cgroup reported oom kill");
                hit.push(group);
            }
        }
        hit
    }
}

fn read_oom_kills(dir: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(dir.join("memory.events")).ok()?;
    parse_oom_kills(&content)
}

fn parse_oom_kills(events: &str) -> Option<u64> {
    events.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("oom_kill"), Some(n)) => n.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oom_kill_counter() {
        let events = "low 0\nhigh 4\nmax 12\noom 3\noom_kill 2\noom_group_kill 0\n";
        assert_eq!(parse_oom_kills(events), Some(2));
        assert_eq!(parse_oom_kills("low 0\n"), None);
        assert_eq!(parse_oom_kills(""), None);
    }

    #[test]
    fn disabled_driver_is_inert() {
        let mut driver = CgroupDriver::new("/nonexistent/cgroup", "capinit", false);
        driver.setup();
        assert!(!driver.enabled());
        assert!(driver.create("svc").is_ok());
        driver.attach("svc", 1234);
        driver.remove("svc");
        assert!(driver.scan_oom().is_empty());
    }
}
