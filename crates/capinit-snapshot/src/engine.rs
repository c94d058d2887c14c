use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::meta::EngineVersion;

/// The checkpoint/restore engine, kept behind a trait so the upgrade
/// fallback logic can be exercised with a deterministic fake and without
/// kernel support.
///
/// The production engine is an external binary invoked as an opaque
/// child; this daemon never reimplements it.
pub trait CheckpointEngine {
    /// The engine binary exists and reports kernel support.
    fn supported(&self) -> bool;

    fn version(&self) -> Option<EngineVersion>;

    /// Image `pid` into `dir`, optionally leaving the process running.
    fn checkpoint(&self, pid: i32, dir: &Path, leave_running: bool) -> Result<(), SnapshotError>;

    /// Restore the image in `dir`, returning the new pid.
    fn restore(&self, dir: &Path) -> Result<i32, SnapshotError>;

    /// Cheap structural validation of an on-disk image.
    fn validate(&self, dir: &Path) -> Result<(), SnapshotError>;
}

// ── CRIU ──────────────────────────────────────────────────────────────────────

/// Engine backed by the `criu` binary.
pub struct CriuEngine {
    binary: PathBuf,
}

impl CriuEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn run(&self, args: &[&str]) -> Result<(i32, String), SnapshotError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SnapshotError::EngineUnavailable(e.to_string()))?;
        let code = output.status.code().unwrap_or(-1);
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((code, text))
    }
}

impl Default for CriuEngine {
    fn default() -> Self {
        Self::new("criu")
    }
}

impl CheckpointEngine for CriuEngine {
    fn supported(&self) -> bool {
        match self.run(&["check"]) {
            Ok((0, _)) => true,
            Ok((code, out)) => {
                debug!(code, output = %out.trim(), "criu check reported missing support");
                false
            }
            Err(e) => {
                debug!(error = %e, "criu binary not available");
                false
            }
        }
    }

    fn version(&self) -> Option<EngineVersion> {
        let (code, out) = self.run(&["--version"]).ok()?;
        if code != 0 {
            return None;
        }
        parse_version(&out)
    }

    fn checkpoint(&self, pid: i32, dir: &Path, leave_running: bool) -> Result<(), SnapshotError> {
        let pid_arg = pid.to_string();
        let dir_arg = dir.display().to_string();
        let mut args = vec![
            "dump",
            "-t",
            pid_arg.as_str(),
            "-D",
            dir_arg.as_str(),
            "--shell-job",
            "--tcp-established",
        ];
        if leave_running {
            args.push("--leave-running");
        }

        let (code, out) = self.run(&args)?;
        if code != 0 {
            return Err(SnapshotError::EngineFailed(format!(
                "dump of pid {} exited {}: {}",
                pid,
                code,
                tail(&out)
            )));
        }
        debug!(pid, dir = %dir.display(), "checkpoint written");
        Ok(())
    }

    fn restore(&self, dir: &Path) -> Result<i32, SnapshotError> {
        let dir_arg = dir.display().to_string();
        let pidfile = dir.join("restore.pid");
        let pidfile_arg = pidfile.display().to_string();

        let (code, out) = self.run(&[
            "restore",
            "-D",
            dir_arg.as_str(),
            "--shell-job",
            "--tcp-established",
            "--restore-detached",
            "--pidfile",
            pidfile_arg.as_str(),
        ])?;
        if code != 0 {
            return Err(SnapshotError::EngineFailed(format!(
                "restore from {} exited {}: {}",
                dir.display(),
                code,
                tail(&out)
            )));
        }

        let pid_text =
            std::fs::read_to_string(&pidfile).map_err(|e| SnapshotError::io(&pidfile, e))?;
        pid_text
            .trim()
            .parse()
            .map_err(|_| SnapshotError::EngineFailed(format!("bad pidfile content '{}'", pid_text.trim())))
    }

    fn validate(&self, dir: &Path) -> Result<(), SnapshotError> {
        let has_images = std::fs::read_dir(dir)
            .map_err(|e| SnapshotError::io(dir, e))?
            .flatten()
            .any(|e| e.path().extension().map_or(false, |ext| ext == "img"));
        if !has_images {
            return Err(SnapshotError::InvalidImage(format!(
                "{} contains no image files",
                dir.display()
            )));
        }
        Ok(())
    }
}

/// Pull "Version: X.Y[.Z]" out of `criu --version` output.
fn parse_version(out: &str) -> Option<EngineVersion> {
    let line = out.lines().find(|l| l.starts_with("Version:"))?;
    let mut parts = line.trim_start_matches("Version:").trim().split('.');
    Some(EngineVersion {
        major: parts.next()?.trim().parse().ok()?,
        minor: parts.next()?.trim().parse().ok()?,
        patch: parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0),
    })
}

fn tail(out: &str) -> String {
    let lines: Vec<&str> = out.lines().rev().take(3).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

// ── Test double ───────────────────────────────────────────────────────────────

/// Deterministic in-memory engine for exercising the upgrade paths.
///
/// `checkpoint` drops a synthetic image file into the directory so
/// store-level size accounting and validation behave like the real thing.
pub struct StubEngine {
    pub supported: bool,
    pub fail_checkpoint: bool,
    pub fail_restore: bool,
    /// Pid handed out by the next successful restore.
    pub restore_pid: i32,
    pub checkpoints: RefCell<Vec<(i32, PathBuf, bool)>>,
    pub restores: RefCell<Vec<PathBuf>>,
}

impl StubEngine {
    pub fn working(restore_pid: i32) -> Self {
        Self {
            supported: true,
            fail_checkpoint: false,
            fail_restore: false,
            restore_pid,
            checkpoints: RefCell::new(Vec::new()),
            restores: RefCell::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::working(0)
        }
    }
}

impl CheckpointEngine for StubEngine {
    fn supported(&self) -> bool {
        self.supported
    }

    fn version(&self) -> Option<EngineVersion> {
        self.supported.then_some(EngineVersion { major: 3, minor: 19, patch: 0 })
    }

    fn checkpoint(&self, pid: i32, dir: &Path, leave_running: bool) -> Result<(), SnapshotError> {
        if self.fail_checkpoint {
            return Err(SnapshotError::EngineFailed("stub checkpoint failure".into()));
        }
        std::fs::write(dir.join("pages-1.img"), b"stub image")
            .map_err(|e| SnapshotError::io(dir, e))?;
        self.checkpoints.borrow_mut().push((pid, dir.to_path_buf(), leave_running));
        Ok(())
    }

    fn restore(&self, dir: &Path) -> Result<i32, SnapshotError> {
        if self.fail_restore {
            return Err(SnapshotError::EngineFailed("stub restore failure".into()));
        }
        self.restores.borrow_mut().push(dir.to_path_buf());
        Ok(self.restore_pid)
    }

    fn validate(&self, dir: &Path) -> Result<(), SnapshotError> {
        if dir.join("pages-1.img").exists() {
            Ok(())
        } else {
            Err(SnapshotError::InvalidImage(dir.display().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        let v = parse_version("Version: 3.19\nGitID: v3.19\n").unwrap();
        assert_eq!(v, EngineVersion { major: 3, minor: 19, patch: 0 });

        let v = parse_version("Version: 4.0.1\n").unwrap();
        assert_eq!(v, EngineVersion { major: 4, minor: 0, patch: 1 });

        assert!(parse_version("no version here").is_none());
    }

    #[test]
    fn missing_binary_is_unsupported_not_fatal() {
        let engine = CriuEngine::new("/nonexistent/criu");
        assert!(!engine.supported());
        assert!(engine.version().is_none());
    }

    #[test]
    fn stub_records_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StubEngine::working(4242);
        engine.checkpoint(100, dir.path(), true).unwrap();
        assert!(engine.validate(dir.path()).is_ok());
        assert_eq!(engine.restore(dir.path()).unwrap(), 4242);
        assert_eq!(engine.checkpoints.borrow().len(), 1);
        assert_eq!(engine.restores.borrow().len(), 1);
    }
}
