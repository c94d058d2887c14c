use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use capinit_domain::ComponentState;
use capinit_snapshot::{SnapshotMeta, SnapshotStore};
use nix::sys::statvfs::statvfs;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::daemon::Daemon;

/// Free space the staging filesystem must offer before checkpointing
/// begins.
const MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Anything smaller cannot be a kernel image.
const MIN_KERNEL_BYTES: u64 = 4096;

const MANIFEST_FILE: &str = "manifest.json";

/// The persisted descriptor enumerating what must be restored after the
/// kernel swap.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeManifest {
    pub created_at: u64,
    pub kernel: String,
    pub initrd: Option<String>,
    pub components: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub component: String,
    pub checkpoint_id: String,
    pub original_pid: i32,
}

/// Recognized kernel image container formats, by magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFormat {
    Gzip,
    BzImage,
    Elf,
}

impl std::fmt::Display for KernelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelFormat::Gzip => write!(f, "gzip"),
            KernelFormat::BzImage => write!(f, "bzImage"),
            KernelFormat::Elf => write!(f, "elf"),
        }
    }
}

/// Check a prospective kernel image: size floor plus magic bytes for the
/// known compressed and uncompressed formats.
pub fn validate_kernel_image(path: &Path) -> anyhow::Result<KernelFormat> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("kernel image {}", path.display()))?;
    if meta.len() < MIN_KERNEL_BYTES {
        bail!(
            "kernel image {} is only {} bytes",
            path.display(),
            meta.len()
        );
    }

    let mut head = vec![0u8; 0x206.min(meta.len() as usize)];
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("kernel image {}", path.display()))?;
    file.read_exact(&mut head)
        .with_context(|| format!("kernel image {}", path.display()))?;

    if let Some(format) = detect_format(&head) {
        Ok(format)
    } else {
        bail!("kernel image {} has no recognized magic", path.display())
    }
}

fn detect_format(head: &[u8]) -> Option<KernelFormat> {
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        return Some(KernelFormat::Gzip);
    }
    if head.len() >= 4 && &head[..4] == b"\x7fELF" {
        return Some(KernelFormat::Elf);
    }
    if head.len() >= 0x206 && &head[0x202..0x206] == b"HdrS" {
        return Some(KernelFormat::BzImage);
    }
    None
}

pub fn validate_initrd(path: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("initrd {}", path.display()))?;
    if meta.len() == 0 {
        bail!("initrd {} is empty", path.display());
    }
    Ok(())
}

fn free_bytes(path: &Path) -> anyhow::Result<u64> {
    let stat = statvfs(path).with_context(|| format!("statvfs {}", path.display()))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Multi-phase kernel swap: validate the images, verify the engine and
/// staging space, checkpoint every active component into the persistent
/// store, validate the produced images, persist the resume manifest,
/// stage the new kernel, execute. On success the final step does not
/// return; dry-run stops after validation.
pub fn orchestrate(
    daemon: &mut Daemon,
    kernel: &Path,
    initrd: Option<&Path>,
    dry_run: bool,
) -> anyhow::Result<String> {
    let format = validate_kernel_image(kernel)?;
    if let Some(initrd) = initrd {
        validate_initrd(initrd)?;
    }

    if !daemon.engine.supported() {
        bail!("checkpoint engine unavailable; cannot preserve components across kexec");
    }

    let staging = daemon.opts.kexec_staging();
    std::fs::create_dir_all(&staging)
        .with_context(|| format!("creating {}", staging.display()))?;
    let free = free_bytes(&staging)?;
    if free < MIN_FREE_BYTES {
        bail!(
            "staging area has {} bytes free, need {}",
            free,
            MIN_FREE_BYTES
        );
    }

    if dry_run {
        return Ok(format!(
            "kexec dry run ok: kernel format {}, {} bytes free in staging\n",
            format, free
        ));
    }

    // Image every running provider so the next kernel can resume them.
    let mut entries = Vec::new();
    for idx in daemon.table.indices().collect::<Vec<_>>() {
        let Some(c) = daemon.table.get(idx) else { continue };
        let (name, pid) = match (c.state, c.pid) {
            (ComponentState::Active | ComponentState::Degraded, Some(pid)) => {
                (c.name().to_string(), pid)
            }
            _ => continue,
        };
        let capabilities = c
            .spec
            .provides
            .iter()
            .map(|p| p.as_str().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let preserve_fds = c.spec.checkpoint.preserve_fds.clone();

        let id = SnapshotStore::new_id();
        let dir = daemon.persistent.create_dir(&name, &id)?;
        daemon
            .engine
            .checkpoint(pid, &dir, true)
            .with_context(|| format!("checkpointing {}", name))?;
        daemon.engine.validate(&dir).with_context(|| format!("validating image of {}", name))?;

        let meta = SnapshotMeta {
            component_name: name.clone(),
            original_pid: pid,
            timestamp: SnapshotStore::timestamp_of(&id).unwrap_or(0),
            image_size: daemon.persistent.entry_size(&name, &id),
            capabilities,
            criu_version: daemon.engine.version().unwrap_or_default(),
            leave_running: true,
            preserve_fds,
        };
        daemon.persistent.save_meta(&name, &id, &meta)?;

        entries.push(ManifestEntry {
            component: name,
            checkpoint_id: id,
            original_pid: pid,
        });
    }

    let manifest = ResumeManifest {
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        kernel: kernel.display().to_string(),
        initrd: initrd.map(|p| p.display().to_string()),
        components: entries,
    };
    let manifest_path = staging.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(components = manifest.components.len(), "resume manifest persisted");

    // Stage the new kernel through the loader.
    let mut load = Command::new("kexec");
    load.arg("-l").arg(kernel).arg("--reuse-cmdline");
    if let Some(initrd) = initrd {
        load.arg(format!("--initrd={}", initrd.display()));
    }
    let status = load.status().context("invoking kexec loader")?;
    if !status.success() {
        bail!("kexec load failed with {}", status);
    }

    info!(kernel = %kernel.display(), "executing new kernel");
    let status = Command::new("kexec").arg("-e").status().context("kexec -e")?;
    // Reaching this point at all means the execute failed.
    bail!("kexec execute returned with {}", status)
}

/// Post-kexec early boot: a manifest in the staging area drives the
/// restore path for every component it lists. Best-effort; failures fall
/// back to a normal cold start of that component.
pub fn resume_from_manifest(daemon: &mut Daemon) -> usize {
    let manifest_path = daemon.opts.kexec_staging().join(MANIFEST_FILE);
    let Ok(content) = std::fs::read_to_string(&manifest_path) else {
        return 0;
    };
    let manifest: ResumeManifest = match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "unreadable resume manifest; ignoring");
            let _ = std::fs::remove_file(&manifest_path);
            return 0;
        }
    };

    info!(components = manifest.components.len(), "resume manifest found");
    let mut restored = 0;
    for entry in &manifest.components {
        let Some(idx) = daemon.table.index_of(&entry.component) else {
            warn!(component = %entry.component, "manifest names unknown component");
            continue;
        };
        let dir = daemon.persistent.dir(&entry.component, &entry.checkpoint_id);
        match daemon.engine.restore(&dir) {
            Ok(pid) => {
                if let Some(c) = daemon.table.get_mut(idx) {
                    c.pid = Some(pid);
                    c.state = ComponentState::Active;
                }
                let provides: Vec<String> = daemon
                    .table
                    .get(idx)
                    .map(|c| c.spec.provides.iter().map(|p| p.as_str().to_string()).collect())
                    .unwrap_or_default();
                for cap in provides {
                    daemon.registry.register(&cap, idx);
                }
                info!(component = %entry.component, pid, "resumed from checkpoint");
                restored += 1;
            }
            Err(e) => {
                warn!(component = %entry.component, error = %e, "resume failed; will cold start");
            }
        }
    }

    let _ = std::fs::remove_file(&manifest_path);
    restored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gzip_magic() {
        let mut image = vec![0x1f, 0x8b, 0x08, 0x00];
        image.resize(8192, 0);
        assert_eq!(detect_format(&image), Some(KernelFormat::Gzip));
    }

    #[test]
    fn detects_elf_magic() {
        let mut image = b"\x7fELF".to_vec();
        image.resize(8192, 0);
        assert_eq!(detect_format(&image), Some(KernelFormat::Elf));
    }

    #[test]
    fn detects_bzimage_header() {
        let mut image = vec![0u8; 8192];
        image[0x202..0x206].copy_from_slice(b"HdrS");
        assert_eq!(detect_format(&image), Some(KernelFormat::BzImage));
    }

    #[test]
    fn garbage_has_no_format() {
        assert_eq!(detect_format(&[0u8; 8192]), None);
        assert_eq!(detect_format(&[]), None);
    }

    #[test]
    fn kernel_validation_rejects_small_and_unmagical_files() {
        let dir = tempfile::tempdir().unwrap();

        let tiny = dir.path().join("tiny");
        std::fs::write(&tiny, b"hi").unwrap();
        assert!(validate_kernel_image(&tiny).is_err());

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, vec![0u8; 8192]).unwrap();
        assert!(validate_kernel_image(&garbage).is_err());

        let mut gz = vec![0x1f, 0x8b];
        gz.resize(8192, 0);
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, gz).unwrap();
        assert_eq!(validate_kernel_image(&kernel).unwrap(), KernelFormat::Gzip);
    }

    #[test]
    fn initrd_must_be_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("initrd");
        std::fs::write(&empty, b"").unwrap();
        assert!(validate_initrd(&empty).is_err());
        std::fs::write(&empty, b"data").unwrap();
        assert!(validate_initrd(&empty).is_ok());
    }

    #[test]
    fn manifest_round_trips() {
        let manifest = ResumeManifest {
            created_at: 1_700_000_000,
            kernel: "/boot/vmlinuz".into(),
            initrd: None,
            components: vec![ManifestEntry {
                component: "netd".into(),
                checkpoint_id: "0001700000".into(),
                original_pid: 42,
            }],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: ResumeManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.components[0].component, "netd");
        assert_eq!(back.kernel, "/boot/vmlinuz");
    }
}
