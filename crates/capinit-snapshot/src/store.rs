use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::meta::SnapshotMeta;

pub const DEFAULT_KEEP_COUNT: usize = 10;
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

const META_FILE: &str = "metadata.json";

/// One checkpoint directory: `<root>/<component>/<id>/`.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub component: String,
    /// Zero-padded creation time in seconds since epoch, so lexical order
    /// is chronological.
    pub id: String,
    pub path: PathBuf,
}

/// Filesystem layout and retention policy for checkpoint images.
///
/// Two stores exist at runtime: a transient one (cleared on reboot) for
/// mid-upgrade images and a persistent one for backups and migrations.
/// The engine's image files are opaque to the store; it only manages the
/// directories and the `metadata.json` sidecars.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current time encoded as a checkpoint id.
    pub fn new_id() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::id_for_timestamp(secs)
    }

    pub fn id_for_timestamp(secs: u64) -> String {
        format!("{:010}", secs)
    }

    /// Decode a checkpoint id back into epoch seconds.
    pub fn timestamp_of(id: &str) -> Option<u64> {
        id.parse().ok()
    }

    pub fn dir(&self, component: &str, id: &str) -> PathBuf {
        self.root.join(component).join(id)
    }

    pub fn create_dir(&self, component: &str, id: &str) -> Result<PathBuf, SnapshotError> {
        let dir = self.dir(component, id);
        std::fs::create_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;
        Ok(dir)
    }

    pub fn save_meta(
        &self,
        component: &str,
        id: &str,
        meta: &SnapshotMeta,
    ) -> Result<(), SnapshotError> {
        let path = self.dir(component, id).join(META_FILE);
        let json = serde_json::to_string_pretty(meta).map_err(|e| SnapshotError::Meta {
            path: path.display().to_string(),
            source: e,
        })?;
        std::fs::write(&path, json).map_err(|e| SnapshotError::io(&path, e))
    }

    pub fn load_meta(&self, component: &str, id: &str) -> Result<SnapshotMeta, SnapshotError> {
        let path = self.dir(component, id).join(META_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| SnapshotError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| SnapshotError::Meta {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// List entries, newest first. With `component = None`, every
    /// component's entries are returned.
    pub fn list(&self, component: Option<&str>) -> Result<Vec<SnapshotEntry>, SnapshotError> {
        let mut entries = Vec::new();

        let components: Vec<String> = match component {
            Some(c) => vec![c.to_string()],
            None => match std::fs::read_dir(&self.root) {
                Ok(dir) => dir
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect(),
                Err(_) => return Ok(entries),
            },
        };

        for comp in components {
            let comp_dir = self.root.join(&comp);
            let Ok(dir) = std::fs::read_dir(&comp_dir) else { continue };
            for entry in dir.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                entries.push(SnapshotEntry {
                    component: comp.clone(),
                    id: entry.file_name().to_string_lossy().to_string(),
                    path: entry.path(),
                });
            }
        }

        // Ids are zero-padded timestamps: lexical descending = newest first.
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(entries)
    }

    pub fn find_latest(&self, component: &str) -> Result<SnapshotEntry, SnapshotError> {
        self.list(Some(component))?
            .into_iter()
            .next()
            .ok_or_else(|| SnapshotError::NotFound(component.to_string()))
    }

    pub fn remove(&self, component: &str, id: &str) -> Result<(), SnapshotError> {
        let dir = self.dir(component, id);
        std::fs::remove_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;
        debug!(component, id, "removed checkpoint");
        // Drop the per-component directory once it empties out.
        let comp_dir = self.root.join(component);
        if std::fs::read_dir(&comp_dir).map_or(false, |mut d| d.next().is_none()) {
            let _ = std::fs::remove_dir(&comp_dir);
        }
        Ok(())
    }

    /// Move one checkpoint into another store, atomically when both roots
    /// share a filesystem, falling back to copy-then-remove across
    /// filesystem boundaries.
    pub fn migrate(
        &self,
        component: &str,
        id: &str,
        dest: &SnapshotStore,
    ) -> Result<(), SnapshotError> {
        let from = self.dir(component, id);
        if !from.exists() {
            return Err(SnapshotError::NotFound(format!("{}/{}", component, id)));
        }
        let to = dest.dir(component, id);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnapshotError::io(parent, e))?;
        }

        match std::fs::rename(&from, &to) {
            Ok(()) => {}
            Err(_) => {
                copy_dir(&from, &to)?;
                std::fs::remove_dir_all(&from).map_err(|e| SnapshotError::io(&from, e))?;
            }
        }
        debug!(component, id, dest = %dest.root.display(), "migrated checkpoint");
        Ok(())
    }

    /// Total bytes of every file under the store root.
    pub fn storage_usage(&self) -> u64 {
        dir_size(&self.root)
    }

    /// Total bytes of one checkpoint directory.
    pub fn entry_size(&self, component: &str, id: &str) -> u64 {
        dir_size(&self.dir(component, id))
    }

    /// Enforce the retention policy: first drop entries older than
    /// `max_age_hours`, then trim each component's tail until at most
    /// `keep_count` remain. Returns the number of removed entries.
    pub fn cleanup(&self, keep_count: usize, max_age_hours: u64) -> Result<usize, SnapshotError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let cutoff = now.saturating_sub(max_age_hours * 3600);
        let mut removed = 0;

        let entries = self.list(None)?;

        for entry in &entries {
            let too_old = Self::timestamp_of(&entry.id).map_or(true, |t| t < cutoff);
            if too_old {
                if let Err(e) = self.remove(&entry.component, &entry.id) {
                    warn!(component = %entry.component, id = %entry.id, error = %e, "age cleanup failed");
                } else {
                    removed += 1;
                }
            }
        }

        // Per-component count trim over whatever survived.
        let survivors = self.list(None)?;
        let mut per_component: std::collections::HashMap<&str, usize> = Default::default();
        for entry in &survivors {
            let count = per_component.entry(entry.component.as_str()).or_insert(0);
            *count += 1;
            if *count > keep_count {
                if let Err(e) = self.remove(&entry.component, &entry.id) {
                    warn!(component = %entry.component, id = %entry.id, error = %e, "quota cleanup failed");
                } else {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                e.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), SnapshotError> {
    std::fs::create_dir_all(to).map_err(|e| SnapshotError::io(to, e))?;
    let entries = std::fs::read_dir(from).map_err(|e| SnapshotError::io(from, e))?;
    for entry in entries.flatten() {
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst).map_err(|e| SnapshotError::io(&src, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::EngineVersion;

    fn meta_for(component: &str, timestamp: u64) -> SnapshotMeta {
        SnapshotMeta {
            component_name: component.into(),
            original_pid: 100,
            timestamp,
            image_size: 4,
            capabilities: "net".into(),
            criu_version: EngineVersion { major: 3, minor: 19, patch: 0 },
            leave_running: true,
            preserve_fds: vec![],
        }
    }

    fn put(store: &SnapshotStore, component: &str, timestamp: u64) -> String {
        let id = SnapshotStore::id_for_timestamp(timestamp);
        let dir = store.create_dir(component, &id).unwrap();
        std::fs::write(dir.join("pages-1.img"), b"data").unwrap();
        store.save_meta(component, &id, &meta_for(component, timestamp)).unwrap();
        id
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn save_and_load_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let id = put(&store, "netd", 1_700_000_000);

        let meta = store.load_meta("netd", &id).unwrap();
        assert_eq!(meta.component_name, "netd");
        assert_eq!(meta.timestamp, 1_700_000_000);
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        put(&store, "netd", 100);
        put(&store, "netd", 300);
        put(&store, "netd", 200);

        let ids: Vec<String> = store
            .list(Some("netd"))
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                SnapshotStore::id_for_timestamp(300),
                SnapshotStore::id_for_timestamp(200),
                SnapshotStore::id_for_timestamp(100),
            ]
        );
    }

    #[test]
    fn find_latest_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        put(&store, "netd", 100);
        let newest = put(&store, "netd", 500);

        assert_eq!(store.find_latest("netd").unwrap().id, newest);
        assert!(matches!(
            store.find_latest("nothing"),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn remove_deletes_entry_and_empty_component_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let id = put(&store, "netd", 100);

        store.remove("netd", &id).unwrap();
        assert!(store.list(Some("netd")).unwrap().is_empty());
        assert!(!dir.path().join("netd").exists());
    }

    #[test]
    fn migrate_moves_between_stores() {
        let t_dir = tempfile::tempdir().unwrap();
        let p_dir = tempfile::tempdir().unwrap();
        let transient = SnapshotStore::new(t_dir.path());
        let persistent = SnapshotStore::new(p_dir.path());
        let id = put(&transient, "netd", 100);

        transient.migrate("netd", &id, &persistent).unwrap();

        assert!(transient.list(Some("netd")).unwrap().is_empty());
        let moved = persistent.find_latest("netd").unwrap();
        assert_eq!(moved.id, id);
        assert!(moved.path.join("pages-1.img").exists());
        assert_eq!(persistent.load_meta("netd", &id).unwrap().timestamp, 100);
    }

    #[test]
    fn storage_usage_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        put(&store, "a", 100);
        put(&store, "b", 100);
        assert!(store.storage_usage() > 0);
    }

    #[test]
    fn cleanup_enforces_age_then_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let now = now_secs();

        // One ancient entry, four recent ones.
        put(&store, "netd", now - 48 * 3600);
        for i in 0..4 {
            put(&store, "netd", now - i);
        }

        let removed = store.cleanup(2, DEFAULT_MAX_AGE_HOURS).unwrap();
        assert_eq!(removed, 3, "one by age, two by quota");

        let left = store.list(Some("netd")).unwrap();
        assert_eq!(left.len(), 2);
        // The survivors are the newest two.
        assert_eq!(left[0].id, SnapshotStore::id_for_timestamp(now));
        assert_eq!(left[1].id, SnapshotStore::id_for_timestamp(now - 1));
    }

    #[test]
    fn cleanup_is_per_component() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let now = now_secs();
        for i in 0..3 {
            put(&store, "a", now - i);
            put(&store, "b", now - i);
        }

        store.cleanup(2, DEFAULT_MAX_AGE_HOURS).unwrap();
        assert_eq!(store.list(Some("a")).unwrap().len(), 2);
        assert_eq!(store.list(Some("b")).unwrap().len(), 2);
    }
}
