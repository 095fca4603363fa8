//! On-disk segment store.
//!
//! Segments are content-addressed by the SHA-1 of their clip URL inside a
//! per-manifest directory: `<base>/<manifest>/<hex[..2]>/<hex[2..]>.seg`.
//! Writes go to a temp file and are renamed into place, so readers only ever
//! observe complete files. After every save the per-manifest file count is
//! enforced by deleting the oldest segments first.
//!
//! Like the in-memory cache, the active store is a process-wide singleton
//! swapped under a read/write lock. The first successful activation also
//! registers a shutdown watcher that wipes the store before the process
//! exits.

use sha1::{Digest, Sha1};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, Once, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::hls::segment_cache::reset_segment_cache;

/// File-backed segment store with a per-manifest segment count limit.
pub struct FileSegmentStore {
    base_dir: PathBuf,
    limit: usize,
    // Serialises save/remove so temp-write + rename + limit enforcement are
    // atomic relative to each other. Loads stay lock-free.
    write_lock: Mutex<()>,
}

impl FileSegmentStore {
    /// Create the store, making sure the base directory exists.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the base directory cannot be created.
    pub fn new(base_dir: impl Into<PathBuf>, limit: usize) -> io::Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            limit,
            write_lock: Mutex::new(()),
        })
    }

    /// Persist a segment. Empty payloads and manifest IDs are ignored.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the write or rename fails.
    pub fn save(&self, manifest_id: &str, key: &str, data: &[u8]) -> io::Result<()> {
        if data.is_empty() || manifest_id.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let path = self.path_for(manifest_id, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(&path);
        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            // Do not leave temp files behind when the rename fails.
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        self.enforce_limit_locked(manifest_id);
        Ok(())
    }

    /// Read a stored segment. `Ok(None)` means the segment is not stored.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than not-found.
    pub fn load(&self, manifest_id: &str, key: &str) -> io::Result<Option<Vec<u8>>> {
        if manifest_id.is_empty() {
            return Ok(None);
        }
        match fs::read(self.path_for(manifest_id, key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete every stored segment for the manifest.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be removed.
    pub fn remove(&self, manifest_id: &str) -> io::Result<()> {
        if manifest_id.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        match fs::remove_dir_all(self.manifest_root(manifest_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn path_for(&self, manifest_id: &str, key: &str) -> PathBuf {
        let digest = Sha1::digest(key.as_bytes());
        let hex = hex::encode(digest);
        self.manifest_root(manifest_id)
            .join(&hex[..2])
            .join(format!("{}.seg", &hex[2..]))
    }

    fn manifest_root(&self, manifest_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_manifest_id(manifest_id))
    }

    /// Drop oldest-by-mtime segments until the manifest is back under the
    /// limit, pruning directories emptied along the way. Failures are logged
    /// and swallowed; eviction is best effort.
    fn enforce_limit_locked(&self, manifest_id: &str) {
        if self.limit == 0 {
            return;
        }

        let manifest_root = self.manifest_root(manifest_id);
        if !manifest_root.is_dir() {
            return;
        }

        let mut files: Vec<(PathBuf, SystemTime)> = WalkDir::new(&manifest_root)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("walk segment directory for {}: {}", manifest_id, e);
                    None
                }
            })
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().ends_with(".seg")
            })
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((entry.into_path(), modified))
            })
            .collect();

        if files.len() <= self.limit {
            return;
        }

        files.sort_by_key(|(_, modified)| *modified);

        let excess = files.len() - self.limit;
        for (path, _) in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("remove stale segment {}: {}", path.display(), e);
                    continue;
                }
            }
            if let Some(parent) = path.parent() {
                cleanup_empty_dirs(parent, &manifest_root);
            }
        }
    }
}

/// Remove empty directories from `start` up to, but not including, `stop`.
fn cleanup_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    loop {
        if current == stop {
            return;
        }
        match fs::read_dir(&current) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return;
                }
            }
            Err(_) => return,
        }
        if fs::remove_dir(&current).is_err() {
            return;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Flatten a manifest ID into a safe single directory name.
fn sanitize_manifest_id(id: &str) -> String {
    let sanitized: String = id
        .trim()
        .chars()
        .filter_map(|c| match c {
            '/' | '\\' | '?' | '*' | '<' | '>' | '|' | '"' => Some('_'),
            ':' | '+' => Some('-'),
            '=' => None,
            other => Some(other),
        })
        .take(120)
        .collect();

    if sanitized.is_empty() {
        "manifest".to_string()
    } else {
        sanitized
    }
}

struct StoreHolder {
    enabled: bool,
    base_dir: Option<PathBuf>,
    store: Option<Arc<FileSegmentStore>>,
}

static ACTIVE_STORE: LazyLock<RwLock<StoreHolder>> = LazyLock::new(|| {
    RwLock::new(StoreHolder {
        enabled: false,
        base_dir: None,
        store: None,
    })
});

static CLEANUP_SIGNAL: Once = Once::new();

fn snapshot() -> Option<Arc<FileSegmentStore>> {
    let holder = ACTIVE_STORE.read().unwrap_or_else(|p| p.into_inner());
    if !holder.enabled {
        return None;
    }
    holder.store.clone()
}

/// Switch the active segment storage implementation.
///
/// Enabling creates the base directory, installs a fresh store, and
/// registers the shutdown watcher once per process. Disabling drops the
/// store reference entirely.
///
/// # Errors
///
/// Returns the I/O error when the base directory cannot be created.
pub fn configure_segment_store(enabled: bool, base_dir: &str, limit: usize) -> io::Result<()> {
    let mut holder = ACTIVE_STORE.write().unwrap_or_else(|p| p.into_inner());

    if !enabled {
        holder.enabled = false;
        holder.base_dir = None;
        holder.store = None;
        return Ok(());
    }

    let store = FileSegmentStore::new(base_dir, limit)?;
    holder.enabled = true;
    holder.base_dir = Some(PathBuf::from(base_dir));
    holder.store = Some(Arc::new(store));
    drop(holder);

    register_cleanup();
    Ok(())
}

/// Persist a segment if a store is configured.
///
/// # Errors
///
/// Returns the store's I/O error.
pub fn save_segment(manifest_id: &str, key: &str, data: &[u8]) -> io::Result<()> {
    match snapshot() {
        Some(store) if !manifest_id.is_empty() => store.save(manifest_id, key, data),
        _ => Ok(()),
    }
}

/// Retrieve the stored payload for the supplied key.
///
/// # Errors
///
/// Returns the store's I/O error.
pub fn load_segment(manifest_id: &str, key: &str) -> io::Result<Option<Vec<u8>>> {
    match snapshot() {
        Some(store) if !manifest_id.is_empty() => store.load(manifest_id, key),
        _ => Ok(None),
    }
}

/// Delete all persisted segments for a manifest, if storage is active.
///
/// # Errors
///
/// Returns the store's I/O error.
pub fn remove_manifest_segments(manifest_id: &str) -> io::Result<()> {
    match snapshot() {
        Some(store) if !manifest_id.is_empty() => store.remove(manifest_id),
        _ => Ok(()),
    }
}

/// Wipe every persisted segment and deactivate the store.
///
/// # Errors
///
/// Returns the I/O error when the base directory cannot be removed.
pub fn cleanup_segment_store() -> io::Result<()> {
    let mut holder = ACTIVE_STORE.write().unwrap_or_else(|p| p.into_inner());

    let Some(base_dir) = holder.base_dir.take() else {
        holder.enabled = false;
        holder.store = None;
        return Ok(());
    };

    // Grab the write lock of the outgoing store so an in-flight save
    // completes before the directory disappears underneath it.
    if let Some(store) = holder.store.take() {
        let _guard = store.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        holder.enabled = false;
        fs::remove_dir_all(&base_dir)?;
    } else {
        holder.enabled = false;
        fs::remove_dir_all(&base_dir)?;
    }
    let _ = fs::create_dir_all(&base_dir);
    Ok(())
}

/// Register the shutdown watcher, at most once per process. Outside a tokio
/// runtime (unit tests) this is a no-op.
fn register_cleanup() {
    CLEANUP_SIGNAL.call_once(|| {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; segment store shutdown watcher not installed");
            return;
        };
        handle.spawn(async {
            let exit_code = wait_for_shutdown_signal().await;
            info!("received shutdown signal, cleaning segment store");
            if let Err(e) = cleanup_segment_store() {
                warn!("segment cleanup failed: {}", e);
            }
            reset_segment_cache();
            std::process::exit(exit_code);
        });
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return 130;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => 130,
        _ = term.recv() => 143,
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    130
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(limit: usize) -> (TempDir, FileSegmentStore) {
        let dir = TempDir::new().unwrap();
        let store = FileSegmentStore::new(dir.path(), limit).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store(0);
        store
            .save("manifest", "http://o/seg-1.ts", b"payload")
            .unwrap();
        let loaded = store.load("manifest", "http://o/seg-1.ts").unwrap();
        assert_eq!(loaded, Some(b"payload".to_vec()));
    }

    #[test]
    fn load_missing_returns_none() {
        let (_dir, store) = store(0);
        assert_eq!(store.load("manifest", "http://o/none.ts").unwrap(), None);
    }

    #[test]
    fn empty_payload_is_ignored() {
        let (_dir, store) = store(0);
        store.save("manifest", "key", b"").unwrap();
        assert_eq!(store.load("manifest", "key").unwrap(), None);
    }

    #[test]
    fn layout_uses_sha1_fan_out() {
        let (dir, store) = store(0);
        store.save("manifest", "clip", b"x").unwrap();

        let digest = hex::encode(Sha1::digest(b"clip"));
        let expected = dir
            .path()
            .join("manifest")
            .join(&digest[..2])
            .join(format!("{}.seg", &digest[2..]));
        assert!(expected.is_file(), "expected {}", expected.display());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (dir, store) = store(0);
        for i in 0..10 {
            store.save("manifest", &format!("clip-{i}"), b"data").unwrap();
        }
        let leftovers: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn limit_evicts_oldest_by_mtime() {
        let (_dir, store) = store(2);
        store.save("manifest", "clip-0", b"0").unwrap();
        thread::sleep(Duration::from_millis(20));
        store.save("manifest", "clip-1", b"1").unwrap();
        thread::sleep(Duration::from_millis(20));
        store.save("manifest", "clip-2", b"2").unwrap();

        assert_eq!(store.load("manifest", "clip-0").unwrap(), None);
        assert_eq!(store.load("manifest", "clip-1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.load("manifest", "clip-2").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn eviction_prunes_empty_prefix_dirs() {
        let (dir, store) = store(1);
        store.save("manifest", "first", b"1").unwrap();
        thread::sleep(Duration::from_millis(20));
        store.save("manifest", "second", b"2").unwrap();

        let manifest_root = dir.path().join("manifest");
        let prefix_dirs: Vec<_> = fs::read_dir(&manifest_root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        // Only the prefix directory of the surviving segment remains.
        assert_eq!(prefix_dirs.len(), 1, "stale prefix dirs: {prefix_dirs:?}");
        assert!(manifest_root.is_dir(), "manifest root must survive pruning");
    }

    #[test]
    fn remove_wipes_one_manifest() {
        let (_dir, store) = store(0);
        store.save("m1", "clip", b"1").unwrap();
        store.save("m2", "clip", b"2").unwrap();
        store.remove("m1").unwrap();
        assert_eq!(store.load("m1", "clip").unwrap(), None);
        assert_eq!(store.load("m2", "clip").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn remove_missing_manifest_is_ok() {
        let (_dir, store) = store(0);
        store.remove("never-seen").unwrap();
    }

    #[test]
    fn concurrent_reader_never_sees_partial_write() {
        let (dir, _) = store(0);
        let store = Arc::new(FileSegmentStore::new(dir.path(), 0).unwrap());

        let old = vec![b'a'; 64 * 1024];
        let new = vec![b'b'; 16 * 1024];
        store.save("m", "clip", &old).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let new = new.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store.save("m", "clip", &new).unwrap();
                }
            })
        };

        for _ in 0..200 {
            if let Some(data) = store.load("m", "clip").unwrap() {
                assert!(
                    data.len() == old.len() || data.len() == new.len(),
                    "observed truncated segment of {} bytes",
                    data.len()
                );
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize_manifest_id("a/b\\c?d*e<f>g|h\"i"), "a_b_c_d_e_f_g_h_i");
        assert_eq!(sanitize_manifest_id("a:b+c"), "a-b-c");
        assert_eq!(sanitize_manifest_id("a=b="), "ab");
    }

    #[test]
    fn sanitize_defaults_empty_to_manifest() {
        assert_eq!(sanitize_manifest_id(""), "manifest");
        assert_eq!(sanitize_manifest_id("==="), "manifest");
        assert_eq!(sanitize_manifest_id("   "), "manifest");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_manifest_id(&long).len(), 120);
    }
}
