//! In-memory segment cache.
//!
//! Entries are grouped per manifest and evicted FIFO by insertion once a
//! manifest exceeds the configured limit. The active cache is a process-wide
//! singleton behind a read/write lock: reconfiguration swaps the whole store
//! rather than mutating the live one, and disabling swaps in a no-op
//! implementation.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

/// Behaviour shared by the no-op and in-memory implementations.
trait SegmentCacheStore: Send + Sync {
    fn save(&self, manifest_id: &str, key: &str, data: &[u8]);
    fn load(&self, manifest_id: &str, key: &str) -> Option<Vec<u8>>;
    fn remove(&self, manifest_id: &str);
    fn reset(&self);
}

struct NoopSegmentCache;

impl SegmentCacheStore for NoopSegmentCache {
    fn save(&self, _manifest_id: &str, _key: &str, _data: &[u8]) {}
    fn load(&self, _manifest_id: &str, _key: &str) -> Option<Vec<u8>> {
        None
    }
    fn remove(&self, _manifest_id: &str) {}
    fn reset(&self) {}
}

/// One manifest's entries; `order` and `entries` always agree on the key set.
#[derive(Default)]
struct ManifestCache {
    order: Vec<String>,
    entries: HashMap<String, Vec<u8>>,
}

impl ManifestCache {
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|existing| existing == key) {
            self.order.remove(pos);
        }
    }
}

/// Bounded per-manifest FIFO cache behind a single read/write lock.
struct MemorySegmentCache {
    limit: usize,
    manifests: RwLock<HashMap<String, ManifestCache>>,
}

impl MemorySegmentCache {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            manifests: RwLock::new(HashMap::new()),
        }
    }
}

impl SegmentCacheStore for MemorySegmentCache {
    fn save(&self, manifest_id: &str, key: &str, data: &[u8]) {
        if data.is_empty() || manifest_id.is_empty() || key.is_empty() {
            return;
        }

        let mut manifests = self.manifests.write().unwrap_or_else(|p| p.into_inner());
        let manifest = manifests.entry(manifest_id.to_string()).or_default();

        // Re-saving an existing key moves it to the tail of the window.
        if manifest.entries.contains_key(key) {
            manifest.remove(key);
        }
        manifest.entries.insert(key.to_string(), data.to_vec());
        manifest.order.push(key.to_string());

        if self.limit > 0 {
            while manifest.order.len() > self.limit {
                let oldest = manifest.order.remove(0);
                manifest.entries.remove(&oldest);
            }
        }
    }

    fn load(&self, manifest_id: &str, key: &str) -> Option<Vec<u8>> {
        if manifest_id.is_empty() || key.is_empty() {
            return None;
        }
        let manifests = self.manifests.read().unwrap_or_else(|p| p.into_inner());
        manifests.get(manifest_id)?.entries.get(key).cloned()
    }

    fn remove(&self, manifest_id: &str) {
        if manifest_id.is_empty() {
            return;
        }
        let mut manifests = self.manifests.write().unwrap_or_else(|p| p.into_inner());
        manifests.remove(manifest_id);
    }

    fn reset(&self) {
        let mut manifests = self.manifests.write().unwrap_or_else(|p| p.into_inner());
        manifests.clear();
    }
}

struct CacheHolder {
    enabled: bool,
    store: Arc<dyn SegmentCacheStore>,
}

static ACTIVE_CACHE: LazyLock<RwLock<CacheHolder>> = LazyLock::new(|| {
    RwLock::new(CacheHolder {
        enabled: false,
        store: Arc::new(NoopSegmentCache),
    })
});

/// Capture the active store and its enabled flag, releasing the lock before
/// the store is used.
fn snapshot() -> (bool, Arc<dyn SegmentCacheStore>) {
    let holder = ACTIVE_CACHE.read().unwrap_or_else(|p| p.into_inner());
    (holder.enabled, Arc::clone(&holder.store))
}

/// Switch the in-memory cache implementation on or off.
///
/// Enabling installs a fresh bounded cache; disabling swaps in the no-op
/// store, dropping all cached entries.
pub fn configure_segment_cache(enabled: bool, limit: usize) {
    let mut holder = ACTIVE_CACHE.write().unwrap_or_else(|p| p.into_inner());
    if enabled {
        holder.store = Arc::new(MemorySegmentCache::new(limit));
        holder.enabled = true;
    } else {
        holder.store = Arc::new(NoopSegmentCache);
        holder.enabled = false;
    }
}

/// Store bytes in the active cache, if enabled.
pub fn save_segment_cache(manifest_id: &str, key: &str, data: &[u8]) {
    let (enabled, store) = snapshot();
    if !enabled {
        return;
    }
    store.save(manifest_id, key, data);
}

/// Retrieve cached bytes for the given manifest and key.
pub fn load_segment_cache(manifest_id: &str, key: &str) -> Option<Vec<u8>> {
    let (enabled, store) = snapshot();
    if !enabled {
        return None;
    }
    store.load(manifest_id, key)
}

/// Remove all cached entries associated with the manifest.
pub fn clear_segment_cache(manifest_id: &str) {
    let (enabled, store) = snapshot();
    if !enabled {
        return;
    }
    store.remove(manifest_id);
}

/// Discard every in-memory cached segment.
pub fn reset_segment_cache() {
    let (enabled, store) = snapshot();
    if !enabled {
        return;
    }
    store.reset();
}
