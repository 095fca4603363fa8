//! Per-playlist manifest history.
//!
//! Live HLS origins serve a sliding window that drops and re-adds segments
//! between refreshes, and some reset their `#EXT-X-MEDIA-SEQUENCE` numbering
//! outright. The history gives every clip URL a sequence number once and
//! keeps it, so the rewritten manifest stays monotonic for the player no
//! matter what the origin does.
//!
//! Histories live in a [`HistoryRegistry`] keyed by manifest, and an
//! inactivity janitor purges any history that has not been touched within
//! the idle timeout, cascading into the prefetcher, the on-disk store, and
//! the in-memory cache.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::hls::prefetch::Prefetcher;
use crate::hls::segment_cache::clear_segment_cache;
use crate::hls::segment_store::remove_manifest_segments;

/// One entry of a media playlist as tracked across refreshes.
///
/// `sequence` and `iv` are assigned by the history and the parser
/// respectively; everything else mirrors the most recent upstream refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSegment {
    pub sequence: u64,
    pub tags: Vec<String>,
    pub line: String,
    pub clip_url: String,
    pub has_key: bool,
    pub decryption_key: String,
    pub iv: u64,
}

#[derive(Default)]
struct HistoryState {
    playlist_id: String,
    segments: HashMap<String, ManifestSegment>,
    order: Vec<String>,
    last_access: Option<Instant>,
    next_seq: u64,
    segments_requested: bool,
}

/// Sliding history of one playlist. All mutation happens under the internal
/// mutex; no operation acquires another history's lock.
pub struct ManifestHistory {
    state: Mutex<HistoryState>,
}

impl ManifestHistory {
    fn new() -> Self {
        Self {
            state: Mutex::new(HistoryState {
                last_access: Some(Instant::now()),
                ..HistoryState::default()
            }),
        }
    }

    /// Merge freshly parsed segments into the history and return the full
    /// window in insertion order.
    ///
    /// Known clip URLs keep their sequence number but take the refresh's
    /// tags, line, and key state. New clip URLs are appended and numbered
    /// from the monotonic counter. When the window exceeds `limit`, the
    /// oldest entries are dropped from the head.
    pub fn merge(&self, entries: Vec<ManifestSegment>, limit: usize) -> Vec<ManifestSegment> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let state = &mut *guard;
        state.last_access = Some(Instant::now());

        for mut entry in entries {
            if entry.clip_url.is_empty() {
                continue;
            }
            if let Some(existing) = state.segments.get_mut(&entry.clip_url) {
                existing.tags = std::mem::take(&mut entry.tags);
                existing.line = entry.line;
                existing.has_key = entry.has_key;
                existing.decryption_key = entry.decryption_key;
                existing.iv = entry.iv;
                continue;
            }

            entry.sequence = state.next_seq;
            state.next_seq += 1;
            state.order.push(entry.clip_url.clone());
            state.segments.insert(entry.clip_url.clone(), entry);
        }

        if limit > 0 && state.order.len() > limit {
            let drop = state.order.len() - limit;
            for clip in state.order.drain(..drop) {
                state.segments.remove(&clip);
            }
        }

        state
            .order
            .iter()
            .filter_map(|clip| state.segments.get(clip))
            .cloned()
            .collect()
    }

    /// Refresh the last-access time.
    pub fn touch(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_access = Some(Instant::now());
    }

    /// Whether the history has been idle since before `cutoff`. A reset
    /// history reports active until it is accessed again.
    pub fn inactive_since(&self, cutoff: Instant) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.last_access {
            Some(last) => last < cutoff,
            None => false,
        }
    }

    /// Clear all state, including the playlist ID and sequence counter.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = HistoryState::default();
    }

    /// Record that a segment request touched this playlist.
    pub fn mark_segment_requested(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_access = Some(Instant::now());
        state.segments_requested = true;
    }

    /// Whether any segment request has touched this playlist.
    pub fn has_served_segments(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.segments_requested
    }

    /// Assign the playlist ID if none is set yet; returns the effective ID.
    /// Assignment is idempotent for the lifetime of the history.
    pub fn ensure_playlist_id(&self, id: &str) -> String {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.playlist_id.is_empty() {
            state.playlist_id = id.to_string();
        }
        state.playlist_id.clone()
    }

    /// The assigned playlist ID, or an empty string.
    pub fn current_playlist_id(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.playlist_id.clone()
    }
}

/// Owner of every [`ManifestHistory`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HistoryRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    histories: DashMap<String, Arc<ManifestHistory>>,
    janitor_started: Once,
}

impl HistoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                histories: DashMap::new(),
                janitor_started: Once::new(),
            }),
        }
    }

    /// Fetch the history for a manifest key, creating it on first sight.
    /// An existing history is touched.
    pub fn get_or_create(&self, key: &str) -> Arc<ManifestHistory> {
        if let Some(entry) = self.inner.histories.get(key) {
            let history = Arc::clone(&entry);
            drop(entry);
            history.touch();
            return history;
        }
        let history = Arc::new(ManifestHistory::new());
        self.inner
            .histories
            .entry(key.to_string())
            .or_insert_with(|| Arc::clone(&history))
            .clone()
    }

    /// Refresh the last-access time for a manifest, if it is known.
    pub fn touch(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        if let Some(history) = self.inner.histories.get(key) {
            history.touch();
        }
    }

    /// Record a segment request against a manifest, creating its history on
    /// first sight so background fetches keep a playlist alive too.
    pub fn record_segment_request(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        self.get_or_create(key).mark_segment_requested();
    }

    /// Snapshot of all histories; iteration never blocks writers.
    fn items(&self) -> Vec<(String, Arc<ManifestHistory>)> {
        self.inner
            .histories
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn remove(&self, key: &str) {
        self.inner.histories.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.histories.len()
    }

    /// Start the inactivity janitor. Only the first call per registry has an
    /// effect, and a zero `ttl` disables the janitor entirely.
    pub fn start_inactivity_janitor(
        &self,
        prefetcher: Prefetcher,
        ttl: Duration,
        require_segments: bool,
    ) {
        if ttl.is_zero() {
            return;
        }
        self.inner.janitor_started.call_once(|| {
            let registry = self.clone();
            let interval = (ttl / 2).max(Duration::from_secs(5));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    registry.purge_inactive(&prefetcher, ttl, require_segments);
                }
            });
        });
    }

    /// Purge every history idle for longer than `ttl`, cascading into the
    /// prefetcher, the on-disk store, and the in-memory cache.
    pub fn purge_inactive(&self, prefetcher: &Prefetcher, ttl: Duration, require_segments: bool) {
        let Some(cutoff) = Instant::now().checked_sub(ttl) else {
            return;
        };

        for (key, history) in self.items() {
            if !history.inactive_since(cutoff) {
                continue;
            }
            if require_segments && !history.has_served_segments() {
                continue;
            }

            let playlist_id = history.current_playlist_id();
            history.reset();
            self.remove(&key);

            if playlist_id.is_empty() {
                continue;
            }

            info!("purging inactive manifest {}", playlist_id);
            prefetcher.remove_playlist(&playlist_id);
            if let Err(e) = remove_manifest_segments(&playlist_id) {
                warn!(
                    "failed to remove persisted segments for {}: {}",
                    playlist_id, e
                );
            }
            clear_segment_cache(&playlist_id);
        }
    }
}

impl Default for HistoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
