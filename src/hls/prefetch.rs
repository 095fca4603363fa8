//! Background segment prefetching.
//!
//! Whenever a client asks for a clip, the prefetcher schedules fetches for
//! the clips that follow it in the playlist window, pacing dispatch at the
//! configured rate. Fetched bytes land in the prefetcher's own clip cache,
//! the on-disk store, and the in-memory cache, so a player that keeps up
//! with the window is served from memory from then on.
//!
//! Pacing bounds dispatch, not completion: each clip downloads on its own
//! task. A shared in-flight set deduplicates concurrent fetches of the same
//! clip URL across prefetch passes.

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RelayrError, Result};
use crate::hls::history::HistoryRegistry;
use crate::hls::segment_cache::save_segment_cache;
use crate::hls::segment_store::save_segment;
use crate::http_retry::{execute_retry_clip_request, RetryConfig};

/// A cached value with an absolute expiry, so the janitor can reap it.
#[derive(Debug, Clone)]
pub struct CacheItem<T> {
    pub data: T,
    pub expires_at: Instant,
}

/// One manifest refresh's clip window plus the bytes fetched for it.
///
/// Recreated from scratch on every refresh; previously fetched data is
/// carried over for clip URLs that survive into the new window.
pub struct PrefetchPlaylist {
    playlist_id: String,
    clip_retention: Duration,
    clips: Vec<String>,
    clip_to_index: HashMap<String, usize>,
    fetched: DashMap<String, CacheItem<Bytes>>,
}

impl PrefetchPlaylist {
    fn new(playlist_id: &str, clips: Vec<String>, clip_retention: Duration) -> Self {
        let clip_to_index = clips
            .iter()
            .enumerate()
            .map(|(index, clip)| (clip.clone(), index))
            .collect();
        Self {
            playlist_id: playlist_id.to_string(),
            clip_retention,
            clips,
            clip_to_index,
            fetched: DashMap::new(),
        }
    }

    /// Up to `count` clip URLs starting at `start` in window order.
    fn clips_from(&self, start: usize, count: usize) -> Vec<String> {
        let end = (start + count).min(self.clips.len());
        if start >= end {
            return Vec::new();
        }
        self.clips[start..end].to_vec()
    }

    /// Record fetched bytes and propagate them to the store and cache.
    /// Store failures are logged, not surfaced; the in-memory copies still
    /// serve the clip.
    fn add_clip(&self, clip_url: &str, data: Bytes) {
        self.fetched.insert(
            clip_url.to_string(),
            CacheItem {
                data: data.clone(),
                expires_at: Instant::now() + self.clip_retention,
            },
        );

        if let Err(e) = save_segment(&self.playlist_id, clip_url, &data) {
            warn!("failed to persist segment {}: {}", clip_url, e);
        }

        save_segment_cache(&self.playlist_id, clip_url, &data);
    }

    /// Drop clip entries past their expiry.
    fn clean(&self) {
        let now = Instant::now();
        self.fetched.retain(|clip_url, item| {
            let keep = item.expires_at > now;
            if !keep {
                debug!("removed clip {} from {}", clip_url, self.playlist_id);
            }
            keep
        });
    }
}

/// Rate-limited, deduplicated background fetcher for playlist clips.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
}

struct PrefetcherInner {
    client: Client,
    histories: HistoryRegistry,
    clip_prefetch_count: usize,
    throttle: u32,
    retry: RetryConfig,
    playlist_retention: Duration,
    clip_retention: Duration,
    in_flight: DashSet<String>,
    playlists: DashMap<String, CacheItem<Arc<PrefetchPlaylist>>>,
}

impl Prefetcher {
    pub fn new(client: Client, histories: HistoryRegistry, config: &Config) -> Self {
        Self {
            inner: Arc::new(PrefetcherInner {
                client,
                histories,
                clip_prefetch_count: config.segments,
                throttle: config.throttle,
                retry: RetryConfig::clip(config),
                playlist_retention: config.playlist_retention,
                clip_retention: config.clip_retention,
                in_flight: DashSet::new(),
                playlists: DashMap::new(),
            }),
        }
    }

    /// Like [`Prefetcher::new`], but also spawns the retention janitor that
    /// calls [`Prefetcher::clean`] at the configured interval.
    pub fn with_janitor(client: Client, histories: HistoryRegistry, config: &Config) -> Self {
        let prefetcher = Self::new(client, histories, config);
        let interval = config.janitor_interval;
        if !interval.is_zero() {
            let janitor = prefetcher.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    janitor.clean();
                }
            });
        }
        prefetcher
    }

    /// Install the playlist's current clip window, carrying over fetched
    /// bytes for clips that are still present.
    pub fn add_playlist_to_cache(&self, playlist_id: &str, clip_urls: Vec<String>) {
        debug!("adding playlist {} to cache", playlist_id);
        let playlist = Arc::new(PrefetchPlaylist::new(
            playlist_id,
            clip_urls,
            self.inner.clip_retention,
        ));

        let previous = self
            .inner
            .playlists
            .get(playlist_id)
            .map(|item| Arc::clone(&item.data));
        if let Some(previous) = previous {
            for entry in previous.fetched.iter() {
                if playlist.clip_to_index.contains_key(entry.key()) {
                    playlist
                        .fetched
                        .insert(entry.key().clone(), entry.value().clone());
                }
            }
        }

        self.inner.playlists.insert(
            playlist_id.to_string(),
            CacheItem {
                data: playlist,
                expires_at: Instant::now() + self.inner.playlist_retention,
            },
        );
    }

    /// Return cached bytes for a clip, if any, and schedule a prefetch pass
    /// for the clips that follow it.
    ///
    /// The pass is scheduled even on a miss; a player that just tuned in
    /// warms the window before it asks for the next segment.
    pub fn get_fetched_clip(&self, playlist_id: &str, clip_url: &str) -> Option<Bytes> {
        let playlist = self
            .inner
            .playlists
            .get(playlist_id)
            .map(|item| Arc::clone(&item.data))?;

        let data = playlist
            .fetched
            .get(clip_url)
            .map(|item| item.data.clone());

        if let Some(&index) = playlist.clip_to_index.get(clip_url) {
            if !playlist.clips.is_empty() {
                let start = (index + 1).min(playlist.clips.len() - 1);
                let clips = playlist.clips_from(start, self.inner.clip_prefetch_count);
                let prefetcher = self.clone();
                tokio::spawn(async move {
                    prefetcher.queue_clips_for_prefetch(playlist, clips).await;
                });
            }
        }

        data
    }

    /// Proactively fetch the first clips of a playlist window.
    pub fn warm_playlist(&self, playlist_id: &str) {
        if playlist_id.is_empty() {
            return;
        }
        let Some(playlist) = self
            .inner
            .playlists
            .get(playlist_id)
            .map(|item| Arc::clone(&item.data))
        else {
            return;
        };

        let mut limit = self.inner.clip_prefetch_count;
        if limit == 0 || limit > playlist.clips.len() {
            limit = playlist.clips.len();
        }
        if limit == 0 {
            return;
        }

        let clips = playlist.clips_from(0, limit);
        let prefetcher = self.clone();
        tokio::spawn(async move {
            prefetcher.queue_clips_for_prefetch(playlist, clips).await;
        });
    }

    /// Dispatch fetches for `clips` at the throttle rate. The first clip
    /// starts immediately; each subsequent dispatch waits for the next tick.
    /// Clips already in flight or already fetched are skipped without
    /// consuming a tick.
    async fn queue_clips_for_prefetch(&self, playlist: Arc<PrefetchPlaylist>, clips: Vec<String>) {
        if clips.is_empty() {
            return;
        }

        let rate = self.inner.throttle.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / rate);
        // The first tick of a tokio interval completes immediately.
        ticker.tick().await;

        let mut first = true;
        for clip in clips {
            if clip.is_empty() {
                continue;
            }
            if self.inner.in_flight.contains(&clip) || playlist.fetched.contains_key(&clip) {
                continue;
            }

            if first {
                first = false;
            } else {
                ticker.tick().await;
            }

            if !self.inner.in_flight.insert(clip.clone()) {
                continue;
            }

            let prefetcher = self.clone();
            let playlist = Arc::clone(&playlist);
            tokio::spawn(async move {
                match prefetcher.fetch_clip(&clip).await {
                    Ok(data) => {
                        debug!("fetched clip {}", clip);
                        playlist.add_clip(&clip, data);
                        prefetcher
                            .inner
                            .histories
                            .record_segment_request(&playlist.playlist_id);
                    }
                    Err(e) => debug!("error fetching clip {}: {}", clip, e),
                }
                prefetcher.inner.in_flight.remove(&clip);
            });
        }
    }

    async fn fetch_clip(&self, clip_url: &str) -> Result<Bytes> {
        if clip_url.is_empty() {
            return Err(RelayrError::BadRequest("clip URL is empty".to_string()));
        }
        execute_retry_clip_request(
            &self.inner.client,
            clip_url,
            HeaderMap::new(),
            &self.inner.retry,
        )
        .await
    }

    /// Drop expired playlists, then expired clips of the survivors.
    pub fn clean(&self) {
        debug!("cleaning playlist cache");
        let now = Instant::now();
        self.inner.playlists.retain(|playlist_id, item| {
            let keep = item.expires_at > now;
            if !keep {
                debug!("removed playlist {}", playlist_id);
            }
            keep
        });
        for entry in self.inner.playlists.iter() {
            entry.data.clean();
        }
    }

    /// Discard cached data for a playlist identifier.
    pub fn remove_playlist(&self, playlist_id: &str) {
        if playlist_id.is_empty() {
            return;
        }
        self.inner.playlists.remove(playlist_id);
    }

    /// Whether a playlist is currently tracked.
    pub fn has_playlist(&self, playlist_id: &str) -> bool {
        self.inner.playlists.contains_key(playlist_id)
    }

    /// Cached bytes for a clip without scheduling any prefetch.
    pub fn peek_fetched_clip(&self, playlist_id: &str, clip_url: &str) -> Option<Bytes> {
        let playlist = self
            .inner
            .playlists
            .get(playlist_id)
            .map(|item| Arc::clone(&item.data))?;
        let data = playlist.fetched.get(clip_url).map(|item| item.data.clone());
        data
    }
}
