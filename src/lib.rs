//! relayr, an HLS streaming proxy.
//!
//! Clients request base64-encoded upstream URLs; the proxy rewrites
//! playlists so every segment and key URI points back through it, prefetches
//! upcoming segments under a rate limit, and serves segment requests from a
//! tiered cache that an inactivity janitor keeps bounded.

pub mod config;
pub mod decrypt;
pub mod error;
pub mod hls;
pub mod http_retry;
pub mod server;
pub mod token;
