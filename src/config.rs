//! Runtime configuration.
//!
//! Every option is a CLI flag with an environment-variable fallback, so the
//! proxy configures identically from a shell, a unit file, or a container
//! environment. Durations accept humantime syntax (`30s`, `5m`, `2h`).

use clap::{ArgAction, Parser};
use std::time::Duration;
use tracing::warn;

/// HLS proxy configuration, parsed from CLI flags and environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "relayr",
    version,
    about = "Fetch, rewrite, and optionally prefetch HLS manifests and segments"
)]
pub struct Config {
    /// Prefetch media segments before the player requests them
    #[arg(long, env = "PREFETCH", default_value_t = true, action = ArgAction::Set)]
    pub prefetch: bool,

    /// Sliding-window size: segments kept per playlist, prefetched ahead, and cached per manifest
    #[arg(long, env = "SEGMENTS", default_value_t = 30)]
    pub segments: usize,

    /// Prefetch dispatch rate in requests per second
    #[arg(long, env = "THROTTLE", default_value_t = 5)]
    pub throttle: u32,

    /// Interval for cleaning cached playlists and clips
    #[arg(long, env = "JANITOR_INTERVAL", default_value = "20s", value_parser = humantime::parse_duration)]
    pub janitor_interval: Duration,

    /// Retry attempts for upstream requests
    #[arg(long, env = "ATTEMPTS", default_value_t = 3)]
    pub attempts: u32,

    /// Duration to keep fetched segments cached
    #[arg(long, env = "CLIP_RETENTION", default_value = "30m", value_parser = humantime::parse_duration)]
    pub clip_retention: Duration,

    /// Duration to keep playlists cached
    #[arg(long, env = "PLAYLIST_RETENTION", default_value = "5h", value_parser = humantime::parse_duration)]
    pub playlist_retention: Duration,

    /// Serve proxied URLs with the HTTPS scheme
    #[arg(long, env = "HTTPS", default_value_t = false, action = ArgAction::Set)]
    pub https: bool,

    /// Decrypt AES-128 segments instead of proxying their keys
    #[arg(long, env = "DECRYPT", default_value_t = false, action = ArgAction::Set)]
    pub decrypt: bool,

    /// Host address to bind and advertise in rewritten manifests
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the HTTP server
    #[arg(long, env = "PORT", default_value_t = 1323)]
    pub port: u16,

    /// Log level (DEBUG, INFO, WARN, ERROR)
    #[arg(long, env = "LOG_LEVEL", default_value = "PRODUCTION")]
    pub log_level: String,

    /// Persist fetched segments to disk for replay
    #[arg(long, env = "SEGMENT_STORE", default_value_t = false, action = ArgAction::Set)]
    pub segment_store: bool,

    /// Cache fetched segments in memory for replay
    #[arg(long, env = "SEGMENT_CACHE", default_value_t = true, action = ArgAction::Set)]
    pub segment_cache: bool,

    /// Directory for persisted segments when segment storage is enabled
    #[arg(long, env = "SEGMENT_STORAGE_DIR", default_value = "./segments")]
    pub segment_dir: String,

    /// Purge manifests and stored segments after periods of inactivity
    #[arg(long, env = "SEGMENT_IDLE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub segment_idle_enabled: bool,

    /// Duration with no requests before a manifest and its segments are purged
    #[arg(long, env = "SEGMENT_IDLE_TIMEOUT", default_value = "20s", value_parser = humantime::parse_duration)]
    pub segment_idle_timeout: Duration,

    /// Only purge manifests that have already served at least one segment
    #[arg(long, env = "SEGMENT_IDLE_REQUIRE_SEGMENTS", default_value_t = false, action = ArgAction::Set)]
    pub segment_idle_require_segments: bool,

    /// Start downloading segments as soon as a manifest is rewritten
    #[arg(long, env = "SEGMENT_BACKGROUND_FETCH", default_value_t = false, action = ArgAction::Set)]
    pub segment_background_fetch: bool,

    /// Run a healthcheck against the configured server and exit
    #[arg(long, env = "HEALTHCHECK", default_value_t = false, action = ArgAction::Set)]
    pub healthcheck: bool,

    /// Total timeout for each upstream request
    #[arg(long, env = "HTTP_CLIENT_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub http_client_timeout: Duration,

    /// Connect timeout for upstream requests
    #[arg(long, env = "HTTP_DIAL_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub http_dial_timeout: Duration,

    /// Delay between retry attempts for manifest and segment requests
    #[arg(long, env = "HTTP_RETRY_REQUEST_DELAY", default_value = "3s", value_parser = humantime::parse_duration)]
    pub retry_request_delay: Duration,

    /// Delay between retry attempts for prefetched clips
    #[arg(long, env = "HTTP_RETRY_CLIP_DELAY", default_value = "2s", value_parser = humantime::parse_duration)]
    pub retry_clip_delay: Duration,

    /// User-Agent presented to upstream servers
    #[arg(
        long,
        env = "HTTP_USER_AGENT",
        default_value = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
    )]
    pub user_agent: String,
}

impl Config {
    /// Parse configuration from the process arguments and environment,
    /// then apply cross-option rules.
    pub fn load() -> Self {
        let mut config = Config::parse();
        config.reconcile();
        config
    }

    /// Apply rules that span multiple options.
    ///
    /// The on-disk store and the in-memory cache are mutually exclusive;
    /// when both are requested the store wins and the cache is disabled.
    pub fn reconcile(&mut self) {
        if self.segment_store && self.segment_cache {
            warn!("segment cache disabled because segment store is enabled");
            self.segment_cache = false;
        }
    }

    /// Translate the configured log level into a tracing filter directive.
    ///
    /// # Errors
    ///
    /// Returns the offending level string when it is not recognised.
    pub fn tracing_directive(&self) -> Result<&'static str, String> {
        match self.log_level.to_uppercase().as_str() {
            "DEBUG" => Ok("debug"),
            "INFO" | "PRODUCTION" | "" => Ok("info"),
            "WARN" | "WARNING" => Ok("warn"),
            "ERROR" => Ok("error"),
            other => Err(format!("unsupported log level {other:?}")),
        }
    }
}
