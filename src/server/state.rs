use crate::config::Config;
use crate::hls::history::HistoryRegistry;
use crate::hls::prefetch::Prefetcher;
use reqwest::Client;
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    /// Owner of all per-playlist manifest histories
    pub histories: HistoryRegistry,
    /// Background segment fetcher
    pub prefetcher: Prefetcher,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> Self {
        // Origins behind self-signed certificates are common for this kind
        // of proxy; certificate validation is deliberately relaxed.
        let http_client = Client::builder()
            .timeout(config.http_client_timeout)
            .connect_timeout(config.http_dial_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create HTTP client");

        let histories = HistoryRegistry::new();
        let prefetcher = Prefetcher::with_janitor(http_client.clone(), histories.clone(), &config);

        Self {
            config: Arc::new(config),
            http_client,
            histories,
            prefetcher,
        }
    }
}
