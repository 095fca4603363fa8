pub mod handlers;
pub mod state;

use crate::config::Config;
use crate::hls::segment_cache::configure_segment_cache;
use crate::hls::segment_store::configure_segment_store;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Router};
use state::AppState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Build the router and wire up the caches and janitors it depends on.
pub async fn build_router(config: Config) -> Router {
    let state = AppState::new(config);

    match configure_segment_store(
        state.config.segment_store,
        &state.config.segment_dir,
        state.config.segments,
    ) {
        Ok(()) if state.config.segment_store => {
            info!("persisting segments to {}", state.config.segment_dir);
        }
        Ok(()) => {}
        Err(e) => error!("segment persistence disabled: {}", e),
    }

    configure_segment_cache(state.config.segment_cache, state.config.segments);
    if state.config.segment_cache {
        info!(
            "in-memory segment cache enabled with limit {}",
            state.config.segments
        );
    }

    if state.config.segment_background_fetch {
        info!("background segment fetch enabled; manifests will trigger proactive downloads");
    }

    if state.config.segment_idle_enabled && !state.config.segment_idle_timeout.is_zero() {
        state.histories.start_inactivity_janitor(
            state.prefetcher.clone(),
            state.config.segment_idle_timeout,
            state.config.segment_idle_require_segments,
        );
    } else {
        debug!("manifest inactivity janitor disabled");
    }

    Router::new()
        .route("/health", get(handlers::health::health_check))
        // Wildcard rather than a single segment: the standard base64
        // alphabet includes '/', so tokens may span path segments.
        .route("/*token", get(handlers::proxy::handle_request))
        .layer(middleware::from_fn(version_header))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until it fails.
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let host = if config.host.trim().is_empty() {
        "0.0.0.0"
    } else {
        config.host.trim()
    };
    let addr = format!("{}:{}", host, config.port);

    let app = build_router(config).await;

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Stamp every response with the proxy version.
async fn version_header(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "x-relayr-version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}
