use crate::error::Result;
use crate::hls::rewrite::{rewrite_playlist, RewriteContext};
use crate::http_retry::{execute_retryable_request, RetryConfig};
use crate::server::handlers::base_headers;
use crate::server::state::AppState;
use crate::token::Input;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::{debug, info};

/// Fetch an upstream playlist and serve the rewritten copy.
///
/// The rewriter resolves relative URIs against the upstream URL *after*
/// redirects, so the final response URL is what gets handed over.
pub async fn serve_manifest(state: &AppState, input: &Input, request_host: &str) -> Result<Response> {
    info!("serving manifest for {}", input.url);

    let retry = RetryConfig::request(&state.config);
    let headers = base_headers(input, &state.config);
    let response =
        execute_retryable_request(&state.http_client, &input.url, headers, &retry).await?;

    let final_url = response.url().clone();
    let body = response.text().await?;

    let ctx = RewriteContext {
        config: &state.config,
        client: &state.http_client,
        histories: &state.histories,
        prefetcher: &state.prefetcher,
        input,
        request_host,
    };

    let started = Instant::now();
    let rewritten = rewrite_playlist(&ctx, &body, &final_url).await?;
    debug!("rewriting manifest took {:?}", started.elapsed());

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        rewritten,
    )
        .into_response())
}
