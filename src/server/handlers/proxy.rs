use crate::error::{RelayrError, Result};
use crate::server::handlers::{manifest, segment};
use crate::server::state::AppState;
use crate::token::Input;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use url::Url;

/// Browsers probe these paths on their own; answer before wasting a decode.
const STATIC_ASSETS: [&str; 3] = [
    "favicon.ico",
    "apple-touch-icon.png",
    "apple-touch-icon-precomposed.png",
];

/// Entry point for every proxied resource: decode the token, then dispatch
/// on the upstream path to the manifest or segment flow.
pub async fn handle_request(
    Path(token): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    if STATIC_ASSETS.contains(&token.as_str()) {
        return Ok((StatusCode::NOT_FOUND, "resource not available").into_response());
    }

    let input = Input::parse(&token)?;
    let upstream = Url::parse(&input.url)
        .map_err(|_| RelayrError::BadRequest("malformed URL in request".to_string()))?;

    let request_host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if upstream.path().ends_with(".m3u8") {
        manifest::serve_manifest(&state, &input, &request_host).await
    } else {
        segment::serve_segment(&state, &input, &params, &headers).await
    }
}
