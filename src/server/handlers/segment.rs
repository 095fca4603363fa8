use crate::decrypt::decrypt_segment;
use crate::error::Result;
use crate::hls::segment_cache::{load_segment_cache, save_segment_cache};
use crate::hls::segment_store::{load_segment, save_segment};
use crate::http_retry::{execute_retryable_request, RetryConfig};
use crate::server::handlers::base_headers;
use crate::server::state::AppState;
use crate::token::Input;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Serve a media segment through the cache tiers, falling back to origin.
///
/// Lookup order: prefetch cache, in-memory cache, on-disk store, origin.
/// A `Range` request bypasses and never populates the caches. Every request
/// marks the playlist as live for the inactivity janitor.
pub async fn serve_segment(
    state: &AppState,
    input: &Input,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response> {
    let p_id = params.get("pId").map(String::as_str).unwrap_or("");
    let manifest_id = if !p_id.is_empty() {
        p_id
    } else if !input.encoded.is_empty() {
        &input.encoded
    } else {
        &input.url
    };

    state.histories.touch(manifest_id);
    state.histories.record_segment_request(manifest_id);

    let decryption_key = params.get("key").map(String::as_str).unwrap_or("");
    let iv = params.get("iv").map(String::as_str).unwrap_or("");
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let mut found: Option<Bytes> = None;

    if !p_id.is_empty() && state.config.prefetch {
        let started = Instant::now();
        found = state.prefetcher.get_fetched_clip(p_id, &input.url);
        debug!("prefetch cache lookup took {:?}", started.elapsed());
    }

    if found.is_none() && state.config.segment_cache && range.is_empty() {
        found = load_segment_cache(manifest_id, &input.url).map(Bytes::from);
    }

    if found.is_none() && state.config.segment_store && range.is_empty() {
        match load_segment(manifest_id, &input.url) {
            Ok(stored) => found = stored.map(Bytes::from),
            Err(e) => error!("error loading segment from store: {}", e),
        }
    }

    if let Some(data) = found {
        let data = maybe_decrypt(data, decryption_key, iv)?;
        return Ok(segment_response(
            StatusCode::OK,
            content_type_for(&input.url, None),
            None,
            data,
        ));
    }

    debug!("fetching clip from origin: {}", input.url);

    let mut upstream_headers = base_headers(input, &state.config);
    if !range.is_empty() {
        if let Ok(value) = HeaderValue::from_str(range) {
            upstream_headers.insert(header::RANGE, value);
        }
    }

    let retry = RetryConfig::request(&state.config);
    let response =
        execute_retryable_request(&state.http_client, &input.url, upstream_headers, &retry).await?;

    let status = response.status();
    let content_range = response.headers().get(header::CONTENT_RANGE).cloned();
    let upstream_content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let bytes = response.bytes().await.map_err(crate::error::RelayrError::from)?;

    if state.config.segment_store && range.is_empty() {
        if let Err(e) = save_segment(manifest_id, &input.url, &bytes) {
            warn!("failed to persist segment from origin: {}", e);
        }
    }
    if state.config.segment_cache && range.is_empty() {
        save_segment_cache(manifest_id, &input.url, &bytes);
    }

    let data = maybe_decrypt(bytes, decryption_key, iv)?;
    Ok(segment_response(
        status,
        content_type_for(&input.url, upstream_content_type.as_deref()),
        content_range,
        data,
    ))
}

fn maybe_decrypt(data: Bytes, key: &str, iv: &str) -> Result<Bytes> {
    if key.is_empty() {
        return Ok(data);
    }
    match decrypt_segment(&data, key, iv) {
        Ok(decrypted) => Ok(Bytes::from(decrypted)),
        Err(e) => {
            error!("error decrypting segment: {}", e);
            Err(e)
        }
    }
}

fn segment_response(
    status: StatusCode,
    content_type: String,
    content_range: Option<HeaderValue>,
    data: Bytes,
) -> Response {
    let mut response = (status, Body::from(data)).into_response();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(content_range) = content_range {
        response
            .headers_mut()
            .insert(header::CONTENT_RANGE, content_range);
    }
    response
}

/// The upstream's Content-Type passes through verbatim when present;
/// otherwise the type is inferred from the segment name's suffix.
fn content_type_for(name: &str, upstream: Option<&str>) -> String {
    if let Some(upstream) = upstream {
        if !upstream.is_empty() {
            return upstream.to_string();
        }
    }

    let name = name.to_lowercase();
    let inferred = if name.ends_with(".aac") {
        "audio/aac"
    } else if name.ends_with(".m4a") {
        "audio/mp4"
    } else if name.ends_with(".m4s") || name.ends_with(".mp4") || name.ends_with(".m4v") {
        "video/mp4"
    } else if name.ends_with(".mp3") {
        "audio/mpeg"
    } else if name.ends_with(".m3u8") || name.ends_with(".m3u") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    };
    inferred.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_suffix() {
        assert_eq!(content_type_for("http://o/a.aac", None), "audio/aac");
        assert_eq!(content_type_for("http://o/a.m4a", None), "audio/mp4");
        assert_eq!(content_type_for("http://o/a.m4s", None), "video/mp4");
        assert_eq!(content_type_for("http://o/a.mp4", None), "video/mp4");
        assert_eq!(content_type_for("http://o/a.m4v", None), "video/mp4");
        assert_eq!(content_type_for("http://o/a.mp3", None), "audio/mpeg");
        assert_eq!(
            content_type_for("http://o/a.m3u8", None),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for("http://o/a.ts", None), "video/mp2t");
        assert_eq!(content_type_for("http://o/a", None), "video/mp2t");
    }

    #[test]
    fn suffix_matching_is_case_insensitive() {
        assert_eq!(content_type_for("http://o/A.AAC", None), "audio/aac");
        assert_eq!(content_type_for("http://o/A.TS", None), "video/mp2t");
    }

    #[test]
    fn upstream_content_type_passes_through() {
        assert_eq!(
            content_type_for("http://o/a.ts", Some("video/mp4")),
            "video/mp4"
        );
        assert_eq!(
            content_type_for("http://o/a.ts", Some("application/octet-stream")),
            "application/octet-stream"
        );
        // An empty upstream header falls back to suffix inference.
        assert_eq!(content_type_for("http://o/a.aac", Some("")), "audio/aac");
    }
}
