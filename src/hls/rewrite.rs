//! Manifest rewriting.
//!
//! The rewriter walks an upstream playlist line by line and emits a copy in
//! which every variant, segment, and key URI points back through the proxy
//! as a base64 token. Media playlists additionally run through the
//! per-playlist [`ManifestHistory`](crate::hls::history::ManifestHistory),
//! which pins sequence numbers across refreshes so the emitted
//! `#EXT-X-MEDIA-SEQUENCE` is monotonic even when the origin's window
//! slides or its numbering resets.
//!
//! Only a documented subset of tags is interpreted. Playlist-level tags are
//! re-emitted at the top in upstream order; anything unrecognised between
//! segments is buffered and flushed with the next segment URI.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use url::Url;

use crate::config::Config;
use crate::error::{RelayrError, Result};
use crate::hls::history::{HistoryRegistry, ManifestHistory, ManifestSegment};
use crate::hls::prefetch::Prefetcher;
use crate::http_retry::{execute_retry_clip_request, RetryConfig};
use crate::token::Input;

static URI_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)URI=["']([^"']+)["']"#).expect("URI attribute pattern is valid")
});

/// Process-wide fallback for playlist IDs when a manifest arrives with
/// neither an encoded token nor a usable URL.
static PLAYLIST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything the rewriter needs from the surrounding request.
pub struct RewriteContext<'a> {
    pub config: &'a Config,
    pub client: &'a reqwest::Client,
    pub histories: &'a HistoryRegistry,
    pub prefetcher: &'a Prefetcher,
    pub input: &'a Input,
    /// Host header of the incoming request, used when no host is configured.
    pub request_host: &'a str,
}

/// Rewrite an upstream playlist.
///
/// `final_url` must be the upstream URL after redirects; relative URIs in
/// the playlist resolve against its parent directory.
///
/// # Errors
///
/// Returns [`RelayrError::BadRequest`] for malformed tags and
/// upstream/decryption errors when key fetching is enabled.
pub async fn rewrite_playlist(
    ctx: &RewriteContext<'_>,
    body: &str,
    final_url: &Url,
) -> Result<String> {
    let proxy_base = proxy_base_url(ctx.config, ctx.request_host);
    let parent_url = parent_of(final_url);

    if body.contains("RESOLUTION=") {
        return Ok(rewrite_master_playlist(
            body,
            &parent_url,
            ctx.input,
            &proxy_base,
        ));
    }

    rewrite_media_playlist(ctx, body, &parent_url, &proxy_base).await
}

/// Rewrite a master playlist: variant URIs become proxy tokens and
/// `#EXT-X-MEDIA` rendition URIs are rewritten in place.
fn rewrite_master_playlist(body: &str, parent_url: &str, input: &Input, proxy_base: &str) -> String {
    let mut out = String::with_capacity(body.len());

    for line in body.trim_end_matches('\n').split('\n') {
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if line.starts_with("#EXT-X-MEDIA") {
                out.push_str(&rewrite_uri_attribute(line, parent_url, input, proxy_base));
            } else {
                out.push_str(line);
            }
            out.push('\n');
            continue;
        }

        if line.trim().is_empty() {
            continue;
        }

        out.push_str(proxy_base);
        out.push_str(&proxy_token(line, parent_url, input));
        out.push('\n');
    }

    out
}

async fn rewrite_media_playlist(
    ctx: &RewriteContext<'_>,
    body: &str,
    parent_url: &str,
    proxy_base: &str,
) -> Result<String> {
    let manifest_key = if !ctx.input.encoded.is_empty() {
        ctx.input.encoded.as_str()
    } else {
        ctx.input.url.as_str()
    };
    let history = ctx.histories.get_or_create(manifest_key);

    let mut header_lines: Vec<String> = Vec::new();
    let mut media_sequence_index: Option<usize> = None;
    let mut segment_tags: Vec<String> = Vec::new();
    let mut new_segments: Vec<ManifestSegment> = Vec::new();
    let mut decryption_key = String::new();
    let mut has_sequence = false;
    let mut current_sequence: u64 = 0;
    let mut current_iv: u64 = 0;
    let mut end_list = false;

    for line in body.trim_end_matches('\n').split('\n') {
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if line.starts_with("#EXT-X-ENDLIST") {
                end_list = true;
            } else if line.starts_with("#EXT-X-MEDIA-SEQUENCE") {
                let (_, value) = line.split_once(':').ok_or_else(|| {
                    RelayrError::BadRequest("invalid #EXT-X-MEDIA-SEQUENCE tag".to_string())
                })?;
                let sequence: u64 = value.trim().parse().map_err(|_| {
                    RelayrError::BadRequest("invalid #EXT-X-MEDIA-SEQUENCE tag".to_string())
                })?;
                current_sequence = sequence;
                current_iv = sequence;
                has_sequence = true;
                header_lines.push(line.to_string());
                media_sequence_index = Some(header_lines.len() - 1);
            } else if line.starts_with("#EXT-X-KEY") {
                if ctx.config.decrypt {
                    decryption_key = fetch_decryption_key(ctx, line, parent_url).await?;
                } else {
                    segment_tags.push(rewrite_uri_attribute(
                        line,
                        parent_url,
                        ctx.input,
                        proxy_base,
                    ));
                }
            } else if line.starts_with("#EXTM3U") {
                // Emission always writes exactly one #EXTM3U first.
            } else if is_playlist_header(line) {
                header_lines.push(line.to_string());
            } else {
                segment_tags.push(line.to_string());
            }
            continue;
        }

        if !has_sequence {
            current_sequence = new_segments.len() as u64;
            current_iv = current_sequence;
            has_sequence = true;
        }

        new_segments.push(ManifestSegment {
            sequence: current_sequence,
            tags: std::mem::take(&mut segment_tags),
            line: line.to_string(),
            clip_url: resolve_url(line, parent_url),
            has_key: !decryption_key.is_empty(),
            decryption_key: decryption_key.clone(),
            iv: current_iv,
        });

        // The implicit IV tracks the media sequence, but only advances while
        // a key is active; unencrypted runs hold it steady.
        if !decryption_key.is_empty() {
            current_iv += 1;
        }
        current_sequence += 1;
    }

    let combined = history.merge(new_segments, ctx.config.segments);
    let playlist_id = derive_playlist_id(&history, manifest_key);
    let pid_param: String =
        url::form_urlencoded::byte_serialize(playlist_id.as_bytes()).collect();

    if let Some(first) = combined.first() {
        let sequence_line = format!("#EXT-X-MEDIA-SEQUENCE:{}", first.sequence);
        match media_sequence_index {
            Some(index) => header_lines[index] = sequence_line,
            None => header_lines.insert(0, sequence_line),
        }
    }

    let mut out = String::with_capacity(body.len());
    out.push_str("#EXTM3U\n");
    for header in &header_lines {
        if header.is_empty() {
            continue;
        }
        out.push_str(header);
        out.push('\n');
    }

    let mut clip_urls = Vec::with_capacity(combined.len());
    for entry in &combined {
        clip_urls.push(entry.clip_url.clone());

        for tag in &entry.tags {
            if tag.is_empty() {
                continue;
            }
            out.push_str(tag);
            out.push('\n');
        }

        out.push_str(proxy_base);
        out.push_str(&encode_proxy_ref(&entry.clip_url, ctx.input));
        out.push_str("?pId=");
        out.push_str(&pid_param);
        if entry.has_key {
            out.push_str("&key=");
            out.push_str(&entry.decryption_key);
            out.push_str("&iv=");
            out.push_str(&entry.iv.to_string());
        }
        out.push('\n');
    }

    if end_list {
        out.push_str("#EXT-X-ENDLIST\n");
    }

    ctx.prefetcher.add_playlist_to_cache(&playlist_id, clip_urls);
    if ctx.config.segment_background_fetch {
        ctx.prefetcher.warm_playlist(&playlist_id);
    }

    Ok(out)
}

/// Fetch the key body referenced by an `#EXT-X-KEY` tag and return it
/// URL-safe-base64 encoded for embedding in segment URLs.
async fn fetch_decryption_key(
    ctx: &RewriteContext<'_>,
    line: &str,
    parent_url: &str,
) -> Result<String> {
    let key_url = embedded_uri(line, parent_url)
        .ok_or_else(|| RelayrError::BadRequest("missing key URI".to_string()))?;

    let retry = RetryConfig::request(ctx.config);
    let body =
        execute_retry_clip_request(ctx.client, &key_url, HeaderMap::new(), &retry).await?;
    Ok(URL_SAFE.encode(body))
}

/// Rewrite the `URI="..."` attribute of a tag to a proxy token, leaving the
/// rest of the tag untouched. Tags without a URI attribute pass through.
fn rewrite_uri_attribute(line: &str, parent_url: &str, input: &Input, proxy_base: &str) -> String {
    let Some(captures) = URI_ATTR.captures(line) else {
        return line.to_string();
    };
    let original = captures.get(1).map_or("", |m| m.as_str());
    if original.is_empty() {
        return line.to_string();
    }

    let proxied = format!("{}{}", proxy_base, proxy_token(original, parent_url, input));
    line.replacen(original, &proxied, 1)
}

/// The resolved URI inside a tag's `URI` attribute, if one is present.
fn embedded_uri(line: &str, parent_url: &str) -> Option<String> {
    let captures = URI_ATTR.captures(line)?;
    let uri = captures.get(1)?.as_str();
    Some(resolve_url(uri, parent_url))
}

/// Resolve a playlist reference, then encode it as a proxy token carrying
/// the request's referer and origin.
fn proxy_token(reference: &str, parent_url: &str, input: &Input) -> String {
    encode_proxy_ref(&resolve_url(reference, parent_url), input)
}

/// Base64 for `resolved-url[|referer][|origin]`.
fn encode_proxy_ref(resolved: &str, input: &Input) -> String {
    let mut payload = resolved.to_string();
    if let Some(referer) = &input.referer {
        payload.push('|');
        payload.push_str(referer);
    }
    if let Some(origin) = &input.origin {
        payload.push('|');
        payload.push_str(origin);
    }
    STANDARD.encode(payload)
}

/// Absolute references pass through; anything else joins the parent URL.
fn resolve_url(reference: &str, parent_url: &str) -> String {
    if is_absolute_url(reference) {
        reference.to_string()
    } else {
        join_url(parent_url, reference)
    }
}

/// Plain string join, deliberately not an RFC 3986 resolver.
fn join_url(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    if base.is_empty() {
        return rel.to_string();
    }
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{base}/{rel}")
}

fn is_absolute_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Parent directory of the upstream manifest's final URL, with query and
/// fragment cleared and no trailing slash.
fn parent_of(final_url: &Url) -> String {
    let mut url = final_url.clone();
    url.set_query(None);
    url.set_fragment(None);

    let parent = match url.path().rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => url.path()[..index].to_string(),
    };
    url.set_path(&parent);

    url.to_string().trim_end_matches('/').to_string()
}

/// The proxy's advertised base URL, ending in `/`.
///
/// An unset or wildcard configured host falls back to the incoming
/// request's Host header; the scheme follows the `https` option.
fn proxy_base_url(config: &Config, request_host: &str) -> String {
    let host = resolve_proxy_host(&config.host, request_host);
    if config.https {
        format!("https://{host}/")
    } else {
        format!("http://{host}/")
    }
}

fn resolve_proxy_host<'a>(configured: &'a str, request_host: &'a str) -> &'a str {
    let configured = configured.trim();
    let wildcard = configured.is_empty() || configured == "0.0.0.0" || configured == "[::]";
    if wildcard && !request_host.is_empty() {
        request_host
    } else {
        configured
    }
}

fn derive_playlist_id(history: &ManifestHistory, manifest_key: &str) -> String {
    let current = history.current_playlist_id();
    if !current.is_empty() {
        return current;
    }

    let seed = if manifest_key.is_empty() {
        PLAYLIST_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
    } else {
        manifest_key.to_string()
    };

    history.ensure_playlist_id(&seed)
}

/// Playlist-level tags that are hoisted to the top of the emitted manifest.
fn is_playlist_header(line: &str) -> bool {
    line.starts_with("#EXTM3U")
        || line.starts_with("#EXT-X-VERSION")
        || line.starts_with("#EXT-X-TARGETDURATION")
        || line.starts_with("#EXT-X-PLAYLIST-TYPE")
        || line.starts_with("#EXT-X-INDEPENDENT-SEGMENTS")
        || line.starts_with("#EXT-X-SERVER-CONTROL")
        || line.starts_with("#EXT-X-ALLOW-CACHE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use reqwest::Client;

    fn test_config(extra: &[&str]) -> Config {
        let mut args = vec![
            "relayr",
            "--host",
            "proxy.test:9000",
            "--segment-cache",
            "false",
            "--segment-idle-enabled",
            "false",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    struct Fixture {
        config: Config,
        client: Client,
        histories: HistoryRegistry,
        prefetcher: Prefetcher,
        input: Input,
    }

    impl Fixture {
        fn new(extra: &[&str]) -> Self {
            let config = test_config(extra);
            let client = Client::new();
            let histories = HistoryRegistry::new();
            let prefetcher = Prefetcher::new(client.clone(), histories.clone(), &config);
            let token = Input::encode("http://origin.test/live/media.m3u8", None, None);
            let input = Input::parse(&token).unwrap();
            Self {
                config,
                client,
                histories,
                prefetcher,
                input,
            }
        }

        fn ctx(&self) -> RewriteContext<'_> {
            RewriteContext {
                config: &self.config,
                client: &self.client,
                histories: &self.histories,
                prefetcher: &self.prefetcher,
                input: &self.input,
                request_host: "fallback.test:1323",
            }
        }

        async fn rewrite(&self, body: &str) -> Result<String> {
            let final_url = Url::parse("http://origin.test/live/media.m3u8").unwrap();
            rewrite_playlist(&self.ctx(), body, &final_url).await
        }
    }

    fn decode(token: &str) -> String {
        String::from_utf8(STANDARD.decode(token).unwrap()).unwrap()
    }

    // ── URL helpers ─────────────────────────────────────────────────────────

    #[test]
    fn join_url_trims_boundary_slashes() {
        assert_eq!(join_url("http://o/p/", "/a.ts"), "http://o/p/a.ts");
        assert_eq!(join_url("http://o/p", "a.ts"), "http://o/p/a.ts");
        assert_eq!(join_url("", "a.ts"), "a.ts");
        assert_eq!(join_url("http://o", ""), "http://o");
    }

    #[test]
    fn resolve_url_keeps_absolute_references() {
        assert_eq!(
            resolve_url("https://cdn.test/x.ts", "http://o/p"),
            "https://cdn.test/x.ts"
        );
        assert_eq!(resolve_url("x.ts", "http://o/p"), "http://o/p/x.ts");
    }

    #[test]
    fn parent_of_strips_file_query_and_fragment() {
        let url = Url::parse("http://o/live/hd/media.m3u8?token=t#frag").unwrap();
        assert_eq!(parent_of(&url), "http://o/live/hd");

        let root = Url::parse("http://o/media.m3u8").unwrap();
        assert_eq!(parent_of(&root), "http://o");
    }

    #[test]
    fn proxy_host_falls_back_on_wildcards() {
        assert_eq!(resolve_proxy_host("h:80", "req:90"), "h:80");
        assert_eq!(resolve_proxy_host("", "req:90"), "req:90");
        assert_eq!(resolve_proxy_host("0.0.0.0", "req:90"), "req:90");
        assert_eq!(resolve_proxy_host("[::]", "req:90"), "req:90");
        assert_eq!(resolve_proxy_host("", ""), "");
    }

    #[test]
    fn playlist_headers_match_documented_subset() {
        assert!(is_playlist_header("#EXT-X-VERSION:3"));
        assert!(is_playlist_header("#EXT-X-TARGETDURATION:4"));
        assert!(is_playlist_header("#EXT-X-SERVER-CONTROL:CAN-SKIP-UNTIL=12"));
        assert!(!is_playlist_header("#EXTINF:4.0,"));
        assert!(!is_playlist_header("#EXT-X-BYTERANGE:100@0"));
    }

    // ── URI attribute rewriting ─────────────────────────────────────────────

    #[test]
    fn uri_attribute_is_rewritten_in_place() {
        let input = Input {
            url: "http://o/p/m.m3u8".to_string(),
            ..Input::default()
        };
        let line = r#"#EXT-X-MEDIA:TYPE=AUDIO,URI="audio/en.m3u8",NAME="en""#;
        let rewritten = rewrite_uri_attribute(line, "http://o/p", &input, "http://h/");

        assert!(rewritten.starts_with(r#"#EXT-X-MEDIA:TYPE=AUDIO,URI="http://h/"#));
        assert!(rewritten.ends_with(r#"",NAME="en""#));

        let token = rewritten
            .split("http://h/")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap();
        assert_eq!(decode(token), "http://o/p/audio/en.m3u8");
    }

    #[test]
    fn uri_attribute_supports_single_quotes_and_case() {
        let input = Input::default();
        let line = "#EXT-X-KEY:METHOD=AES-128,uri='k.bin'";
        let rewritten = rewrite_uri_attribute(line, "http://o/p", &input, "http://h/");
        assert!(rewritten.contains("http://h/"));
    }

    #[test]
    fn tags_without_uri_pass_through() {
        let input = Input::default();
        let line = "#EXT-X-DISCONTINUITY";
        assert_eq!(
            rewrite_uri_attribute(line, "http://o/p", &input, "http://h/"),
            line
        );
    }

    #[test]
    fn token_carries_referer_and_origin() {
        let input = Input {
            url: "http://o/p/m.m3u8".to_string(),
            referer: Some("http://r.test/".to_string()),
            origin: Some("http://r.test".to_string()),
            ..Input::default()
        };
        let token = proxy_token("seg.ts", "http://o/p", &input);
        assert_eq!(decode(&token), "http://o/p/seg.ts|http://r.test/|http://r.test");
    }

    // ── Master playlists ────────────────────────────────────────────────────

    #[tokio::test]
    async fn master_rewrite_matches_expected_token() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1x1\nvar.m3u8\n";
        let final_url = Url::parse("http://o/p/master.m3u8").unwrap();
        let out = rewrite_playlist(&fixture.ctx(), body, &final_url)
            .await
            .unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1x1");
        let expected = format!(
            "http://proxy.test:9000/{}",
            STANDARD.encode("http://o/p/var.m3u8")
        );
        assert_eq!(lines[2], expected);
    }

    #[tokio::test]
    async fn master_rewrite_keeps_comments_verbatim() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXT-X-INDEPENDENT-SEGMENTS\n#EXT-X-STREAM-INF:RESOLUTION=1x1\nhttp://cdn.test/v.m3u8\n";
        let final_url = Url::parse("http://o/p/master.m3u8").unwrap();
        let out = rewrite_playlist(&fixture.ctx(), body, &final_url)
            .await
            .unwrap();

        assert!(out.contains("#EXT-X-INDEPENDENT-SEGMENTS\n"));
        // Absolute variant URLs are encoded as-is.
        let token = out
            .lines()
            .last()
            .unwrap()
            .strip_prefix("http://proxy.test:9000/")
            .unwrap();
        assert_eq!(decode(token), "http://cdn.test/v.m3u8");
    }

    // ── Media playlists ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn media_rewrite_fresh_history() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n";
        let out = fixture.rewrite(body).await.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-MEDIA-SEQUENCE:0");
        assert_eq!(lines[2], "#EXT-X-TARGETDURATION:4");
        assert_eq!(lines[3], "#EXTINF:4.0,");
        assert!(lines[4].starts_with("http://proxy.test:9000/"));
        assert!(lines[4].contains("?pId="));
        assert_eq!(lines[5], "#EXTINF:4.0,");
        assert!(lines[6].starts_with("http://proxy.test:9000/"));

        let token = lines[4]
            .strip_prefix("http://proxy.test:9000/")
            .unwrap()
            .split('?')
            .next()
            .unwrap();
        assert_eq!(decode(token), "http://origin.test/live/a.ts");
    }

    #[tokio::test]
    async fn emitted_playlist_has_single_extm3u() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\na.ts\n";
        let out = fixture.rewrite(body).await.unwrap();
        assert_eq!(out.matches("#EXTM3U").count(), 1);
    }

    #[tokio::test]
    async fn sliding_window_keeps_sequences_monotonic() {
        let fixture = Fixture::new(&["--segments", "3"]);

        let refreshes = [
            "#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n#EXTINF:4.0,\nc.ts\n",
            "#EXTM3U\n#EXTINF:4.0,\nb.ts\n#EXTINF:4.0,\nc.ts\n#EXTINF:4.0,\nd.ts\n",
            "#EXTM3U\n#EXTINF:4.0,\nc.ts\n#EXTINF:4.0,\nd.ts\n#EXTINF:4.0,\ne.ts\n",
        ];

        let mut media_sequences = Vec::new();
        let mut b_tokens = Vec::new();
        for refresh in refreshes {
            let out = fixture.rewrite(refresh).await.unwrap();
            let sequence = out
                .lines()
                .find_map(|l| l.strip_prefix("#EXT-X-MEDIA-SEQUENCE:"))
                .unwrap()
                .parse::<u64>()
                .unwrap();
            media_sequences.push(sequence);

            if let Some(line) = out.lines().find(|l| {
                !l.starts_with('#')
                    && l.strip_prefix("http://proxy.test:9000/")
                        .map(|rest| decode(rest.split('?').next().unwrap()).ends_with("/b.ts"))
                        .unwrap_or(false)
            }) {
                b_tokens.push(line.to_string());
            }
        }

        assert_eq!(media_sequences, vec![0, 1, 2]);
        // The same clip keeps the same emitted URL across refreshes.
        assert_eq!(b_tokens.len(), 2);
        assert_eq!(b_tokens[0], b_tokens[1]);
    }

    #[tokio::test]
    async fn upstream_media_sequence_is_overwritten_in_place() {
        let fixture = Fixture::new(&[]);
        // The history assigns its own numbering from zero; the upstream value
        // only seeds the implicit IV. The tag keeps its position among the
        // headers but carries the history's sequence.
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-MEDIA-SEQUENCE:17\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\na.ts\n";
        let out = fixture.rewrite(body).await.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[2], "#EXT-X-MEDIA-SEQUENCE:0");
        assert_eq!(lines[3], "#EXT-X-TARGETDURATION:4");
    }

    #[tokio::test]
    async fn upstream_sequence_reset_does_not_regress_output() {
        let fixture = Fixture::new(&[]);
        fixture
            .rewrite("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:50\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n")
            .await
            .unwrap();
        // Origin resets its numbering; the proxy keeps counting.
        let out = fixture
            .rewrite("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.0,\nb.ts\n#EXTINF:4.0,\nc.ts\n")
            .await
            .unwrap();
        assert!(
            out.contains("#EXT-X-MEDIA-SEQUENCE:0\n"),
            "first emitted clip is a.ts with sequence 0: {out}"
        );
        let sequences: Vec<&str> = out
            .lines()
            .filter(|l| l.starts_with("#EXT-X-MEDIA-SEQUENCE"))
            .collect();
        assert_eq!(sequences.len(), 1);
    }

    #[tokio::test]
    async fn malformed_media_sequence_is_rejected() {
        let fixture = Fixture::new(&[]);
        let bad_tag = fixture.rewrite("#EXT-X-MEDIA-SEQUENCE\na.ts\n").await;
        assert!(matches!(bad_tag, Err(RelayrError::BadRequest(_))));

        let bad_value = fixture.rewrite("#EXT-X-MEDIA-SEQUENCE:soon\na.ts\n").await;
        assert!(matches!(bad_value, Err(RelayrError::BadRequest(_))));
    }

    #[tokio::test]
    async fn endlist_is_preserved_at_the_end() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXT-X-ENDLIST\n";
        let out = fixture.rewrite(body).await.unwrap();
        assert!(out.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn unrecognised_tags_buffer_with_next_segment() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXTINF:4.0,\n#EXT-X-BITRATE:1200\na.ts\n#EXTINF:4.0,\nb.ts\n";
        let out = fixture.rewrite(body).await.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        let bitrate = lines.iter().position(|l| *l == "#EXT-X-BITRATE:1200").unwrap();
        assert!(
            lines[bitrate + 1].starts_with("http://proxy.test:9000/"),
            "buffered tag must flush right before its segment"
        );
    }

    #[tokio::test]
    async fn key_tag_is_proxied_when_decrypt_disabled() {
        let fixture = Fixture::new(&[]);
        let body = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n";
        let out = fixture.rewrite(body).await.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        let key_line = lines
            .iter()
            .find(|l| l.starts_with("#EXT-X-KEY"))
            .expect("key tag must be emitted");
        assert!(
            key_line.contains("URI=\"http://proxy.test:9000/"),
            "key URI must point at the proxy: {key_line}"
        );

        // The rewritten key tag is buffered as a segment tag: it appears
        // after the headers and before the first segment URL.
        let key_index = lines.iter().position(|l| l.starts_with("#EXT-X-KEY")).unwrap();
        let first_segment = lines
            .iter()
            .position(|l| l.starts_with("http://proxy.test:9000/"))
            .unwrap();
        assert!(key_index < first_segment);

        // Decrypt mode is off, so no key/iv query parameters are emitted.
        assert!(!out.contains("&key="));
        assert!(!out.contains("&iv="));
    }

    #[tokio::test]
    async fn playlist_id_is_stable_across_refreshes() {
        let fixture = Fixture::new(&[]);
        let first = fixture.rewrite("#EXTM3U\n#EXTINF:4.0,\na.ts\n").await.unwrap();
        let second = fixture.rewrite("#EXTM3U\n#EXTINF:4.0,\nb.ts\n").await.unwrap();

        let pid = |out: &str| {
            out.lines()
                .find(|l| l.contains("?pId="))
                .unwrap()
                .split("?pId=")
                .nth(1)
                .unwrap()
                .to_string()
        };
        assert_eq!(pid(&first), pid(&second));

        // The pId parameter is the escaped form of the manifest token.
        let query = format!("pId={}", pid(&first));
        let (_, decoded) = url::form_urlencoded::parse(query.as_bytes())
            .next()
            .unwrap();
        assert_eq!(decoded, fixture.input.encoded);
    }

    #[tokio::test]
    async fn rewrite_registers_window_with_prefetcher() {
        let fixture = Fixture::new(&[]);
        fixture
            .rewrite("#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n")
            .await
            .unwrap();
        assert!(fixture.prefetcher.has_playlist(&fixture.input.encoded));
    }

    #[tokio::test]
    async fn wildcard_host_uses_request_host() {
        let fixture = {
            let mut f = Fixture::new(&[]);
            f.config.host = "0.0.0.0".to_string();
            f
        };
        let out = fixture.rewrite("#EXTM3U\n#EXTINF:4.0,\na.ts\n").await.unwrap();
        assert!(out.contains("http://fallback.test:1323/"));
    }

    #[tokio::test]
    async fn https_option_switches_scheme() {
        let fixture = Fixture::new(&["--https", "true"]);
        let out = fixture.rewrite("#EXTM3U\n#EXTINF:4.0,\na.ts\n").await.unwrap();
        assert!(out.contains("https://proxy.test:9000/"));
    }
}
