//! Request-token decoding.
//!
//! Every proxied resource is addressed by a base64 path token that decodes
//! to `URL[|REFERER[|ORIGIN]]`. Players sometimes append `.ts` or a
//! trailing slash to the token, so those suffixes are stripped before
//! decoding. The cleaned base64 string is kept on the [`Input`] because it
//! doubles as the manifest key when no `pId` query parameter is present.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{RelayrError, Result};

/// Decoded request token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Input {
    /// Upstream URL to fetch on behalf of the client.
    pub url: String,
    /// `Referer` header to present to the upstream, when the token carries one.
    pub referer: Option<String>,
    /// `Origin` header to present to the upstream, when the token carries one.
    pub origin: Option<String>,
    /// The cleaned base64 token, stable across requests for the same manifest.
    pub encoded: String,
}

impl Input {
    /// Parse a raw path token into its fields.
    ///
    /// # Errors
    ///
    /// Returns [`RelayrError::BadRequest`] when the base64 is invalid, the
    /// decoded payload is not UTF-8, or the URL field is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut cleaned = raw.trim().trim_end_matches('/');
        cleaned = cleaned.strip_suffix(".ts").unwrap_or(cleaned);
        let cleaned = cleaned.trim_end_matches('/');

        let decoded = STANDARD
            .decode(cleaned)
            .map_err(|_| RelayrError::BadRequest("invalid base64 input".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| RelayrError::BadRequest("token is not valid UTF-8".to_string()))?;

        let mut parts = decoded.split('|').map(str::trim);

        let url = parts.next().unwrap_or("").to_string();
        if url.is_empty() {
            return Err(RelayrError::BadRequest("empty input".to_string()));
        }

        let referer = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let origin = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Input {
            url,
            referer,
            origin,
            encoded: cleaned.to_string(),
        })
    }

    /// Encode `url[|referer[|origin]]` the way [`Input::parse`] expects it.
    pub fn encode(url: &str, referer: Option<&str>, origin: Option<&str>) -> String {
        let mut payload = url.to_string();
        if let Some(referer) = referer {
            payload.push('|');
            payload.push_str(referer);
        }
        if let Some(origin) = origin {
            payload.push('|');
            payload.push_str(origin);
        }
        STANDARD.encode(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_url() {
        let token = Input::encode("https://cdn.example.com/live.m3u8", None, None);
        let input = Input::parse(&token).unwrap();
        assert_eq!(input.url, "https://cdn.example.com/live.m3u8");
        assert_eq!(input.referer, None);
        assert_eq!(input.origin, None);
        assert_eq!(input.encoded, token);
    }

    #[test]
    fn decodes_referer_and_origin() {
        let token = Input::encode(
            "https://cdn.example.com/seg.ts",
            Some("https://player.example.com/"),
            Some("https://player.example.com"),
        );
        let input = Input::parse(&token).unwrap();
        assert_eq!(input.url, "https://cdn.example.com/seg.ts");
        assert_eq!(input.referer.as_deref(), Some("https://player.example.com/"));
        assert_eq!(input.origin.as_deref(), Some("https://player.example.com"));
    }

    #[test]
    fn round_trip_survives_ts_and_slash_suffixes() {
        let token = Input::encode(
            "https://cdn.example.com/seg.ts",
            Some("https://r.example.com"),
            None,
        );
        let plain = Input::parse(&token).unwrap();

        for suffix in [".ts", "/", ".ts/", "//", ".ts//"] {
            let suffixed = format!("{token}{suffix}");
            let input = Input::parse(&suffixed).unwrap();
            assert_eq!(input, plain, "suffix {suffix:?} should be stripped");
        }
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let token = Input::encode("https://cdn.example.com/live.m3u8", None, None);
        let input = Input::parse(&format!("  {token}  ")).unwrap();
        assert_eq!(input.url, "https://cdn.example.com/live.m3u8");
    }

    #[test]
    fn trims_fields_inside_token() {
        let token = STANDARD.encode("  https://cdn.example.com/a.ts  |  ref  ");
        let input = Input::parse(&token).unwrap();
        assert_eq!(input.url, "https://cdn.example.com/a.ts");
        assert_eq!(input.referer.as_deref(), Some("ref"));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            Input::parse("not-base64!!!"),
            Err(RelayrError::BadRequest(_))
        ));
    }

    #[test]
    fn rejects_empty_payload() {
        let token = STANDARD.encode("");
        assert!(matches!(
            Input::parse(&token),
            Err(RelayrError::BadRequest(_))
        ));
    }

    #[test]
    fn rejects_empty_url_field() {
        let token = STANDARD.encode("  |https://r.example.com");
        assert!(matches!(
            Input::parse(&token),
            Err(RelayrError::BadRequest(_))
        ));
    }

    #[test]
    fn empty_optional_fields_become_none() {
        let token = STANDARD.encode("https://cdn.example.com/a.ts||");
        let input = Input::parse(&token).unwrap();
        assert_eq!(input.referer, None);
        assert_eq!(input.origin, None);
    }
}
