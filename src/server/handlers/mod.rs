pub mod health;
pub mod manifest;
pub mod proxy;
pub mod segment;

use crate::config::Config;
use crate::token::Input;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use tracing::warn;

/// Headers presented to the upstream on every fetch: the configured
/// User-Agent plus the Referer/Origin carried by the decoded token.
pub(crate) fn base_headers(input: &Input, config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();

    match HeaderValue::from_str(&config.user_agent) {
        Ok(value) => {
            headers.insert(USER_AGENT, value);
        }
        Err(_) => warn!("configured user agent is not a valid header value"),
    }

    if let Some(referer) = &input.referer {
        if let Ok(value) = HeaderValue::from_str(referer) {
            headers.insert(REFERER, value);
        }
    }
    if let Some(origin) = &input.origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(ORIGIN, value);
        }
    }

    headers
}
