//! Inbox wire conventions: headers, endpoint resolution and token inspection.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine as _};
use chrono::{DateTime, Utc};
use url::Url;

use crate::models::Identity;

/// Header names
pub const HEADER_USER_ID: &str = "X-User-Id";
pub const HEADER_TENANT_ID: &str = "X-Tenant-Id";

/// Path of the realtime endpoint when it is derived from the API base URL.
pub const REALTIME_PATH: &str = "/realtime";

/// Check if a host is a local/development address.
pub fn is_local_address(host: &str) -> bool {
    let host_part = host.split(':').next().unwrap_or(host);
    host_part == "localhost"
        || host_part == "127.0.0.1"
        || host_part == "0.0.0.0"
        || host_part.starts_with("192.168.")
        || host_part.starts_with("10.")
}

/// Turn a bare host (or full URL) into an HTTP base URL without trailing slash.
pub fn base_url_for_host(host: &str) -> String {
    if host.contains("://") {
        return host.trim_end_matches('/').to_string();
    }
    let host = host.trim_end_matches('/');
    if is_local_address(host) {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

/// Convert HTTP/HTTPS URL to WS/WSS
pub fn http_to_ws(url: &str) -> String {
    if url.starts_with("https://") {
        url.replacen("https://", "wss://", 1)
    } else if url.starts_with("http://") {
        url.replacen("http://", "ws://", 1)
    } else {
        url.to_string()
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// Build the URL the realtime channel connects to for `identity`.
///
/// Credentials travel in the query string because browsers cannot set
/// headers on a WebSocket upgrade.
pub fn realtime_connect_url(realtime_base: &str, identity: &Identity) -> Result<String, url::ParseError> {
    let mut url = Url::parse(&http_to_ws(&base_url_for_host(realtime_base)))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("userId", &identity.user_id);
        pairs.append_pair("token", identity.token.as_str());
        if let Some(tenant) = &identity.tenant_id {
            pairs.append_pair("tenantId", tenant);
        }
    }
    Ok(url.into())
}

/// Expiry of a JWT-shaped token, if it carries a numeric `exp` claim.
///
/// The signature is not checked; this only avoids opening sessions with
/// tokens the backend will certainly reject.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _sig) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let decoded = BASE64_URL.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}
