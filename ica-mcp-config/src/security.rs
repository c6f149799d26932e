//! Secure-URL policy for credential endpoints and upstream URLs.
//!
//! Credential exchanges must never travel over plaintext HTTP to a routable
//! host. Plain HTTP is tolerated only for loopback addresses, and only when
//! the caller explicitly opts in (local development flows). PKCE redirect
//! URIs are stricter still: the host must itself be a loopback address.

use crate::error::{ConfigError, Result};
use url::Url;

/// Hosts accepted as loopback for the HTTP carve-out.
///
/// `0.0.0.0` is deliberately absent: it is a bind-all address, not a
/// loopback address, even though it is commonly mistaken for one.
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "::1", "localhost"];

/// Check whether a hostname is in the loopback set.
pub fn is_loopback_host(host: &str) -> bool {
    // url::Url renders IPv6 hosts in bracket form.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    LOOPBACK_HOSTS
        .iter()
        .any(|candidate| host.eq_ignore_ascii_case(candidate))
}

/// Validate a URL that will carry credentials or tool traffic.
///
/// `https` always passes. `http` passes only when `allow_http_loopback` is
/// set and the host is a loopback address. Everything else fails with
/// [`ConfigError::InsecureUrl`]. No network I/O is performed.
pub fn validate_secure_url(url: &str, field: &str, allow_http_loopback: bool) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InsecureUrl {
        field: field.to_string(),
        url: url.to_string(),
        reason: format!("not a valid URL: {}", e),
    })?;

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            if allow_http_loopback && is_loopback_host(host) {
                Ok(parsed)
            } else {
                Err(ConfigError::InsecureUrl {
                    field: field.to_string(),
                    url: url.to_string(),
                    reason: "plain HTTP is only permitted for loopback hosts".to_string(),
                })
            }
        }
        other => Err(ConfigError::InsecureUrl {
            field: field.to_string(),
            url: url.to_string(),
            reason: format!("scheme '{}' is not permitted", other),
        }),
    }
}

/// Validate a PKCE redirect URI.
///
/// The redirect host must be loopback regardless of scheme, so a stolen
/// authorization code cannot be delivered to a remote listener.
pub fn validate_redirect_uri(url: &str, field: &str) -> Result<Url> {
    let parsed = validate_secure_url(url, field, true)?;
    let host = parsed.host_str().unwrap_or_default();
    if !is_loopback_host(host) {
        return Err(ConfigError::InsecureUrl {
            field: field.to_string(),
            url: url.to_string(),
            reason: format!("redirect host '{}' is not a loopback address", host),
        });
    }
    Ok(parsed)
}
