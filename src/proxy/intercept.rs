//! Request decoration and response observation.
//!
//! Neither function touches the network or the store. The proxy feeds them
//! a cookie snapshot on the way out and upserts whatever they return on the
//! way back.

use crate::cookies::CapturedCookie;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderValue, Request, Response};
use std::collections::HashSet;
use time::OffsetDateTime;

/// Whether `host` (optionally with a port) is `domain` or one of its
/// subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host
            .split_once(']')
            .map(|(addr, _)| addr.trim_start_matches('['))
            .unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Merge `cookies` into the `Cookie` header of a request bound for `host`.
///
/// Only requests toward `target_domain` are touched. Cookies whose name the
/// browser already sent are skipped.
pub fn decorate_request<B>(
    cookies: &[CapturedCookie],
    target_domain: &str,
    host: &str,
    mut request: Request<B>,
) -> Request<B> {
    if cookies.is_empty() || !host_matches(host, target_domain) {
        return request;
    }

    let headers = request.headers_mut();
    let existing: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    let present: HashSet<&str> = existing
        .iter()
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.split_once('=').map(|(name, _)| name.trim()))
        .collect();

    let mut seen = HashSet::new();
    let added: Vec<String> = cookies
        .iter()
        .filter(|c| !present.contains(c.name.as_str()) && seen.insert(c.name.as_str()))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    if added.is_empty() {
        return request;
    }

    let mut merged = existing.join("; ");
    for pair in added {
        if !merged.is_empty() {
            merged.push_str("; ");
        }
        merged.push_str(&pair);
    }
    match HeaderValue::from_str(&merged) {
        Ok(value) => {
            headers.insert(COOKIE, value);
        }
        Err(e) => tracing::debug!(host = %host, error = %e, "merged Cookie header rejected"),
    }
    request
}

/// Cookies set by a third-party response from `host`.
///
/// Responses from the target domain itself yield nothing.
pub fn observe_response<B>(
    target_domain: &str,
    host: &str,
    response: &Response<B>,
    now: OffsetDateTime,
) -> Vec<CapturedCookie> {
    if host_matches(host, target_domain) {
        return Vec::new();
    }
    let host = strip_port(host);
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|line| CapturedCookie::from_set_cookie(line, host, now))
        .collect()
}
