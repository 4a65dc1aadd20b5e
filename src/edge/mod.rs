// src/edge/mod.rs
// Edge filter: first-touch classification of every incoming request.
// Strict ordering: blocklist lookup, bad-agent substring match, header
// heuristics, tarpit rewrite, pass-through. The blocklist lookup fails
// open; everything after it is pure.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::config::Config;
use crate::escalation::RequestMetadata;
use crate::metrics::Metric;
use crate::runtime::Runtime;
use crate::tarpit;

/// Header listing the heuristics that routed a request into the tarpit,
/// semicolon-separated. Attached to the forwarded request metadata.
pub const TARPIT_REASON_HEADER: &str = "x-tarpit-reason";

/// Body served with every edge 403. No internal state is disclosed.
pub const ACCESS_DENIED_BODY: &str = "Access Denied.";

/// Names of the toggleable header heuristics, as they appear in the
/// rewrite reason header.
pub const HEURISTIC_EMPTY_UA: &str = "empty_user_agent";
pub const HEURISTIC_MISSING_ACCEPT_LANGUAGE: &str = "missing_accept_language";
pub const HEURISTIC_GENERIC_ACCEPT: &str = "generic_accept";

/// Middleware wrapped around the public router. Outcomes: 403 short-circuit,
/// pass-through unchanged, or an internal rewrite into the tarpit mount.
pub async fn filter_request(
    State(rt): State<Arc<Runtime>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if path == "/health" {
        return next.run(req).await;
    }
    rt.metrics.incr(Metric::RequestsTotal);

    let remote = addr.map(|ConnectInfo(addr)| addr);
    let ip = match extract_source_ip(req.headers(), remote) {
        Some(ip) => ip,
        None => {
            warn!(path = %path, "no source address on request; passing through unfiltered");
            return next.run(req).await;
        }
    };

    // 1. Blocklist. A state-store failure here must not take down the hot
    // path: log and treat as not blocked.
    let blocked = match rt.state.is_blocked(&ip).await {
        Ok(blocked) => blocked,
        Err(err) => {
            rt.metrics.incr(Metric::StateErrorsTotal);
            warn!(src = %ip, error = %err, "blocklist lookup failed; failing open");
            false
        }
    };
    if blocked {
        rt.metrics.incr(Metric::BlockedTotal);
        return access_denied();
    }

    // 2. Bad-agent substring match.
    let ua = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Some(matched) = agent_block_match(&rt.config, ua) {
        rt.metrics.incr(Metric::BlockedTotal);
        info!(src = %ip, ua = %ua, matched = %matched, "blocked bad agent");
        return access_denied();
    }

    // Requests already under the tarpit mount are served by the mounted
    // route; rewriting them again would double-prefix the path.
    if path == rt.config.tarpit_mount() || path.starts_with(&rt.config.tarpit_rewrite_path) {
        return next.run(req).await;
    }

    // 3. Header heuristics. Tripping any enabled check marks the request
    // for the tarpit, never for a block.
    let tripped = tripped_heuristics(&rt.config, req.headers());
    if tripped.is_empty() {
        return next.run(req).await;
    }

    // 4. Rewrite into the tarpit and serve it in-process.
    rt.metrics.incr(Metric::TarpitRewritesTotal);
    let reason = tripped.join(";");
    let query = req.uri().query().map(|q| q.to_string());
    let rewritten = rewrite_path(rt.config.tarpit_mount(), &path);
    let mut headers = headers_to_map(req.headers());
    headers.insert(TARPIT_REASON_HEADER.to_string(), reason.clone());
    let meta = RequestMetadata::new(
        &ip,
        req.method().as_str(),
        &rewritten,
        query.as_deref(),
        headers,
    );
    info!(src = %ip, path = %path, reasons = %reason, "rewriting request into tarpit");
    tarpit::serve(rt.clone(), meta).await
}

fn access_denied() -> Response {
    (StatusCode::FORBIDDEN, ACCESS_DENIED_BODY).into_response()
}

/// First matching bad-agent substring, case-insensitive.
pub fn agent_block_match<'a>(cfg: &'a Config, user_agent: &str) -> Option<&'a str> {
    if user_agent.is_empty() {
        return None;
    }
    let ua_lower = user_agent.to_ascii_lowercase();
    cfg.known_bad_ua_substrings
        .iter()
        .find(|bad| ua_lower.contains(bad.as_str()))
        .map(|s| s.as_str())
}

/// Enabled header heuristics tripped by this request.
pub fn tripped_heuristics(cfg: &Config, headers: &HeaderMap) -> Vec<&'static str> {
    let mut tripped = Vec::new();

    let ua = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if cfg.check_empty_ua && ua.trim().is_empty() {
        tripped.push(HEURISTIC_EMPTY_UA);
    }
    if cfg.check_missing_accept_language && !headers.contains_key("accept-language") {
        tripped.push(HEURISTIC_MISSING_ACCEPT_LANGUAGE);
    }
    if cfg.check_generic_accept {
        let accept = headers.get("accept").and_then(|v| v.to_str().ok());
        if accept == Some("*/*") {
            tripped.push(HEURISTIC_GENERIC_ACCEPT);
        }
    }
    tripped
}

/// Source-IP precedence: first X-Forwarded-For token, then the transport
/// remote address. IPv4-mapped IPv6 addresses normalize to dotted IPv4.
pub fn extract_source_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() && first != "unknown" {
                return Some(normalize_ip(first));
            }
        }
    }
    remote.map(|addr| normalize_ip(&addr.ip().to_string()))
}

fn normalize_ip(raw: &str) -> String {
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// `{mount without trailing slash}{original path}`; the query string stays
/// on the request.
pub fn rewrite_path(mount: &str, original_path: &str) -> String {
    format!("{}{}", mount, original_path)
}

pub(crate) fn headers_to_map(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
    let mut map = std::collections::BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests;
