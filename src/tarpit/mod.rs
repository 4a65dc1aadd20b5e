// src/tarpit/mod.rs
// Tarpit engine: serves deterministic fake content slowly to anything the
// edge filter routed here. Side effects per hit, in order: hit log, tarpit
// visit flag, hop-counter increment (overflow blocks via enforcement),
// fire-and-forget metadata post to the escalation engine, then the stream.

pub mod generator;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::edge;
use crate::enforcement;
use crate::escalation::{EscalationDecision, RequestMetadata};
use crate::metrics::Metric;
use crate::runtime::Runtime;

const STREAM_CHANNEL_DEPTH: usize = 8;

/// Route handler for GETs under the tarpit mount.
pub async fn handle(
    State(rt): State<Arc<Runtime>>,
    addr: Option<ConnectInfo<std::net::SocketAddr>>,
    req: Request,
) -> Response {
    let remote = addr.map(|ConnectInfo(addr)| addr);
    let ip = edge::extract_source_ip(req.headers(), remote).unwrap_or_default();
    let query = req.uri().query().map(|q| q.to_string());
    let meta = RequestMetadata::new(
        &ip,
        req.method().as_str(),
        req.uri().path(),
        query.as_deref(),
        edge::headers_to_map(req.headers()),
    );
    serve(rt, meta).await
}

/// Core tarpit entry point, shared by the mounted route and the edge
/// filter's internal rewrite.
pub async fn serve(rt: Arc<Runtime>, meta: RequestMetadata) -> Response {
    rt.metrics.incr(Metric::TarpitHitsTotal);
    info!(src = %meta.source_ip, path = %meta.path, ua = %meta.user_agent, "tarpit hit");
    append_hit_log(&rt, &meta);

    if !meta.source_ip.is_empty() {
        // The visit flag is set before the escalation post goes out; the
        // scorer may rely on seeing it.
        if let Err(err) = rt
            .state
            .flag_tarpit(&meta.source_ip, rt.config.tarpit_flag_ttl_seconds)
            .await
        {
            rt.metrics.incr(Metric::StateErrorsTotal);
            warn!(src = %meta.source_ip, error = %err, "failed to set tarpit flag");
        }

        match rt
            .state
            .incr_hops(&meta.source_ip, rt.config.tarpit_hop_window_seconds)
            .await
        {
            Ok(hops) if rt.config.tarpit_max_hops > 0 && hops > rt.config.tarpit_max_hops as u64 => {
                return block_for_hop_overflow(&rt, &meta, hops).await;
            }
            Ok(hops) => {
                debug!(src = %meta.source_ip, hops, max = rt.config.tarpit_max_hops, "hop count");
            }
            Err(err) => {
                // Hop accounting degrades open: the page still streams,
                // only the overflow block is deferred to a later hit.
                rt.metrics.incr(Metric::StateErrorsTotal);
                warn!(src = %meta.source_ip, error = %err, "hop counter unavailable");
            }
        }

        spawn_escalation_post(&rt, meta.clone());
    }

    stream_page(&rt, &meta).await
}

/// Hop overflow: hand the source to enforcement and refuse to stream.
/// The enforcement module stays the single blocklist writer; the overflow
/// path calls straight into it instead of going over the wire.
async fn block_for_hop_overflow(rt: &Arc<Runtime>, meta: &RequestMetadata, hops: u64) -> Response {
    rt.metrics.incr(Metric::HopLimitBlocksTotal);
    warn!(
        src = %meta.source_ip,
        hops,
        max = rt.config.tarpit_max_hops,
        "tarpit hop limit exceeded; requesting block"
    );
    let decision =
        EscalationDecision::hop_limit(&meta.source_ip, hops, rt.config.tarpit_hop_window_seconds);
    let request = enforcement::EnforcementRequest {
        decision,
        metadata: meta.clone(),
    };
    if let Err(err) = enforcement::handle(rt, &request).await {
        // The block write failed; the 403 below still denies this request
        // and the next hit retries the block.
        warn!(src = %meta.source_ip, error = %err, "hop-overflow enforcement failed");
    }
    (StatusCode::FORBIDDEN, edge::ACCESS_DENIED_BODY).into_response()
}

/// Posts metadata to the escalation endpoint without waiting for the
/// verdict. Failures are logged, never retried.
fn spawn_escalation_post(rt: &Arc<Runtime>, meta: RequestMetadata) {
    let http = rt.http.clone();
    let url = rt.config.escalation_endpoint.clone();
    let timeout = Duration::from_secs_f64(rt.config.escalation_timeout_sec);
    let runtime = Arc::clone(rt);
    tokio::spawn(async move {
        let result = http.post(&url).json(&meta).timeout(timeout).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                runtime.metrics.incr(Metric::UpstreamErrorsTotal);
                warn!(src = %meta.source_ip, status = %resp.status(), "escalation post rejected");
            }
            Err(err) => {
                runtime.metrics.incr(Metric::UpstreamErrorsTotal);
                warn!(src = %meta.source_ip, error = %err, "escalation post failed");
            }
        }
    });
}

/// Generates the page off the async runtime, then streams it line by line
/// with a deliberate per-chunk delay. The response flushes after each
/// chunk; a dropped connection ends the producer quietly.
async fn stream_page(rt: &Arc<Runtime>, meta: &RequestMetadata) -> Response {
    let seed = rt.config.system_seed.clone();
    let path = meta.path.clone();
    let mount = rt.config.tarpit_mount().to_string();
    let markov = rt.markov.clone();

    let generated = tokio::task::spawn_blocking(move || {
        let mut rng = generator::page_rng(&seed, &path);
        let html = generator::generate_page(&mut rng, markov.as_deref(), &mount);
        let chunks: Vec<Bytes> = html
            .split_inclusive('\n')
            .map(|line| Bytes::copy_from_slice(line.as_bytes()))
            .collect();
        (chunks, rng)
    })
    .await;

    let (chunks, mut rng) = match generated {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "tarpit generation task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "").into_response();
        }
    };

    let delays = generator::delay_schedule(
        &mut rng,
        chunks.len(),
        rt.config.tarpit_min_delay_sec,
        rt.config.tarpit_max_delay_sec,
    );

    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::convert::Infallible>>(
        STREAM_CHANNEL_DEPTH,
    );
    tokio::spawn(async move {
        for (chunk, delay) in chunks.into_iter().zip(delays) {
            if tx.send(Ok(chunk)).await.is_err() {
                // Client went away mid-stream. Not an error.
                break;
            }
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate")
        .header("X-Robots-Tag", "noindex, nofollow")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Appends one JSON line per hit to the configured hit log. Best effort;
/// the stream is never held up by logging.
fn append_hit_log(rt: &Arc<Runtime>, meta: &RequestMetadata) {
    let Some(path) = &rt.config.tarpit_hit_log else {
        return;
    };
    let entry = serde_json::json!({
        "timestamp": meta.timestamp_utc.to_rfc3339(),
        "ip": meta.source_ip,
        "user_agent": meta.user_agent,
        "method": meta.method,
        "path": meta.path,
        "query": meta.query,
        "tarpit_reason": meta.header(edge::TARPIT_REASON_HEADER),
    });
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", entry));
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "failed to append tarpit hit log");
    }
}

#[cfg(test)]
mod tests;
