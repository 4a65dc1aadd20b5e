// src/enforcement/mod.rs
// Enforcement service: the single writer of the blocklist. Receives
// verdicts on the internal webhook, inserts the block, optionally reports
// the source to a community blocklist, then fans out alerts. The blocklist
// write happens before any alert dispatch begins.

pub mod alerts;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::escalation::{EscalationDecision, RequestMetadata};
use crate::metrics::Metric;
use crate::runtime::Runtime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementRequest {
    pub decision: EscalationDecision,
    pub metadata: RequestMetadata,
}

/// Internal webhook: accepts a decision plus the original metadata and
/// applies the enforcement effects in order.
pub async fn handle_analyze(
    State(rt): State<Arc<Runtime>>,
    Json(request): Json<EnforcementRequest>,
) -> Response {
    match handle(&rt, &request).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response(),
        Err(err) => {
            error!(src = %request.decision.source_ip, error = %err, "enforcement failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error" })),
            )
                .into_response()
        }
    }
}

/// Enforcement entry point, also called in-process by the tarpit's
/// hop-overflow path. Effect order: block, community report, alerts.
pub async fn handle(rt: &Runtime, request: &EnforcementRequest) -> Result<()> {
    let src = &request.decision.source_ip;
    if src.is_empty() || src == "unknown" {
        warn!(reasons = ?request.decision.reasons, "refusing to block an unknown source");
        return Ok(());
    }

    let reason = request.decision.reasons.join("; ");
    let reason = if reason.is_empty() {
        request.decision.trigger.as_str().to_string()
    } else {
        reason
    };

    // 1. Block. This write fails closed: without it there is nothing worth
    // alerting about.
    rt.state
        .add_block(src, rt.config.blocklist_ttl_seconds, &reason)
        .await?;
    rt.metrics.incr(Metric::BlocklistAddsTotal);
    info!(
        src = %src,
        ttl = rt.config.blocklist_ttl_seconds,
        trigger = request.decision.trigger.as_str(),
        "source blocked"
    );

    // 2. Community report. Optional, never aborts the flow.
    if rt.config.enable_community_reporting {
        report_to_community(rt, request, &reason).await;
    }

    // 3. Alerts, filtered by reason severity.
    alerts::dispatch(rt, request).await;

    Ok(())
}

/// Reports the blocked source to the configured community blocklist.
async fn report_to_community(rt: &Runtime, request: &EnforcementRequest, reason: &str) {
    let Some(url) = &rt.config.community_blocklist_report_url else {
        return;
    };
    let src = &request.decision.source_ip;
    let payload = serde_json::json!({
        "ip": src,
        "categories": community_categories(reason),
        "comment": format!(
            "Automated anti-scraping detection. Reason: {}. UA: {}. Path: {}",
            reason, request.metadata.user_agent, request.metadata.path
        ),
        "timestamp": Utc::now().to_rfc3339(),
    });

    let mut post = rt
        .http
        .post(url)
        .json(&payload)
        .timeout(Duration::from_secs_f64(
            rt.config.community_blocklist_report_timeout,
        ));
    if let Some(key) = &rt.secrets.community_api_key {
        post = post.header("Key", key.as_str());
    }

    match post.send().await {
        Ok(resp) if resp.status().is_success() => {
            rt.metrics.incr(Metric::CommunityReportsTotal);
            info!(src = %src, "reported source to community blocklist");
        }
        Ok(resp) => {
            rt.metrics.incr(Metric::UpstreamErrorsTotal);
            warn!(src = %src, status = %resp.status(), "community report rejected");
        }
        Err(err) => {
            rt.metrics.incr(Metric::UpstreamErrorsTotal);
            warn!(src = %src, error = %err, "community report failed");
        }
    }
}

/// Report category derived from the block reason, following the common
/// community-blocklist taxonomy (port scan / web scraping / bad web bot /
/// generic automated abuse).
pub(crate) fn community_categories(reason: &str) -> &'static str {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("scan") {
        "14"
    } else if lower.contains("scrap") || lower.contains("crawl") || lower.contains("llm") {
        "19"
    } else if lower.contains("hop_limit") {
        "19,21"
    } else {
        "18"
    }
}

#[cfg(test)]
mod tests;
