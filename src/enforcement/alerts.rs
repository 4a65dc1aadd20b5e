// src/enforcement/alerts.rs
// Alert fan-out with severity filtering. The channel comes from
// QUAG_ALERT_METHOD; an alert goes out only when the decision's
// highest-severity reason kind ranks at or above the configured minimum.

use std::time::Duration;

use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::config::{AlertMethod, Config};
use crate::metrics::Metric;
use crate::runtime::Runtime;

use super::EnforcementRequest;

const ALERT_POST_TIMEOUT_SECS: u64 = 10;

/// Dispatches the configured alert channel for a block event, honoring the
/// severity filter. Channel failures are logged and counted, never
/// propagated.
pub async fn dispatch(rt: &Runtime, request: &EnforcementRequest) {
    if rt.config.alert_method == AlertMethod::None {
        return;
    }
    if !passes_severity_filter(&rt.config, request) {
        info!(
            src = %request.decision.source_ip,
            min = %rt.config.alert_min_reason_severity,
            "alert suppressed below severity threshold"
        );
        return;
    }

    let outcome = match rt.config.alert_method {
        AlertMethod::None => return,
        AlertMethod::Webhook => send_webhook(rt, request).await,
        AlertMethod::Slack => send_slack(rt, request).await,
        AlertMethod::Smtp => send_smtp(rt, request).await,
    };

    match outcome {
        Ok(()) => {
            rt.metrics.incr(Metric::AlertsSentTotal);
            info!(
                src = %request.decision.source_ip,
                method = rt.config.alert_method.as_str(),
                "alert dispatched"
            );
        }
        Err(err) => {
            rt.metrics.incr(Metric::AlertErrorsTotal);
            warn!(
                src = %request.decision.source_ip,
                method = rt.config.alert_method.as_str(),
                error = %err,
                "alert dispatch failed"
            );
        }
    }
}

/// Rank of a reason kind in the configured severity ordering. Kinds missing
/// from the list rank below everything in it.
pub fn severity_rank(order: &[String], kind: &str) -> Option<usize> {
    order.iter().position(|entry| entry == kind)
}

/// Highest severity rank across the decision's reasons and its trigger.
pub fn highest_severity(order: &[String], request: &EnforcementRequest) -> Option<usize> {
    let reason_kinds = request
        .decision
        .reasons
        .iter()
        .filter_map(|reason| reason.split(':').next())
        .map(str::trim);
    let trigger_kind = std::iter::once(request.decision.trigger.as_str());
    reason_kinds
        .chain(trigger_kind)
        .filter_map(|kind| severity_rank(order, kind))
        .max()
}

pub fn passes_severity_filter(cfg: &Config, request: &EnforcementRequest) -> bool {
    let Some(min_rank) = severity_rank(&cfg.alert_reason_severity_order, &cfg.alert_min_reason_severity)
    else {
        // Validated at startup; an unknown minimum here means alert anyway
        // rather than go silent.
        return true;
    };
    match highest_severity(&cfg.alert_reason_severity_order, request) {
        Some(rank) => rank >= min_rank,
        None => false,
    }
}

fn alert_payload(request: &EnforcementRequest) -> serde_json::Value {
    serde_json::json!({
        "event": "ip_blocked",
        "src": request.decision.source_ip,
        "reasons": request.decision.reasons,
        "score": request.decision.score,
        "ts": Utc::now().to_rfc3339(),
    })
}

fn human_summary(request: &EnforcementRequest) -> String {
    format!(
        "Source {} blocked (score {:.3}, trigger {}).\nReasons:\n  {}\nUser agent: {}\nPath: {}",
        request.decision.source_ip,
        request.decision.score,
        request.decision.trigger.as_str(),
        request.decision.reasons.join("\n  "),
        request.metadata.user_agent,
        request.metadata.path,
    )
}

async fn send_webhook(rt: &Runtime, request: &EnforcementRequest) -> Result<(), String> {
    let url = rt
        .config
        .alert_webhook_url
        .as_ref()
        .ok_or("webhook alert method without URL")?;
    post_json(rt, url, &alert_payload(request)).await
}

async fn send_slack(rt: &Runtime, request: &EnforcementRequest) -> Result<(), String> {
    let url = rt
        .config
        .alert_slack_webhook_url
        .as_ref()
        .ok_or("slack alert method without URL")?;
    let payload = serde_json::json!({
        "text": format!(":shield: *Anti-scraping block*\n```{}```", human_summary(request)),
    });
    post_json(rt, url, &payload).await
}

async fn post_json(rt: &Runtime, url: &str, payload: &serde_json::Value) -> Result<(), String> {
    let resp = rt
        .http
        .post(url)
        .json(payload)
        .timeout(Duration::from_secs(ALERT_POST_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("alert endpoint returned {}", resp.status()))
    }
}

async fn send_smtp(rt: &Runtime, request: &EnforcementRequest) -> Result<(), String> {
    let cfg = &rt.config;
    let host = cfg
        .alert_smtp_host
        .as_ref()
        .ok_or("smtp alert method without host")?;
    let to = cfg
        .alert_email_to
        .as_ref()
        .ok_or("smtp alert method without recipient")?;
    let from = cfg
        .alert_email_from
        .as_ref()
        .ok_or("smtp alert method without sender")?;

    let subject = format!(
        "[anti-scraping] blocked {} ({})",
        request.decision.source_ip,
        request.decision.trigger.as_str()
    );
    let body = format!(
        "{}\n\nBlocklist TTL: {}s\n",
        human_summary(request),
        cfg.blocklist_ttl_seconds
    );

    let mut builder = Message::builder()
        .from(from.parse().map_err(|e| format!("bad From address: {}", e))?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for recipient in to.split(',') {
        builder = builder.to(recipient
            .trim()
            .parse()
            .map_err(|e| format!("bad To address: {}", e))?);
    }
    let email = builder.body(body).map_err(|e| e.to_string())?;

    // Implicit TLS on the SMTPS port, STARTTLS when requested, plaintext
    // otherwise (local relays).
    let mut transport = if cfg.alert_smtp_port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(|e| e.to_string())?
    } else if cfg.alert_smtp_use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|e| e.to_string())?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
    }
    .port(cfg.alert_smtp_port);

    if let (Some(user), Some(password)) = (&cfg.alert_smtp_user, &rt.secrets.smtp_password) {
        transport = transport.credentials(Credentials::new(user.clone(), password.clone()));
    }

    transport
        .build()
        .send(email)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}
