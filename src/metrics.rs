// src/metrics.rs
// Process-wide counters for the defense pipeline. One thread-safe struct in
// the Runtime; snapshots are served as JSON from the internal listener.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

/// Counter names tracked across the pipeline.
#[derive(Debug, Clone, Copy)]
pub enum Metric {
    RequestsTotal,
    BlockedTotal,
    TarpitRewritesTotal,
    TarpitHitsTotal,
    HopLimitBlocksTotal,
    EscalationRequestsTotal,
    BenignVerdictsTotal,
    SuspiciousVerdictsTotal,
    MaliciousVerdictsTotal,
    CaptchaTriggersTotal,
    ModelPredictionsTotal,
    ReputationChecksTotal,
    LlmChecksTotal,
    BlocklistAddsTotal,
    CommunityReportsTotal,
    AlertsSentTotal,
    AlertErrorsTotal,
    StateErrorsTotal,
    UpstreamErrorsTotal,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::RequestsTotal => "requests_total",
            Metric::BlockedTotal => "blocked_total",
            Metric::TarpitRewritesTotal => "tarpit_rewrites_total",
            Metric::TarpitHitsTotal => "tarpit_hits_total",
            Metric::HopLimitBlocksTotal => "hop_limit_blocks_total",
            Metric::EscalationRequestsTotal => "escalation_requests_total",
            Metric::BenignVerdictsTotal => "benign_verdicts_total",
            Metric::SuspiciousVerdictsTotal => "suspicious_verdicts_total",
            Metric::MaliciousVerdictsTotal => "malicious_verdicts_total",
            Metric::CaptchaTriggersTotal => "captcha_triggers_total",
            Metric::ModelPredictionsTotal => "model_predictions_total",
            Metric::ReputationChecksTotal => "reputation_checks_total",
            Metric::LlmChecksTotal => "llm_checks_total",
            Metric::BlocklistAddsTotal => "blocklist_adds_total",
            Metric::CommunityReportsTotal => "community_reports_total",
            Metric::AlertsSentTotal => "alerts_sent_total",
            Metric::AlertErrorsTotal => "alert_errors_total",
            Metric::StateErrorsTotal => "state_errors_total",
            Metric::UpstreamErrorsTotal => "upstream_errors_total",
        }
    }
}

pub struct Metrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            counters: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn incr(&self, metric: Metric) {
        self.incr_by(metric, 1);
    }

    pub fn incr_by(&self, metric: Metric, value: u64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counters.entry(metric.as_str()).or_insert(0);
        *entry = entry.saturating_add(value);
    }

    pub fn get(&self, metric: Metric) -> u64 {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.get(metric.as_str()).copied().unwrap_or(0)
    }

    /// JSON snapshot of every counter plus uptime, for the internal
    /// /metrics endpoint.
    pub fn snapshot(&self) -> Value {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = serde_json::Map::new();
        for (name, value) in counters.iter() {
            map.insert((*name).to_string(), json!(value));
        }
        map.insert(
            "service_uptime_seconds".into(),
            json!(self.started_at.elapsed().as_secs()),
        );
        map.insert("last_updated_utc".into(), json!(Utc::now().to_rfc3339()));
        Value::Object(map)
    }
}
