// src/escalation/mod.rs
// Escalation engine: receives request metadata from the tarpit (or any
// internal peer), runs the ordered scoring pipeline, and posts malicious
// verdicts to the enforcement webhook.

pub mod features;
pub mod model;
pub mod steps;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metric;
use crate::runtime::Runtime;
use features::RobotsRules;
use steps::{ScoreStep, Scratch};

const ENFORCEMENT_POST_TIMEOUT_SECS: u64 = 10;
const ENFORCEMENT_RETRY_BACKOFF_SECS: [f64; 2] = [0.5, 1.0];
const ENFORCEMENT_ATTEMPTS: usize = 3;

/// Transient request descriptor carried between components. All timestamps
/// are UTC and serialize as ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub source_ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
}

impl RequestMetadata {
    pub fn new(
        source_ip: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let user_agent = headers.get("user-agent").cloned().unwrap_or_default();
        RequestMetadata {
            source_ip: source_ip.to_string(),
            user_agent,
            headers,
            method: method.to_string(),
            path: path.to_string(),
            query: query.map(|q| q.to_string()),
            timestamp_utc: Utc::now(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Benign,
    Suspicious,
    Malicious,
}

/// The signal that decided a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Heuristic,
    Model,
    Reputation,
    Llm,
    HopLimit,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Heuristic => "heuristic",
            Trigger::Model => "model",
            Trigger::Reputation => "reputation",
            Trigger::Llm => "llm",
            Trigger::HopLimit => "hop_limit",
        }
    }
}

/// Reason vocabulary. Every reason string is prefixed with its kind token so
/// the enforcement severity filter can rank it without a side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonKind {
    Frequency,
    Heuristic,
    Model,
    Reputation,
    Llm,
    HopLimit,
}

impl ReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonKind::Frequency => "frequency",
            ReasonKind::Heuristic => "heuristic",
            ReasonKind::Model => "model",
            ReasonKind::Reputation => "reputation",
            ReasonKind::Llm => "llm",
            ReasonKind::HopLimit => "hop_limit",
        }
    }

    pub fn tag(&self, detail: impl std::fmt::Display) -> String {
        format!("{}: {}", self.as_str(), detail)
    }

    /// Trigger reported when this kind decides a verdict. Frequency has no
    /// trigger of its own; a purely frequency-driven verdict reports the
    /// heuristic trigger.
    pub fn trigger(&self) -> Trigger {
        match self {
            ReasonKind::Frequency | ReasonKind::Heuristic => Trigger::Heuristic,
            ReasonKind::Model => Trigger::Model,
            ReasonKind::Reputation => Trigger::Reputation,
            ReasonKind::Llm => Trigger::Llm,
            ReasonKind::HopLimit => Trigger::HopLimit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub source_ip: String,
    pub score: f64,
    pub reasons: Vec<String>,
    pub classification: Classification,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
}

impl EscalationDecision {
    /// Decision for the tarpit's hop-overflow path.
    pub fn hop_limit(source_ip: &str, hops: u64, window_seconds: u64) -> Self {
        EscalationDecision {
            source_ip: source_ip.to_string(),
            score: 1.0,
            reasons: vec![ReasonKind::HopLimit.tag(format!(
                "{} tarpit hits within {}s",
                hops, window_seconds
            ))],
            classification: Classification::Malicious,
            trigger: Trigger::HopLimit,
            challenge_url: None,
        }
    }
}

/// Ordered scoring pipeline. Steps disabled by configuration are omitted at
/// construction; the engine only ever iterates this fixed list.
pub struct Pipeline {
    steps: Vec<Box<dyn ScoreStep>>,
}

impl Pipeline {
    pub fn build(cfg: &Config) -> Result<Self> {
        let robots = Arc::new(match &cfg.robots_txt_path {
            Some(path) => RobotsRules::load(path)?,
            None => RobotsRules::empty(),
        });

        let mut steps: Vec<Box<dyn ScoreStep>> = Vec::new();
        steps.push(Box::new(steps::FrequencyStep::from_config(cfg)));
        steps.push(Box::new(steps::HeuristicStep::from_config(cfg, robots.clone())));

        if let Some(path) = &cfg.model_artifact_path {
            let classifier = Arc::new(model::Classifier::load(path)?);
            steps.push(Box::new(steps::ClassifierStep::new(classifier, robots.clone())));
        }
        if cfg.enable_ip_reputation {
            steps.push(Box::new(steps::ReputationStep::from_config(cfg)?));
        }
        if cfg.enable_llm_classification {
            steps.push(Box::new(steps::LlmStep::from_config(cfg)?));
        }
        Ok(Pipeline { steps })
    }

    #[cfg(test)]
    pub(crate) fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn evaluate(&self, rt: &Runtime, meta: &RequestMetadata) -> EscalationDecision {
        let cfg = &rt.config;
        let mut scratch = Scratch::default();
        let mut reasons: Vec<String> = Vec::new();
        let mut contributions: Vec<(ReasonKind, f64)> = Vec::new();
        let mut terminal: Option<(Classification, Trigger)> = None;

        for step in &self.steps {
            let outcome = step.run(rt, meta, &mut scratch).await;
            scratch.score = (scratch.score + outcome.delta).clamp(0.0, 1.0);
            contributions.push((step.kind(), outcome.delta));
            reasons.extend(outcome.reasons);
            if let Some(t) = outcome.terminal {
                terminal = Some(t);
                break;
            }
        }

        let score = scratch.score;
        let dominant = dominant_trigger(&contributions);

        let (classification, trigger) = match terminal {
            Some((classification, trigger)) => (classification, trigger),
            None if score >= cfg.score_threshold_high => (Classification::Malicious, dominant),
            None if score < cfg.score_threshold_low => (Classification::Benign, dominant),
            None => (Classification::Suspicious, dominant),
        };

        let mut challenge_url = None;
        if classification == Classification::Suspicious
            && cfg.enable_captcha_trigger
            && score >= cfg.captcha_score_threshold_low
            && score < cfg.captcha_score_threshold_high
        {
            challenge_url = cfg.captcha_verification_url.clone();
            rt.metrics.incr(Metric::CaptchaTriggersTotal);
        }

        EscalationDecision {
            source_ip: meta.source_ip.clone(),
            score,
            reasons,
            classification,
            trigger,
            challenge_url,
        }
    }
}

/// Kind of the largest score contribution among the trigger-bearing steps.
fn dominant_trigger(contributions: &[(ReasonKind, f64)]) -> Trigger {
    contributions
        .iter()
        .filter(|(kind, _)| {
            matches!(
                kind,
                ReasonKind::Heuristic | ReasonKind::Model | ReasonKind::Reputation
            )
        })
        .filter(|(_, delta)| *delta > 0.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(kind, _)| kind.trigger())
        .unwrap_or(Trigger::Heuristic)
}

/// Internal endpoint: score metadata and, on a malicious verdict, hand off
/// to enforcement before answering.
pub async fn handle_escalate(
    State(rt): State<Arc<Runtime>>,
    Json(meta): Json<RequestMetadata>,
) -> Json<EscalationDecision> {
    rt.metrics.incr(Metric::EscalationRequestsTotal);
    let decision = rt.pipeline.evaluate(&rt, &meta).await;

    match decision.classification {
        Classification::Benign => rt.metrics.incr(Metric::BenignVerdictsTotal),
        Classification::Suspicious => rt.metrics.incr(Metric::SuspiciousVerdictsTotal),
        Classification::Malicious => rt.metrics.incr(Metric::MaliciousVerdictsTotal),
    }

    info!(
        src = %decision.source_ip,
        score = decision.score,
        classification = ?decision.classification,
        trigger = decision.trigger.as_str(),
        "escalation complete"
    );

    if decision.classification == Classification::Malicious {
        forward_to_enforcement(&rt, &decision, &meta).await;
    }

    Json(decision)
}

/// Posts a malicious verdict to the enforcement webhook with a bounded
/// retry policy. Exhaustion is logged as a persistent failure and dropped;
/// the escalation response is not affected.
pub async fn forward_to_enforcement(rt: &Runtime, decision: &EscalationDecision, meta: &RequestMetadata) {
    let payload = serde_json::json!({ "decision": decision, "metadata": meta });
    let url = rt.config.enforcement_webhook_url.clone();

    for attempt in 0..ENFORCEMENT_ATTEMPTS {
        let result = rt
            .http
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(ENFORCEMENT_POST_TIMEOUT_SECS))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => warn!(
                src = %decision.source_ip,
                status = %resp.status(),
                attempt,
                "enforcement webhook rejected verdict"
            ),
            Err(err) => warn!(
                src = %decision.source_ip,
                error = %err,
                attempt,
                "enforcement webhook unreachable"
            ),
        }
        if attempt < ENFORCEMENT_RETRY_BACKOFF_SECS.len() {
            tokio::time::sleep(Duration::from_secs_f64(
                ENFORCEMENT_RETRY_BACKOFF_SECS[attempt],
            ))
            .await;
        }
    }
    rt.metrics.incr(Metric::UpstreamErrorsTotal);
    error!(
        src = %decision.source_ip,
        url = %url,
        "enforcement hand-off failed after {} attempts; verdict dropped",
        ENFORCEMENT_ATTEMPTS
    );
}
