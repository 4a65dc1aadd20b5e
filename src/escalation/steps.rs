// src/escalation/steps.rs
// Scoring steps for the escalation pipeline. Each step contributes a score
// delta and human-readable reasons; a step may also terminate the pipeline
// with a verdict (known-benign short-circuit, LLM classification). Steps
// degrade gracefully: an unreachable backend skips the step and notes it in
// the reasons instead of failing the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metric;
use crate::runtime::Runtime;

use super::features::{self, RobotsRules};
use super::model::Classifier;
use super::{Classification, ReasonKind, RequestMetadata, Trigger};

// Contribution weights.
const KNOWN_BAD_UA_SCORE: f64 = 0.5;
const EMPTY_UA_SCORE: f64 = 0.25;
const DISALLOWED_PATH_SCORE: f64 = 0.3;
const CLASSIFIER_WEIGHT: f64 = 0.6;

/// Mutable scratch carried across the ordered step list.
#[derive(Debug, Default)]
pub struct Scratch {
    pub score: f64,
    /// Request count in the sliding window, filled by the frequency step and
    /// reused by the classifier's feature extraction.
    pub freq_count: Option<u32>,
}

#[derive(Debug, Default)]
pub struct StepOutcome {
    pub delta: f64,
    pub reasons: Vec<String>,
    pub terminal: Option<(Classification, Trigger)>,
}

#[async_trait]
pub trait ScoreStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ReasonKind;
    async fn run(&self, rt: &Runtime, meta: &RequestMetadata, scratch: &mut Scratch)
        -> StepOutcome;
}

// ── Frequency ───────────────────────────────────────────────────────────────

pub struct FrequencyStep {
    window_seconds: u64,
    saturation: u32,
}

impl FrequencyStep {
    pub fn from_config(cfg: &Config) -> Self {
        FrequencyStep {
            window_seconds: cfg.frequency_window_sec,
            saturation: cfg.frequency_saturation,
        }
    }
}

#[async_trait]
impl ScoreStep for FrequencyStep {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn kind(&self) -> ReasonKind {
        ReasonKind::Frequency
    }

    async fn run(
        &self,
        rt: &Runtime,
        meta: &RequestMetadata,
        scratch: &mut Scratch,
    ) -> StepOutcome {
        match rt
            .state
            .record_request(&meta.source_ip, Utc::now(), self.window_seconds)
            .await
        {
            Ok(count) => {
                scratch.freq_count = Some(count);
                let delta = (count as f64 / self.saturation as f64).min(1.0);
                StepOutcome {
                    delta,
                    reasons: vec![ReasonKind::Frequency.tag(format!(
                        "{} requests in {}s window",
                        count, self.window_seconds
                    ))],
                    terminal: None,
                }
            }
            Err(err) => {
                rt.metrics.incr(Metric::StateErrorsTotal);
                warn!(src = %meta.source_ip, error = %err, "frequency window unavailable");
                StepOutcome {
                    delta: 0.0,
                    reasons: vec![ReasonKind::Frequency.tag("skipped (state store unavailable)")],
                    terminal: None,
                }
            }
        }
    }
}

// ── Heuristics ──────────────────────────────────────────────────────────────

pub struct HeuristicStep {
    known_bad: Vec<String>,
    known_benign: Vec<String>,
    robots: Arc<RobotsRules>,
}

impl HeuristicStep {
    pub fn from_config(cfg: &Config, robots: Arc<RobotsRules>) -> Self {
        HeuristicStep {
            known_bad: cfg.known_bad_ua_substrings.clone(),
            known_benign: cfg.known_benign_crawler_uas.clone(),
            robots,
        }
    }
}

#[async_trait]
impl ScoreStep for HeuristicStep {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn kind(&self) -> ReasonKind {
        ReasonKind::Heuristic
    }

    async fn run(
        &self,
        _rt: &Runtime,
        meta: &RequestMetadata,
        _scratch: &mut Scratch,
    ) -> StepOutcome {
        let ua_lower = meta.user_agent.to_ascii_lowercase();

        if let Some(benign) = self
            .known_benign
            .iter()
            .find(|good| ua_lower.contains(good.as_str()))
        {
            return StepOutcome {
                delta: 0.0,
                reasons: vec![
                    ReasonKind::Heuristic.tag(format!("known benign crawler '{}'", benign))
                ],
                terminal: Some((Classification::Benign, Trigger::Heuristic)),
            };
        }

        let mut delta = 0.0;
        let mut reasons = Vec::new();

        if let Some(bad) = self
            .known_bad
            .iter()
            .find(|bad| ua_lower.contains(bad.as_str()))
        {
            delta += KNOWN_BAD_UA_SCORE;
            reasons.push(ReasonKind::Heuristic.tag(format!("known bad user agent '{}'", bad)));
        }
        if meta.user_agent.is_empty() {
            delta += EMPTY_UA_SCORE;
            reasons.push(ReasonKind::Heuristic.tag("empty user agent"));
        }
        if self.robots.is_disallowed(&meta.path) {
            delta += DISALLOWED_PATH_SCORE;
            reasons.push(
                ReasonKind::Heuristic.tag(format!("path '{}' disallowed by robots.txt", meta.path)),
            );
        }

        StepOutcome {
            delta,
            reasons,
            terminal: None,
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────────────

pub struct ClassifierStep {
    classifier: Arc<Classifier>,
    robots: Arc<RobotsRules>,
}

impl ClassifierStep {
    pub fn new(classifier: Arc<Classifier>, robots: Arc<RobotsRules>) -> Self {
        ClassifierStep { classifier, robots }
    }
}

#[async_trait]
impl ScoreStep for ClassifierStep {
    fn name(&self) -> &'static str {
        "classifier"
    }

    fn kind(&self) -> ReasonKind {
        ReasonKind::Model
    }

    async fn run(
        &self,
        rt: &Runtime,
        meta: &RequestMetadata,
        scratch: &mut Scratch,
    ) -> StepOutcome {
        let freq_count = scratch.freq_count.unwrap_or(0);
        let vector = features::extract(meta, &rt.config, &self.robots, freq_count);
        let probability = self.classifier.predict(&vector);
        rt.metrics.incr(Metric::ModelPredictionsTotal);

        StepOutcome {
            delta: probability * CLASSIFIER_WEIGHT,
            reasons: vec![ReasonKind::Model.tag(format!(
                "classifier probability {:.3} (weight {:.1})",
                probability, CLASSIFIER_WEIGHT
            ))],
            terminal: None,
        }
    }
}

// ── IP reputation ───────────────────────────────────────────────────────────

pub struct ReputationStep {
    url: String,
    timeout: Duration,
    bonus: f64,
    min_malicious_threshold: f64,
}

impl ReputationStep {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let url = cfg
            .ip_reputation_api_url
            .clone()
            .ok_or_else(|| Error::Config("reputation step enabled without an API URL".into()))?;
        Ok(ReputationStep {
            url,
            timeout: Duration::from_secs_f64(cfg.ip_reputation_timeout_sec),
            bonus: cfg.ip_reputation_malicious_score_bonus,
            min_malicious_threshold: cfg.ip_reputation_min_malicious_threshold,
        })
    }

    pub(crate) fn parse_score(body: &Value) -> Option<f64> {
        body.get("abuseConfidenceScore")
            .or_else(|| body.get("score"))
            .and_then(Value::as_f64)
    }
}

#[async_trait]
impl ScoreStep for ReputationStep {
    fn name(&self) -> &'static str {
        "reputation"
    }

    fn kind(&self) -> ReasonKind {
        ReasonKind::Reputation
    }

    async fn run(
        &self,
        rt: &Runtime,
        meta: &RequestMetadata,
        _scratch: &mut Scratch,
    ) -> StepOutcome {
        rt.metrics.incr(Metric::ReputationChecksTotal);
        let mut request = rt
            .http
            .get(&self.url)
            .query(&[("ipAddress", meta.source_ip.as_str())])
            .header("Accept", "application/json")
            .timeout(self.timeout);
        if let Some(key) = &rt.secrets.ip_reputation_api_key {
            request = request.header("Key", key.as_str());
        }

        let body: Value = match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(body) => body,
                Err(err) => return self.skipped(rt, meta, &err.to_string()),
            },
            Ok(resp) => return self.skipped(rt, meta, &format!("status {}", resp.status())),
            Err(err) => return self.skipped(rt, meta, &err.to_string()),
        };

        match Self::parse_score(&body) {
            Some(score) if score >= self.min_malicious_threshold => StepOutcome {
                delta: self.bonus,
                reasons: vec![ReasonKind::Reputation.tag(format!(
                    "reputation score {:.0} >= {:.0}",
                    score, self.min_malicious_threshold
                ))],
                terminal: None,
            },
            Some(score) => StepOutcome {
                delta: 0.0,
                reasons: vec![ReasonKind::Reputation
                    .tag(format!("reputation score {:.0} below threshold", score))],
                terminal: None,
            },
            None => self.skipped(rt, meta, "response carried no score field"),
        }
    }
}

impl ReputationStep {
    fn skipped(&self, rt: &Runtime, meta: &RequestMetadata, why: &str) -> StepOutcome {
        rt.metrics.incr(Metric::UpstreamErrorsTotal);
        warn!(src = %meta.source_ip, error = %why, "reputation check skipped");
        StepOutcome {
            delta: 0.0,
            reasons: vec![ReasonKind::Reputation.tag(format!("skipped ({})", why))],
            terminal: None,
        }
    }
}

// ── LLM / external classification ───────────────────────────────────────────

pub struct LlmStep {
    url: String,
    timeout: Duration,
}

impl LlmStep {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let url = cfg
            .llm_api_url
            .clone()
            .ok_or_else(|| Error::Config("LLM step enabled without an API URL".into()))?;
        Ok(LlmStep {
            url,
            timeout: Duration::from_secs_f64(cfg.llm_timeout_sec),
        })
    }

    /// Accepts either `{"classification": "..."}` or `{"is_bot": bool}`.
    pub(crate) fn parse_verdict(body: &Value) -> Option<bool> {
        if let Some(label) = body.get("classification").and_then(Value::as_str) {
            let label = label.to_ascii_uppercase();
            if label.contains("MALICIOUS") {
                return Some(true);
            }
            if label.contains("HUMAN") || label.contains("BENIGN") {
                return Some(false);
            }
            return None;
        }
        body.get("is_bot").and_then(Value::as_bool)
    }
}

#[async_trait]
impl ScoreStep for LlmStep {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn kind(&self) -> ReasonKind {
        ReasonKind::Llm
    }

    async fn run(
        &self,
        rt: &Runtime,
        meta: &RequestMetadata,
        scratch: &mut Scratch,
    ) -> StepOutcome {
        // Only the middle band is worth an expensive external call; clear
        // verdicts are already decided by the earlier steps.
        let low = rt.config.score_threshold_low;
        let high = rt.config.score_threshold_high;
        if scratch.score < low || scratch.score >= high {
            return StepOutcome::default();
        }

        rt.metrics.incr(Metric::LlmChecksTotal);
        let mut request = rt
            .http
            .post(&self.url)
            .json(meta)
            .timeout(self.timeout);
        if let Some(token) = &rt.secrets.llm_api_token {
            request = request.bearer_auth(token);
        }

        let body: Value = match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(body) => body,
                Err(err) => return self.skipped(rt, meta, &err.to_string()),
            },
            Ok(resp) => return self.skipped(rt, meta, &format!("status {}", resp.status())),
            Err(err) => return self.skipped(rt, meta, &err.to_string()),
        };

        match Self::parse_verdict(&body) {
            Some(true) => StepOutcome {
                delta: 0.0,
                reasons: vec![ReasonKind::Llm.tag("external classification: malicious")],
                terminal: Some((Classification::Malicious, Trigger::Llm)),
            },
            Some(false) => StepOutcome {
                delta: 0.0,
                reasons: vec![ReasonKind::Llm.tag("external classification: benign")],
                terminal: Some((Classification::Benign, Trigger::Llm)),
            },
            None => self.skipped(rt, meta, "inconclusive response"),
        }
    }
}

impl LlmStep {
    fn skipped(&self, rt: &Runtime, meta: &RequestMetadata, why: &str) -> StepOutcome {
        rt.metrics.incr(Metric::UpstreamErrorsTotal);
        warn!(src = %meta.source_ip, error = %why, "llm classification skipped");
        StepOutcome {
            delta: 0.0,
            reasons: vec![ReasonKind::Llm.tag(format!("skipped ({})", why))],
            terminal: None,
        }
    }
}
