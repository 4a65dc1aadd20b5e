// src/escalation/features.rs
// Fixed feature vector extracted from request metadata for the classifier,
// plus the robots.txt disallow rules that feed both the heuristics and the
// `path_disallowed` feature.

use std::fs;
use std::path::Path;

use chrono::Timelike;

use crate::config::Config;
use crate::error::{Error, Result};

use super::RequestMetadata;

/// Disallow prefixes for `User-agent: *` parsed from a robots.txt file.
/// A request that crawls a disallowed path despite robots is a strong bot
/// signal.
#[derive(Debug, Default)]
pub struct RobotsRules {
    disallowed: Vec<String>,
}

impl RobotsRules {
    pub fn empty() -> Self {
        RobotsRules::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read robots.txt at {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut disallowed = Vec::new();
        let mut in_wildcard_group = false;
        for raw_line in text.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "user-agent" => in_wildcard_group = value == "*",
                "disallow" if in_wildcard_group => {
                    // "Disallow: /" would mark everything; frequency and the
                    // other signals cover that case better than a blanket
                    // feature.
                    if !value.is_empty() && value != "/" {
                        disallowed.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        RobotsRules { disallowed }
    }

    pub fn is_disallowed(&self, path: &str) -> bool {
        if path.is_empty() || self.disallowed.is_empty() {
            return false;
        }
        let normalized = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self.disallowed
            .iter()
            .any(|prefix| normalized.starts_with(prefix.as_str()))
    }

    pub fn rule_count(&self) -> usize {
        self.disallowed.len()
    }
}

/// Named feature values in a fixed order. The classifier artifact addresses
/// features by name, so order only matters for reproducible debugging
/// output.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    pairs: Vec<(&'static str, f64)>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.pairs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn pairs(&self) -> &[(&'static str, f64)] {
        &self.pairs
    }
}

pub fn extract(
    meta: &RequestMetadata,
    cfg: &Config,
    robots: &RobotsRules,
    freq_count: u32,
) -> FeatureVector {
    let ua_lower = meta.user_agent.to_ascii_lowercase();
    let is_known_bad = cfg
        .known_bad_ua_substrings
        .iter()
        .any(|bad| ua_lower.contains(bad.as_str()));
    let is_known_benign = cfg
        .known_benign_crawler_uas
        .iter()
        .any(|good| ua_lower.contains(good.as_str()));

    let referer = meta.header("referer").unwrap_or("");
    let query_param_count = meta
        .query
        .as_deref()
        .map(|q| q.split('&').filter(|p| !p.is_empty()).count())
        .unwrap_or(0);

    let pairs = vec![
        ("req_rate_window", freq_count as f64),
        ("ua_length", meta.user_agent.len() as f64),
        ("ua_is_empty", flag(meta.user_agent.is_empty())),
        ("has_accept_language", flag(meta.header("accept-language").is_some())),
        ("has_accept", flag(meta.header("accept").is_some())),
        ("has_referer", flag(!referer.is_empty() && referer != "-")),
        ("path_depth", meta.path.matches('/').count() as f64),
        ("query_param_count", query_param_count as f64),
        ("hour_of_day", meta.timestamp_utc.hour() as f64),
        ("is_known_bad_ua", flag(is_known_bad)),
        ("is_known_benign_ua", flag(is_known_benign)),
        ("path_disallowed", flag(robots.is_disallowed(&meta.path))),
    ];
    FeatureVector { pairs }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
