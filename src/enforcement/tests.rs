// src/enforcement/tests.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::alerts::{highest_severity, passes_severity_filter, severity_rank};
use super::*;
use crate::config::Config;
use crate::escalation::{Classification, EscalationDecision, RequestMetadata, Trigger};
use crate::runtime::Runtime;
use crate::secrets::Secrets;
use crate::state::StateStore;

fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut map = HashMap::new();
    map.insert(
        "QUAG_SYSTEM_SEED".to_string(),
        "enforcement-test-seed".to_string(),
    );
    for (k, v) in extra {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_overrides(map).unwrap()
}

fn test_runtime(extra: &[(&str, &str)]) -> Arc<Runtime> {
    Runtime::assemble(test_config(extra), Secrets::default(), StateStore::memory()).unwrap()
}

fn metadata(ip: &str) -> RequestMetadata {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("user-agent".to_string(), "python-requests/2.31".to_string());
    RequestMetadata {
        source_ip: ip.to_string(),
        user_agent: "python-requests/2.31".to_string(),
        headers,
        method: "GET".to_string(),
        path: "/anti-scrape-tarpit/x".to_string(),
        query: None,
        timestamp_utc: Utc::now(),
    }
}

fn decision(ip: &str, reasons: &[&str], trigger: Trigger) -> EscalationDecision {
    EscalationDecision {
        source_ip: ip.to_string(),
        score: 0.9,
        reasons: reasons.iter().map(|r| r.to_string()).collect(),
        classification: Classification::Malicious,
        trigger,
        challenge_url: None,
    }
}

fn enforcement_request(ip: &str, reasons: &[&str], trigger: Trigger) -> EnforcementRequest {
    EnforcementRequest {
        decision: decision(ip, reasons, trigger),
        metadata: metadata(ip),
    }
}

#[tokio::test]
async fn handle_inserts_blocklist_entry() {
    let rt = test_runtime(&[]);
    let request = enforcement_request(
        "203.0.113.50",
        &["heuristic: known bad user agent 'python-requests'"],
        Trigger::Heuristic,
    );
    handle(&rt, &request).await.unwrap();
    assert!(rt.state.is_blocked("203.0.113.50").await.unwrap());
}

#[tokio::test]
async fn handle_skips_unknown_sources() {
    let rt = test_runtime(&[]);
    let request = enforcement_request("unknown", &["heuristic: x"], Trigger::Heuristic);
    handle(&rt, &request).await.unwrap();
    assert!(!rt.state.is_blocked("unknown").await.unwrap());
}

#[tokio::test]
async fn repeated_enforcement_is_idempotent() {
    let rt = test_runtime(&[]);
    let request = enforcement_request("203.0.113.51", &["llm: verdict"], Trigger::Llm);
    handle(&rt, &request).await.unwrap();
    handle(&rt, &request).await.unwrap();
    assert!(rt.state.is_blocked("203.0.113.51").await.unwrap());
}

#[test]
fn severity_rank_follows_configured_order() {
    let order: Vec<String> = ["frequency", "heuristic", "model", "reputation", "llm", "hop_limit"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(severity_rank(&order, "frequency"), Some(0));
    assert_eq!(severity_rank(&order, "hop_limit"), Some(5));
    assert_eq!(severity_rank(&order, "nonsense"), None);
}

#[test]
fn highest_severity_considers_reasons_and_trigger() {
    let order: Vec<String> = ["frequency", "heuristic", "model", "reputation", "llm", "hop_limit"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let request = enforcement_request(
        "192.0.2.8",
        &["frequency: 80 requests in 300s window", "model: classifier probability 0.91"],
        Trigger::Model,
    );
    assert_eq!(highest_severity(&order, &request), Some(2));

    let request = enforcement_request("192.0.2.8", &[], Trigger::HopLimit);
    assert_eq!(highest_severity(&order, &request), Some(5));
}

#[test]
fn severity_filter_suppresses_low_ranked_decisions() {
    // Default minimum severity is "model".
    let cfg = test_config(&[]);

    let low = enforcement_request(
        "192.0.2.9",
        &["frequency: 70 requests in 300s window", "heuristic: empty user agent"],
        Trigger::Heuristic,
    );
    assert!(!passes_severity_filter(&cfg, &low));

    let high = enforcement_request(
        "192.0.2.9",
        &["model: classifier probability 0.93"],
        Trigger::Model,
    );
    assert!(passes_severity_filter(&cfg, &high));

    // Hop-limit blocks always rank at the top of the default ordering.
    let hop = enforcement_request("192.0.2.9", &[], Trigger::HopLimit);
    assert!(passes_severity_filter(&cfg, &hop));
}

#[test]
fn severity_filter_respects_custom_order() {
    let cfg = test_config(&[
        (
            "QUAG_ALERT_REASON_SEVERITY_ORDER",
            "model,heuristic,frequency,hop_limit,reputation,llm",
        ),
        ("QUAG_ALERT_MIN_REASON_SEVERITY", "frequency"),
    ]);
    // In this order the model kind ranks lowest, so a model-only decision
    // is suppressed.
    let request = enforcement_request("192.0.2.10", &["model: p=0.99"], Trigger::Model);
    assert!(!passes_severity_filter(&cfg, &request));
}

#[test]
fn community_categories_map_reason_text() {
    assert_eq!(community_categories("masscan probing"), "14");
    assert_eq!(community_categories("llm: scraping detected"), "19");
    assert_eq!(community_categories("hop_limit: 251 hits"), "19,21");
    assert_eq!(community_categories("heuristic: odd headers"), "18");
}
