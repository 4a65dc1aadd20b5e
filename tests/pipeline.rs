// tests/pipeline.rs
// End-to-end scenarios over the real routers with the in-memory state
// backend: pass-through, hard block, tarpit rewrite, hop overflow,
// escalation to enforcement, deterministic content.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use quagmire::escalation::{Classification, RequestMetadata};
use quagmire::secrets::Secrets;
use quagmire::server;
use quagmire::state::StateStore;
use quagmire::{Config, Runtime};

const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut map = HashMap::new();
    map.insert("QUAG_SYSTEM_SEED".to_string(), "pipeline-test-seed".to_string());
    // Keep the tests fast and the escalation post aimed at a port that
    // refuses connections immediately.
    map.insert("QUAG_TARPIT_MIN_DELAY_SEC".to_string(), "0.0".to_string());
    map.insert("QUAG_TARPIT_MAX_DELAY_SEC".to_string(), "0.0".to_string());
    map.insert(
        "QUAG_ESCALATION_ENDPOINT".to_string(),
        "http://127.0.0.1:9/escalate".to_string(),
    );
    map.insert(
        "QUAG_ENFORCEMENT_WEBHOOK_URL".to_string(),
        "http://127.0.0.1:9/analyze".to_string(),
    );
    for (k, v) in extra {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_overrides(map).unwrap()
}

fn test_runtime(extra: &[(&str, &str)]) -> Arc<Runtime> {
    Runtime::assemble(test_config(extra), Secrets::default(), StateStore::memory()).unwrap()
}

fn get_request(path: &str, ip: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(path).header("x-forwarded-for", ip);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// Scenario 1: a normal browser request passes through unchanged.
#[tokio::test]
async fn ordinary_request_passes_through() {
    let rt = test_runtime(&[]);
    let app = server::public_router(rt.clone());

    let response = app
        .oneshot(get_request(
            "/index.html",
            "198.51.100.10",
            &[("user-agent", BROWSER_UA), ("accept-language", "en-US")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK (passed edge filter)");
    assert_eq!(rt.state.current_hops("198.51.100.10").await.unwrap(), 0);
    assert!(!rt.state.is_blocked("198.51.100.10").await.unwrap());
}

// Scenario 2: a listed agent substring is refused outright.
#[tokio::test]
async fn bad_agent_is_hard_blocked() {
    let rt = test_runtime(&[]);
    let app = server::public_router(rt.clone());

    let response = app
        .oneshot(get_request(
            "/",
            "198.51.100.11",
            &[("user-agent", "GPTBot/1.0"), ("accept-language", "en-US")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "Access Denied.");
    // A hard block leaves no tarpit state behind.
    assert_eq!(rt.state.current_hops("198.51.100.11").await.unwrap(), 0);
}

// Scenario 3, first half: the substring hit takes precedence over the
// header heuristics.
#[tokio::test]
async fn substring_hit_takes_precedence_over_heuristics() {
    let rt = test_runtime(&[]);
    let app = server::public_router(rt);

    let response = app
        .oneshot(get_request(
            "/x",
            "198.51.100.12",
            &[("user-agent", "curl/8.0"), ("accept", "*/*")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// Scenario 3, second half: with curl off the bad list the heuristics route
// the request into the tarpit instead.
#[tokio::test]
async fn heuristic_trip_rewrites_into_tarpit() {
    let rt = test_runtime(&[(
        "QUAG_KNOWN_BAD_UA_SUBSTRINGS",
        "gptbot,ccbot,bytespider,masscan,sqlmap",
    )]);
    let app = server::public_router(rt.clone());

    let response = app
        .oneshot(get_request(
            "/x",
            "198.51.100.13",
            &[("user-agent", "curl/8.0"), ("accept", "*/*")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("text/html"));

    let body = body_string(response).await;
    assert!(body.contains("<!DOCTYPE html>"));
    assert!(body.contains("/anti-scrape-tarpit/"));

    assert_eq!(rt.state.current_hops("198.51.100.13").await.unwrap(), 1);
}

// Scenario 4: hop overflow blocks via enforcement and the edge refuses the
// source afterwards.
#[tokio::test]
async fn hop_overflow_blocks_the_source() {
    // Curl is off the bad-agent list here so the replayed request reaches
    // the tarpit instead of the hard block.
    let rt = test_runtime(&[
        ("QUAG_TARPIT_MAX_HOPS", "3"),
        (
            "QUAG_KNOWN_BAD_UA_SUBSTRINGS",
            "gptbot,ccbot,bytespider,masscan,sqlmap",
        ),
    ]);
    let app = server::public_router(rt.clone());
    let ip = "198.51.100.14";
    let headers: &[(&str, &str)] = &[("user-agent", "curl/8.0")];

    for hop in 1..=3u32 {
        let response = app
            .clone()
            .oneshot(get_request("/anti-scrape-tarpit/page", ip, headers))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "hop {} should stream", hop);
    }

    // Hop 4 exceeds MaxHops=3: enforcement blocks and the request is denied.
    let response = app
        .clone()
        .oneshot(get_request("/anti-scrape-tarpit/page", ip, headers))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "Access Denied.");
    assert!(rt.state.is_blocked(ip).await.unwrap());

    // Subsequent requests are refused at the edge before any tarpit state
    // is touched.
    let response = app
        .oneshot(get_request("/whatever", ip, &[("user-agent", BROWSER_UA)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(rt.state.current_hops(ip).await.unwrap(), 4);
}

// Scenario 5: a malicious escalation verdict reaches enforcement and the
// blocklist, end to end over HTTP.
#[tokio::test]
async fn escalation_verdict_reaches_enforcement() {
    // Bind the internal listener first so the webhook URL is known before
    // the runtime is assembled.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let rt = test_runtime(&[(
        "QUAG_ENFORCEMENT_WEBHOOK_URL",
        &format!("http://{}/analyze", addr),
    )]);
    let webhook_app = server::internal_router(rt.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            webhook_app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let ip = "198.51.100.15";
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("user-agent".to_string(), "python-requests/2.31".to_string());
    let meta = RequestMetadata::new(ip, "GET", "/anti-scrape-tarpit/x", None, headers);

    let app = server::internal_router(rt.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/escalate")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&meta).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    let decision: quagmire::escalation::EscalationDecision = serde_json::from_str(&body).unwrap();
    assert_eq!(decision.classification, Classification::Malicious);
    assert!(decision.score >= 0.5);

    assert!(rt.state.is_blocked(ip).await.unwrap());
}

// Scenario 6: identical seed and path produce byte-identical bodies.
#[tokio::test]
async fn tarpit_content_is_deterministic() {
    let rt = test_runtime(&[]);
    let app = server::public_router(rt);
    let headers: &[(&str, &str)] = &[("user-agent", BROWSER_UA), ("accept-language", "en-US")];

    let first = app
        .clone()
        .oneshot(get_request(
            "/anti-scrape-tarpit/article/42",
            "198.51.100.16",
            headers,
        ))
        .await
        .unwrap();
    let second = app
        .oneshot(get_request(
            "/anti-scrape-tarpit/article/42",
            "198.51.100.17",
            headers,
        ))
        .await
        .unwrap();

    let body1 = body_string(first).await;
    let body2 = body_string(second).await;
    assert_eq!(body1, body2);
    assert!(!body1.is_empty());
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let rt = test_runtime(&[]);

    let public = server::public_router(rt.clone());
    let response = public
        .oneshot(get_request("/health", "198.51.100.18", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"status":"healthy"}"#);

    let internal = server::internal_router(rt);
    let response = internal
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let metrics: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(metrics.get("service_uptime_seconds").is_some());
}

#[tokio::test]
async fn empty_source_extraction_passes_through_with_warning() {
    let rt = test_runtime(&[]);
    let app = server::public_router(rt);

    // No x-forwarded-for and no connect info: the filter cannot attribute
    // the request and must not refuse it.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/index.html")
                .header("user-agent", BROWSER_UA)
                .header("accept-language", "en-US")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
