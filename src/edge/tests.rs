// src/edge/tests.rs

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::HeaderMap;

use super::*;
use crate::config::Config;

fn test_config() -> Config {
    let mut map = HashMap::new();
    map.insert("QUAG_SYSTEM_SEED".to_string(), "edge-test-seed".to_string());
    Config::from_overrides(map).unwrap()
}

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    map
}

#[test]
fn xff_first_token_wins_over_remote() {
    let h = headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.1")]);
    let remote: SocketAddr = "192.0.2.99:4711".parse().unwrap();
    assert_eq!(
        extract_source_ip(&h, Some(remote)),
        Some("198.51.100.7".to_string())
    );
}

#[test]
fn remote_address_used_without_xff() {
    let h = HeaderMap::new();
    let remote: SocketAddr = "192.0.2.99:4711".parse().unwrap();
    assert_eq!(
        extract_source_ip(&h, Some(remote)),
        Some("192.0.2.99".to_string())
    );
}

#[test]
fn ipv4_mapped_ipv6_normalizes_to_dotted_form() {
    let h = headers(&[("x-forwarded-for", "::ffff:203.0.113.4")]);
    assert_eq!(extract_source_ip(&h, None), Some("203.0.113.4".to_string()));

    let remote: SocketAddr = "[::ffff:198.51.100.1]:9999".parse().unwrap();
    assert_eq!(
        extract_source_ip(&HeaderMap::new(), Some(remote)),
        Some("198.51.100.1".to_string())
    );
}

#[test]
fn empty_extraction_yields_none() {
    let h = headers(&[("x-forwarded-for", " , 10.0.0.1")]);
    // First token empty: fall through to the (absent) remote address.
    assert_eq!(extract_source_ip(&h, None), None);
    assert_eq!(extract_source_ip(&HeaderMap::new(), None), None);
}

#[test]
fn bad_agent_match_is_case_insensitive_contains() {
    let cfg = test_config();
    assert_eq!(agent_block_match(&cfg, "Mozilla/5.0 GPTBot/1.0"), Some("gptbot"));
    assert_eq!(agent_block_match(&cfg, "gptbot"), Some("gptbot"));
    assert_eq!(agent_block_match(&cfg, "CURL/8.0"), Some("curl"));
    assert_eq!(agent_block_match(&cfg, "Mozilla/5.0 Firefox/121.0"), None);
    // Empty UA is a heuristic, never a hard block.
    assert_eq!(agent_block_match(&cfg, ""), None);
}

#[test]
fn heuristics_trip_independently() {
    let cfg = test_config();

    let h = headers(&[("user-agent", "probe"), ("accept-language", "en-US")]);
    assert!(tripped_heuristics(&cfg, &h).is_empty());

    let h = headers(&[("accept-language", "en-US")]);
    assert_eq!(tripped_heuristics(&cfg, &h), vec![HEURISTIC_EMPTY_UA]);

    let h = headers(&[("user-agent", "probe")]);
    assert_eq!(
        tripped_heuristics(&cfg, &h),
        vec![HEURISTIC_MISSING_ACCEPT_LANGUAGE]
    );

    let h = headers(&[
        ("user-agent", "probe"),
        ("accept-language", "en-US"),
        ("accept", "*/*"),
    ]);
    assert_eq!(tripped_heuristics(&cfg, &h), vec![HEURISTIC_GENERIC_ACCEPT]);

    // A specific Accept header does not count as generic.
    let h = headers(&[
        ("user-agent", "probe"),
        ("accept-language", "en-US"),
        ("accept", "text/html,*/*"),
    ]);
    assert!(tripped_heuristics(&cfg, &h).is_empty());
}

#[test]
fn heuristics_respect_toggles() {
    let mut map = HashMap::new();
    map.insert("QUAG_SYSTEM_SEED".to_string(), "edge-test-seed".to_string());
    map.insert("QUAG_CHECK_EMPTY_UA".to_string(), "false".to_string());
    map.insert(
        "QUAG_CHECK_MISSING_ACCEPT_LANGUAGE".to_string(),
        "false".to_string(),
    );
    let cfg = Config::from_overrides(map).unwrap();

    let h = headers(&[("accept", "*/*")]);
    assert_eq!(tripped_heuristics(&cfg, &h), vec![HEURISTIC_GENERIC_ACCEPT]);

    let h = HeaderMap::new();
    assert!(tripped_heuristics(&cfg, &h).is_empty());
}

#[test]
fn rewrite_preserves_original_path_under_mount() {
    assert_eq!(
        rewrite_path("/anti-scrape-tarpit", "/x"),
        "/anti-scrape-tarpit/x"
    );
    assert_eq!(
        rewrite_path("/anti-scrape-tarpit", "/deep/path/page.html"),
        "/anti-scrape-tarpit/deep/path/page.html"
    );
}

#[test]
fn header_map_conversion_lowercases_names() {
    let h = headers(&[("User-Agent", "probe"), ("Accept-Language", "en")]);
    let map = headers_to_map(&h);
    assert_eq!(map.get("user-agent").map(String::as_str), Some("probe"));
    assert_eq!(map.get("accept-language").map(String::as_str), Some("en"));
}
