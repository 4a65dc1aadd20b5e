// src/tarpit/generator.rs
// Deterministic fake-page generation. A page is fully determined by the
// (system seed, request path) pair: the digest of the pair seeds a local
// RNG that drives the title, paragraph counts and lengths, link targets,
// anchor text, and the per-chunk delay schedule. Body text comes from the
// persisted Markov model when one is configured, falling back to a built-in
// word table so the tarpit never serves an empty page.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::markov::{MarkovStore, Successor, EMPTY_TOKEN_ID};

pub(crate) const MIN_PARAGRAPHS: usize = 3;
pub(crate) const MAX_PARAGRAPHS: usize = 10;
pub(crate) const MIN_PARAGRAPH_TOKENS: usize = 40;
pub(crate) const MAX_PARAGRAPH_TOKENS: usize = 200;
pub(crate) const MIN_LINKS: usize = 8;
pub(crate) const MAX_LINKS: usize = 15;
const LINK_SEGMENT_LEN: usize = 16;
// Bail out of a chain that keeps dead-ending so generation always
// terminates, even against a degenerate model.
const MAX_CHAIN_RESTARTS: usize = 32;

/// Seeds a page-local RNG from the system seed and the request path. Two
/// requests with the same pair draw the identical stream.
pub fn page_rng(system_seed: &str, path: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(system_seed.as_bytes());
    hasher.update(path.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    StdRng::from_seed(digest)
}

/// Assembles the full HTML page for a tarpit path. The path itself shapes
/// the page only through the RNG seed.
pub fn generate_page(rng: &mut StdRng, markov: Option<&MarkovStore>, mount: &str) -> String {
    let title = generate_title(rng);
    let num_paragraphs = rng.gen_range(MIN_PARAGRAPHS..=MAX_PARAGRAPHS);
    let num_links = rng.gen_range(MIN_LINKS..=MAX_LINKS);

    let mut html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <meta name="robots" content="noindex, nofollow">
    <style>
        body {{ font-family: 'Courier New', Courier, monospace; background-color: #f4f4f2; color: #2e2e2e; padding: 2em; line-height: 1.6; }}
        h1 {{ border-bottom: 1px solid #c9c9c4; padding-bottom: 0.5em; color: #4a4a46; }}
        h2 {{ color: #5c5c58; margin-top: 2em; }}
        a {{ color: #2f6f9f; text-decoration: none; }}
        a:hover {{ text-decoration: underline; }}
        ul {{ list-style-type: square; padding-left: 2em; }}
        p {{ text-align: justify; }}
        .footer-link {{ display: inline-block; margin-top: 40px; font-size: 0.8em; visibility: hidden; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
"#
    );

    for _ in 0..num_paragraphs {
        let tokens = rng.gen_range(MIN_PARAGRAPH_TOKENS..=MAX_PARAGRAPH_TOKENS);
        let text = match markov {
            Some(store) => markov_text(rng, store, tokens),
            None => fallback_text(rng, tokens),
        };
        html.push_str("    <p>");
        html.push_str(&text);
        html.push_str("</p>\n");
    }

    html.push_str("    <h2>Further Reading</h2>\n    <ul>\n");
    for _ in 0..num_links {
        let target = format!("{}/{}", mount, hex_segment(rng, LINK_SEGMENT_LEN));
        let anchor = generate_anchor_text(rng);
        html.push_str(&format!(
            "        <li><a href=\"{}\">{}</a></li>\n",
            target, anchor
        ));
    }
    html.push_str("    </ul>\n");

    // Decoy link: invisible to humans, irresistible to crawlers. Points
    // back under the mount so followers stay inside the trap.
    let decoy = format!("{}/{}.zip", mount, hex_segment(rng, 10));
    html.push_str(&format!(
        "    <a href=\"{}\" class=\"footer-link\">Export archive</a>\n",
        decoy
    ));

    html.push_str("</body>\n</html>\n");
    html
}

/// Per-chunk delay schedule, drawn from the same seeded RNG so the pacing
/// of a page is as reproducible as its bytes.
pub fn delay_schedule(rng: &mut StdRng, chunks: usize, min_sec: f64, max_sec: f64) -> Vec<f64> {
    (0..chunks)
        .map(|_| {
            if max_sec > min_sec {
                rng.gen_range(min_sec..max_sec)
            } else {
                min_sec
            }
        })
        .collect()
}

// ── Markov text ─────────────────────────────────────────────────────────────

/// Walks the persisted bigram model: start at (empty, empty), sample a
/// successor weighted by stored frequency, restart on a dead end, stop at
/// the target token count. Sentences are joined with single spaces and
/// capitalized after terminal punctuation.
fn markov_text(rng: &mut StdRng, store: &MarkovStore, target_tokens: usize) -> String {
    let mut words: Vec<String> = Vec::with_capacity(target_tokens);
    let mut p1 = EMPTY_TOKEN_ID;
    let mut p2 = EMPTY_TOKEN_ID;
    let mut restarts = 0;

    while words.len() < target_tokens {
        let successors = match store.successors(p1, p2) {
            Ok(successors) => successors,
            Err(_) => break,
        };
        if successors.is_empty() {
            restarts += 1;
            if restarts > MAX_CHAIN_RESTARTS {
                break;
            }
            p1 = EMPTY_TOKEN_ID;
            p2 = EMPTY_TOKEN_ID;
            continue;
        }
        let next = weighted_pick(rng, &successors);
        if next.id == EMPTY_TOKEN_ID {
            // Explicit end of a trained sentence; restart the chain.
            p1 = EMPTY_TOKEN_ID;
            p2 = EMPTY_TOKEN_ID;
            continue;
        }
        words.push(next.word.clone());
        p1 = p2;
        p2 = next.id;
    }

    if words.is_empty() {
        return fallback_text(rng, target_tokens);
    }
    join_capitalized(&words)
}

fn weighted_pick<'a>(rng: &mut StdRng, successors: &'a [Successor]) -> &'a Successor {
    let total: u64 = successors.iter().map(|s| s.freq as u64).sum();
    if total == 0 {
        return &successors[rng.gen_range(0..successors.len())];
    }
    let mut target = rng.gen_range(0..total);
    for successor in successors {
        let freq = successor.freq as u64;
        if freq > target {
            return successor;
        }
        target -= freq;
    }
    &successors[successors.len() - 1]
}

/// Joins words with single spaces, uppercasing the first character of the
/// text and of every word following terminal punctuation.
pub(crate) fn join_capitalized(words: &[String]) -> String {
    let mut out = String::new();
    let mut capitalize_next = true;
    for word in words {
        if !out.is_empty() {
            out.push(' ');
        }
        if capitalize_next {
            out.push_str(&capitalize(word));
        } else {
            out.push_str(word);
        }
        capitalize_next = word.ends_with('.') || word.ends_with('!') || word.ends_with('?');
    }
    out
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

// ── Fallback corpus ─────────────────────────────────────────────────────────

const SUBJECTS: &[&str] = &[
    "archive", "ledger", "manifest", "registry", "snapshot", "rollout", "gateway", "replica",
    "partition", "workspace", "directory", "catalog", "bundle", "schedule", "quota", "channel",
    "revision", "mirror", "checkpoint", "digest",
];

const ACTIONS: &[&str] = &[
    "synchronize", "reconcile", "provision", "archive", "rotate", "validate", "publish",
    "replicate", "migrate", "index", "audit", "expire", "restore", "promote", "suspend",
];

const QUALIFIERS: &[&str] = &[
    "staged", "regional", "deprecated", "nightly", "primary", "readonly", "federated",
    "unverified", "quarterly", "incremental", "retired", "provisional", "internal", "expired",
];

const SECTIONS: &[&str] = &[
    "Procurement", "Facilities", "Billing", "Records", "Logistics", "Compliance", "Onboarding",
    "Archives", "Scheduling", "Inventory",
];

fn pick<'a>(rng: &mut StdRng, items: &'a [&'a str]) -> &'a str {
    items[rng.gen_range(0..items.len())]
}

fn generate_title(rng: &mut StdRng) -> String {
    match rng.gen_range(0..3u8) {
        0 => format!(
            "{} {} Index",
            pick(rng, SECTIONS),
            capitalize(pick(rng, SUBJECTS))
        ),
        1 => format!(
            "{} {} Reference",
            capitalize(pick(rng, QUALIFIERS)),
            capitalize(pick(rng, SUBJECTS))
        ),
        _ => format!(
            "{} {} Notes",
            capitalize(pick(rng, SUBJECTS)),
            pick(rng, SECTIONS)
        ),
    }
}

fn generate_anchor_text(rng: &mut StdRng) -> String {
    match rng.gen_range(0..3u8) {
        0 => format!(
            "{} {}",
            capitalize(pick(rng, ACTIONS)),
            pick(rng, SUBJECTS)
        ),
        1 => format!("{} {}", pick(rng, SECTIONS), pick(rng, SUBJECTS)),
        _ => format!(
            "{} {} {}",
            capitalize(pick(rng, QUALIFIERS)),
            pick(rng, SUBJECTS),
            "records"
        ),
    }
}

fn fallback_text(rng: &mut StdRng, target_tokens: usize) -> String {
    let mut words = Vec::with_capacity(target_tokens);
    let mut since_period = 0usize;
    while words.len() < target_tokens {
        let word = match rng.gen_range(0..3u8) {
            0 => pick(rng, SUBJECTS).to_string(),
            1 => pick(rng, ACTIONS).to_string(),
            _ => pick(rng, QUALIFIERS).to_string(),
        };
        since_period += 1;
        if since_period >= rng.gen_range(6..14) {
            words.push(format!("{}.", word));
            since_period = 0;
        } else {
            words.push(word);
        }
    }
    join_capitalized(&words)
}

fn hex_segment(rng: &mut StdRng, len: usize) -> String {
    const HEX_CHARS: &[u8] = b"0123456789abcdef";
    (0..len)
        .map(|_| HEX_CHARS[rng.gen_range(0..HEX_CHARS.len())] as char)
        .collect()
}
