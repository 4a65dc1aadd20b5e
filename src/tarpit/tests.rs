// src/tarpit/tests.rs

use super::generator::*;
use crate::markov::MarkovStore;

const SEED: &str = "tarpit-test-seed";
const MOUNT: &str = "/anti-scrape-tarpit";

#[test]
fn identical_seed_and_path_give_identical_bytes() {
    let mut rng1 = page_rng(SEED, "/anti-scrape-tarpit/article/42");
    let mut rng2 = page_rng(SEED, "/anti-scrape-tarpit/article/42");
    let page1 = generate_page(&mut rng1, None, MOUNT);
    let page2 = generate_page(&mut rng2, None, MOUNT);
    assert_eq!(page1, page2);
}

#[test]
fn different_paths_give_different_pages() {
    let mut rng1 = page_rng(SEED, "/anti-scrape-tarpit/a");
    let mut rng2 = page_rng(SEED, "/anti-scrape-tarpit/b");
    assert_ne!(
        generate_page(&mut rng1, None, MOUNT),
        generate_page(&mut rng2, None, MOUNT)
    );
}

#[test]
fn different_seeds_give_different_pages() {
    let mut rng1 = page_rng("seed-one", "/anti-scrape-tarpit/x");
    let mut rng2 = page_rng("seed-two", "/anti-scrape-tarpit/x");
    assert_ne!(
        generate_page(&mut rng1, None, MOUNT),
        generate_page(&mut rng2, None, MOUNT)
    );
}

#[test]
fn generated_links_stay_under_the_mount() {
    let mut rng = page_rng(SEED, "/anti-scrape-tarpit/entry");
    let page = generate_page(&mut rng, None, MOUNT);
    for fragment in page.split("href=\"").skip(1) {
        let target = fragment.split('"').next().unwrap();
        assert!(
            target.starts_with("/anti-scrape-tarpit/"),
            "link escapes the mount: {}",
            target
        );
    }
}

#[test]
fn page_is_html_with_noindex_and_paragraphs() {
    let mut rng = page_rng(SEED, "/anti-scrape-tarpit/entry");
    let page = generate_page(&mut rng, None, MOUNT);
    assert!(page.starts_with("<!DOCTYPE html>"));
    assert!(page.contains("noindex, nofollow"));
    let paragraphs = page.matches("<p>").count();
    assert!((MIN_PARAGRAPHS..=MAX_PARAGRAPHS).contains(&paragraphs));
    let links = page.matches("<li><a").count();
    assert!((MIN_LINKS..=MAX_LINKS).contains(&links));
}

#[test]
fn markov_backed_page_uses_trained_words_deterministically() {
    let store = MarkovStore::open_in_memory().unwrap();
    store
        .train_line("quarterly throughput review pending since march.")
        .unwrap();
    store
        .train_line("quarterly throughput exceeded the projected ceiling.")
        .unwrap();

    let mut rng1 = page_rng(SEED, "/anti-scrape-tarpit/report");
    let page1 = generate_page(&mut rng1, Some(&store), MOUNT);
    let mut rng2 = page_rng(SEED, "/anti-scrape-tarpit/report");
    let page2 = generate_page(&mut rng2, Some(&store), MOUNT);

    assert_eq!(page1, page2);
    assert!(page1.contains("quarterly") || page1.contains("Quarterly"));
}

#[test]
fn capitalization_follows_sentence_punctuation() {
    let words: Vec<String> = ["the", "run", "ended.", "next", "run", "starts!", "soon"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        join_capitalized(&words),
        "The run ended. Next run starts! Soon"
    );
}

#[test]
fn delay_schedule_is_deterministic_and_bounded() {
    let mut rng1 = page_rng(SEED, "/anti-scrape-tarpit/delays");
    let mut rng2 = page_rng(SEED, "/anti-scrape-tarpit/delays");
    let a = delay_schedule(&mut rng1, 20, 0.6, 1.2);
    let b = delay_schedule(&mut rng2, 20, 0.6, 1.2);
    assert_eq!(a, b);
    assert!(a.iter().all(|d| (0.6..1.2).contains(d)));

    // Degenerate bounds collapse to the minimum.
    let mut rng = page_rng(SEED, "/anti-scrape-tarpit/flat");
    let flat = delay_schedule(&mut rng, 4, 0.5, 0.5);
    assert!(flat.iter().all(|d| *d == 0.5));
}
