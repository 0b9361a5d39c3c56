//! Knowledge store integration tests against the shipped knowledge base.

use std::path::Path;

use tempfile::TempDir;

use block_seek::subsystems::memory::KnowledgeStore;

const KNOWLEDGE_DIR: &str = "knowledge_base";

fn built_store() -> (TempDir, KnowledgeStore) {
    let tmp = TempDir::new().expect("tempdir");
    let store = KnowledgeStore::open(&tmp.path().join("vector_store")).expect("open store");
    let report = store.build_from_dir(Path::new(KNOWLEDGE_DIR), 1000, 200).expect("build");
    assert_eq!(report.documents_added, 4);
    assert!(report.chunks_indexed >= 4);
    (tmp, store)
}

#[test]
fn build_imports_every_markdown_file() {
    let (_tmp, store) = built_store();
    let mut sources: Vec<String> = store.list_documents().unwrap().into_iter().map(|d| d.source).collect();
    sources.sort();
    assert_eq!(sources, ["blockchain_basics.md", "defi.md", "nfts.md", "tokens.md"]);

    let stats = store.stats().unwrap();
    assert_eq!(stats.documents, 4);
    assert!(stats.chunks >= 4);
}

#[test]
fn rebuild_skips_unchanged_documents() {
    let (_tmp, store) = built_store();
    let before = store.stats().unwrap();
    let report = store.build_from_dir(Path::new(KNOWLEDGE_DIR), 1000, 200).unwrap();
    assert_eq!(report.documents_added, 0);
    assert_eq!(report.documents_skipped, 4);
    assert_eq!(store.stats().unwrap(), before);
}

#[test]
fn documents_are_titled_from_first_heading() {
    let (_tmp, store) = built_store();
    let defi = store
        .list_documents()
        .unwrap()
        .into_iter()
        .find(|d| d.source == "defi.md")
        .expect("defi.md indexed");
    assert_eq!(defi.title, "Decentralized Finance (DeFi)");
}

#[test]
fn search_finds_the_right_document() {
    let (_tmp, store) = built_store();

    let hits = store.search("impermanent loss", 3).unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].doc.source, "defi.md");
    assert!(hits[0].chunk.text.to_lowercase().contains("impermanent"));

    let hits = store.search("royalties", 3).unwrap();
    assert_eq!(hits[0].doc.source, "nfts.md");

    let hits = store.search("validators slashed", 5).unwrap();
    assert_eq!(hits[0].doc.source, "blockchain_basics.md");
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn search_edge_cases() {
    let (_tmp, store) = built_store();
    assert!(store.search("", 5).unwrap().is_empty());
    assert!(store.search("  ?! ", 5).unwrap().is_empty());
    assert!(store.search("gas", 0).unwrap().is_empty());
    assert!(store.search("zyxwvutsrq", 5).unwrap().is_empty());
    assert!(store.search("gas\" OR NEAR(", 2).unwrap().len() <= 2);
}

#[test]
fn missing_directory_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = KnowledgeStore::open(&tmp.path().join("store")).unwrap();
    assert!(store.build_from_dir(&tmp.path().join("nope"), 1000, 200).is_err());
}
