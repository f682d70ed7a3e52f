//! End-to-end pipeline scenarios against stubbed providers
//!
//! Each test drives a full run (or a stop/resume pair) through the
//! coordinator and asserts on the resulting store state, the status
//! surface, and the cross-store invariants.

mod common;

use citegraph::client::{ErrorCounters, RateLimitedMetadata, RetryPolicy, TokenBucket};
use citegraph::config::RunConfig;
use citegraph::model::{CitationIntent, PaperId};
use citegraph::pipeline::{Checkpoint, CoordinatorError, RunState};
use citegraph::store::{GraphStore, SqliteVectorStore, VectorStore};
use common::stubs::{FailingVectorStore, StubAnalysis, StubMetadata};
use common::{assert_edge_invariants, assert_vector_ids_subset_of_graph, Harness, TEST_DIM};
use std::sync::Arc;
use std::time::Duration;

fn run_config(seeds: &[&str]) -> RunConfig {
    let mut config = RunConfig::from_seeds(seeds.iter().map(|s| PaperId::from(*s)).collect());
    config.max_papers = None;
    config
}

// --- Scenario: single seed, depth 0, no analysis ---

#[tokio::test]
async fn single_seed_depth_zero_without_analysis() {
    let metadata = Arc::new(StubMetadata::new().with_paper("2401.00001", &[("R1", None)]));
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    let mut config = run_config(&["2401.00001"]);
    config.max_depth = 0;
    config.analyze_enabled = false;
    config.embed_enabled = false;

    harness.coordinator.start(config).await.unwrap();
    let final_state = harness.coordinator.wait().await;
    assert_eq!(final_state, RunState::Completed);

    // One paper, no edges (depth 0 never lists references), no vectors.
    assert_eq!(harness.graph.paper_count().unwrap(), 1);
    assert!(harness.graph.citation_adjacency().unwrap().is_empty());
    assert_eq!(harness.vector.count().unwrap(), 0);

    let status = harness.coordinator.status();
    assert_eq!(status.persisted, 1);
    assert_eq!(status.progress_percentage, 100.0);
    assert!(!status.running);
}

// --- Scenario: single seed, depth 1, analysis on, three references ---

#[tokio::test]
async fn depth_one_with_analysis_builds_labeled_edges() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper(
                "P0",
                &[
                    ("P1", Some("we apply the method of [1]")),
                    ("P2", None),
                    ("P3", Some("background on gauge theory [3]")),
                ],
            )
            .with_paper("P1", &[])
            .with_paper("P2", &[])
            .with_paper("P3", &[]),
    );
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    // All four papers resolved.
    assert_eq!(harness.graph.paper_count().unwrap(), 4);
    for id in ["P0", "P1", "P2", "P3"] {
        let paper = harness.graph.get_paper(&PaperId::from(id)).unwrap().unwrap();
        assert!(!paper.is_stub(), "{} should be resolved", id);
        assert!(paper.summary.is_some(), "{} should be summarized", id);
    }

    // Edges carry classifier output; no context defaults to unknown.
    let edges = harness.graph.citations_from(&PaperId::from("P0")).unwrap();
    assert_eq!(edges.len(), 3);
    let intent_of = |dst: &str| {
        edges
            .iter()
            .find(|e| e.dst.as_str() == dst)
            .map(|e| e.intent)
            .unwrap()
    };
    assert_eq!(intent_of("P1"), CitationIntent::Method);
    assert_eq!(intent_of("P2"), CitationIntent::Unknown);
    assert_eq!(intent_of("P3"), CitationIntent::Background);

    // Embeddings exist exactly for papers whose record had text.
    assert_eq!(harness.vector.count().unwrap(), 4);
    assert_vector_ids_subset_of_graph(&harness);
    assert_edge_invariants(&harness);

    // Concepts extracted and linked.
    assert!(harness.graph.stats().unwrap().mentions >= 4);

    let status = harness.coordinator.status();
    assert_eq!(status.persisted, 4);
    assert_eq!(status.discovered, 4);
}

// --- Scenario: duplicate discovery under concurrency ---

#[tokio::test]
async fn concurrent_workers_agree_on_one_claim_per_paper() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper("P0", &[("P1", None)])
            .with_paper("Px", &[("P1", None)])
            .with_paper("P1", &[]),
    );
    let harness = Harness::new(metadata.clone(), Arc::new(StubAnalysis::new(TEST_DIM)), None);

    let mut config = run_config(&["P0", "Px"]);
    config.workers.fetch = 4;
    harness.coordinator.start(config).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    // Exactly one node for P1, fetched exactly once.
    assert_eq!(harness.graph.paper_count().unwrap(), 3);
    assert_eq!(metadata.paper_calls.load(std::sync::atomic::Ordering::SeqCst), 3);

    // Both edges exist.
    let incoming = harness.graph.citations_to(&PaperId::from("P1")).unwrap();
    let sources: Vec<&str> = incoming.iter().map(|e| e.src.as_str()).collect();
    assert_eq!(incoming.len(), 2);
    assert!(sources.contains(&"P0") && sources.contains(&"Px"));
    assert_edge_invariants(&harness);
}

// --- Scenario: rate-limit storm retried inside the client ---

#[tokio::test]
async fn rate_limit_storm_is_retried_without_data_loss() {
    let stub = StubMetadata::new()
        .with_paper("P0", &[("P1", None)])
        .with_paper("P1", &[])
        .failing_first(5);
    let errors = Arc::new(ErrorCounters::new());
    let metadata = Arc::new(RateLimitedMetadata::new(
        stub,
        Arc::new(TokenBucket::new(1000.0, 1000.0, Duration::from_secs(5))),
        RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(1),
            factor: 1.0,
            cap: Duration::from_millis(2),
            jitter: 0.0,
        },
        errors.clone(),
    ));
    let vector = Arc::new(SqliteVectorStore::open_in_memory(TEST_DIM).unwrap());
    let harness = Harness::build(
        metadata,
        Arc::new(StubAnalysis::new(TEST_DIM)),
        None,
        vector,
        errors,
    );

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    // No data lost: both papers resolved despite the storm.
    assert_eq!(harness.graph.paper_count().unwrap(), 2);
    let status = harness.coordinator.status();
    assert_eq!(status.errors_by_kind.get("metadata.rate_limited"), Some(&5));
    assert_eq!(status.persisted, 2);
}

// --- Scenario: unresolvable reference becomes a stub, not a loss ---

#[tokio::test]
async fn missing_paper_is_recorded_as_a_stub() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper("P0", &[("P1", None), ("GHOST", None)])
            .with_paper("P1", &[]),
    );
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    // GHOST exists as a stub; the edge to it survives.
    let ghost = harness.graph.get_paper(&PaperId::from("GHOST")).unwrap().unwrap();
    assert!(ghost.is_stub());
    assert_eq!(
        harness.coordinator.status().errors_by_kind.get("fetch.not_found"),
        Some(&1)
    );
    assert_eq!(harness.graph.citations_from(&PaperId::from("P0")).unwrap().len(), 2);
    assert_edge_invariants(&harness);
}

// --- Scenario: checkpoint, stop mid-run, resume to the full target ---

#[tokio::test]
async fn stop_and_resume_reaches_the_paper_cap_without_duplicates() {
    let names: Vec<String> = (1..=150).map(|i| format!("R{:03}", i)).collect();
    let refs: Vec<(&str, Option<&str>)> =
        names.iter().map(|n| (n.as_str(), None)).collect();
    let mut stub = StubMetadata::new()
        .with_paper("P0", &refs)
        .with_latency(Duration::from_millis(10));
    for name in &names {
        stub = stub.with_paper(name, &[]);
    }
    let metadata = Arc::new(stub);

    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.json");

    let harness = Harness::new(
        metadata.clone(),
        Arc::new(StubAnalysis::new(TEST_DIM)),
        Some(checkpoint_path.clone()),
    );

    let mut config = run_config(&["P0"]);
    config.max_papers = Some(100);
    config.max_fanout_per_paper = 200;
    config.checkpoint_every_n = 10;
    harness.coordinator.start(config.clone()).await.unwrap();

    // Stop once a meaningful prefix has persisted.
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    while harness.coordinator.status().persisted < 25 {
        assert!(std::time::Instant::now() < deadline, "run never progressed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness.coordinator.stop().await.unwrap();

    let first_persisted = harness.coordinator.status().persisted;
    assert!(first_persisted >= 25);

    // The checkpoint on disk matches the schema and has pending work.
    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert_eq!(checkpoint.schema_version, 1);

    // Restart against the same stores and resume.
    let resumed = harness.restarted(
        metadata,
        Arc::new(StubAnalysis::new(TEST_DIM)),
        Some(checkpoint_path),
    );
    config.resume = true;
    resumed.coordinator.start(config).await.unwrap();
    assert_eq!(resumed.coordinator.wait().await, RunState::Completed);

    // The cap is reached exactly: 100 enriched papers (P0 + 99 refs),
    // each embedded once, no duplicate nodes or edges.
    assert_eq!(resumed.vector.count().unwrap(), 100);
    let stats = resumed.graph.stats().unwrap();
    assert_eq!(stats.papers - stats.stubs, 100);
    assert_eq!(stats.citations, 150);
    assert_vector_ids_subset_of_graph(&resumed);
    assert_edge_invariants(&resumed);
}

// --- Scenario: vector-store partial failure converges via backfill ---

#[tokio::test]
async fn deferred_embeddings_converge_after_backfill() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper("P0", &[("P1", None), ("P2", None), ("P3", None), ("P4", None)])
            .with_paper("P1", &[])
            .with_paper("P2", &[])
            .with_paper("P3", &[])
            .with_paper("P4", &[]),
    );
    let vector = Arc::new(FailingVectorStore::new(
        SqliteVectorStore::open_in_memory(TEST_DIM).unwrap(),
        3,
    ));
    let harness = Harness::with_vector(
        metadata,
        Arc::new(StubAnalysis::new(TEST_DIM)),
        None,
        vector,
    );

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    // Three embedding writes were deferred; graph still holds all five.
    assert_eq!(harness.graph.paper_count().unwrap(), 5);
    assert_eq!(harness.vector.count().unwrap(), 2);
    assert_eq!(harness.graph.embedding_pending().unwrap().len(), 3);
    assert_eq!(harness.coordinator.status().persisted, 5);
    assert_vector_ids_subset_of_graph(&harness);

    // The re-analysis pass fills the gap.
    let filled = harness.coordinator.backfill_embeddings().await.unwrap();
    assert_eq!(filled, 3);
    assert_eq!(harness.vector.count().unwrap(), 5);
    assert!(harness.graph.embedding_pending().unwrap().is_empty());
    assert_vector_ids_subset_of_graph(&harness);
}

// --- Scenario: citation expansion discovers citing papers too ---

#[tokio::test]
async fn citation_expansion_walks_incoming_edges() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper("P0", &[])
            .with_citations("P0", &["C1"])
            .with_paper("C1", &[]),
    );
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    let mut config = run_config(&["P0"]);
    config.expand_citations = true;
    harness.coordinator.start(config).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Completed);

    assert_eq!(harness.graph.paper_count().unwrap(), 2);
    let incoming = harness.graph.citations_to(&PaperId::from("P0")).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].src.as_str(), "C1");
}

// --- Scenario: analysis provider down for a sustained window ---

#[tokio::test]
async fn dead_analysis_provider_fails_the_run() {
    // Enough papers that the consecutive-failure window fills: the
    // metadata side stays healthy, every enrichment degrades.
    let names: Vec<String> = (1..=30).map(|i| format!("R{:02}", i)).collect();
    let refs: Vec<(&str, Option<&str>)> =
        names.iter().map(|n| (n.as_str(), None)).collect();
    let mut stub = StubMetadata::new().with_paper("P0", &refs);
    for name in &names {
        stub = stub.with_paper(name, &[]);
    }

    let harness = Harness::new(
        Arc::new(stub),
        Arc::new(StubAnalysis::unavailable(TEST_DIM)),
        None,
    );

    let mut config = run_config(&["P0"]);
    config.max_fanout_per_paper = 100;
    harness.coordinator.start(config).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Failed);

    let status = harness.coordinator.status();
    assert!(
        status.errors_by_kind.get("analyze.unavailable").copied().unwrap_or(0) >= 20,
        "analysis outages should be counted: {:?}",
        status.errors_by_kind
    );
    // Nothing reached the vector store, but graph writes survived.
    assert_eq!(harness.vector.count().unwrap(), 0);
    assert!(harness.graph.paper_count().unwrap() > 0);
}

// --- Scenario: metadata provider down for a sustained window ---

#[tokio::test]
async fn dead_metadata_provider_fails_the_run() {
    let metadata = Arc::new(StubMetadata::new().unavailable());
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    let seeds: Vec<String> = (1..=25).map(|i| format!("S{:02}", i)).collect();
    let seed_refs: Vec<&str> = seeds.iter().map(|s| s.as_str()).collect();
    harness
        .coordinator
        .start(run_config(&seed_refs))
        .await
        .unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Failed);

    let status = harness.coordinator.status();
    assert!(
        status.errors_by_kind.get("fetch.unavailable").copied().unwrap_or(0) >= 20,
        "metadata outages should be counted: {:?}",
        status.errors_by_kind
    );
    assert_eq!(status.persisted, 0);
}

// --- Scenario: misconfigured embedding dimension is fatal, not silent ---

#[tokio::test]
async fn embedding_dimension_mismatch_fails_the_run() {
    let metadata = Arc::new(StubMetadata::new().with_paper("P0", &[]));
    // Provider produces half-width vectors against a TEST_DIM store.
    let harness = Harness::new(
        metadata,
        Arc::new(StubAnalysis::new(TEST_DIM / 2)),
        None,
    );

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    assert_eq!(harness.coordinator.wait().await, RunState::Failed);

    // The graph write landed before the vector write was rejected; the
    // paper is not left silently embedding-less-and-unflagged.
    assert!(harness.graph.get_paper(&PaperId::from("P0")).unwrap().is_some());
    assert_eq!(harness.vector.count().unwrap(), 0);
}

// --- Run-control: start rejects a second run; stop is idempotent ---

#[tokio::test]
async fn run_control_state_machine() {
    let metadata = Arc::new(
        StubMetadata::new()
            .with_paper("P0", &[])
            .with_latency(Duration::from_millis(50)),
    );
    let harness = Harness::new(metadata, Arc::new(StubAnalysis::new(TEST_DIM)), None);

    harness.coordinator.start(run_config(&["P0"])).await.unwrap();
    let second = harness.coordinator.start(run_config(&["P0"])).await;
    assert!(matches!(second, Err(CoordinatorError::AlreadyRunning)));

    harness.coordinator.stop().await.unwrap();
    // Stopping again succeeds with a note rather than failing.
    let again = harness.coordinator.stop().await.unwrap();
    assert_eq!(again, citegraph::pipeline::StopNote::AlreadyStopped);

    let status = harness.coordinator.status();
    assert!(!status.running);
    assert!(status.state.is_terminal());
}

// --- Invalid configuration is rejected before anything runs ---

#[tokio::test]
async fn invalid_config_is_rejected() {
    let harness = Harness::new(
        Arc::new(StubMetadata::new()),
        Arc::new(StubAnalysis::new(TEST_DIM)),
        None,
    );
    let mut config = run_config(&["P0"]);
    config.max_fanout_per_paper = 0;
    let result = harness.coordinator.start(config).await;
    assert!(matches!(result, Err(CoordinatorError::InvalidConfig(_))));
}
