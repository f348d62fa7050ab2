//! End-to-end extraction against a mocked query API
//!
//! These tests verify:
//! 1. Parent ids propagate through every level of the cascade
//! 2. Incremental runs advance the watermark and stay idempotent
//! 3. A failed level is reported while earlier output stays valid
//! 4. Targeted-tree and skip-children runs query only what they need
//! 5. Cancellation still produces a result and a metadata file
//! 6. Replacing runs never leave an earlier run's rows behind
//! 7. Rows that do not decode as their entity fail the level

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sessiontrace_core::columnar::{read_records, read_string_column};
use sessiontrace_core::config::{ApiConfig, ExtractConfig, DEFAULT_QUERY_PATH};
use sessiontrace_core::models::{decode_records, EntityKind, Interaction, InteractionType, Step};
use sessiontrace_core::{QueryExecutor, StaticTokenProvider};
use sessiontrace_extract::queries::{INTERACTION_TABLE, MESSAGE_TABLE, SESSION_TABLE, STEP_TABLE};
use sessiontrace_extract::{
    read_metadata, ExtractOptions, ExtractionMode, ExtractionOrchestrator,
};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Fixtures
// ============================================================================

fn orchestrator(server: &MockServer, out: &Path) -> ExtractionOrchestrator {
    let api = ApiConfig {
        max_retries: 2,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        request_timeout_ms: 2_000,
        poll_interval_ms: 5,
        ..ApiConfig::new(server.uri())
    };
    let provider = Arc::new(StaticTokenProvider::new("test-token", server.uri()));
    let executor = QueryExecutor::new(provider, api).expect("Failed to create executor");

    ExtractionOrchestrator::new(executor, ExtractConfig::default()).with_output_dir(out)
}

fn page(columns: &[&str], rows: Value) -> Value {
    let metadata: Vec<Value> = columns.iter().map(|c| json!({ "name": c })).collect();
    json!({
        "metadata": metadata,
        "data": rows,
        "status": {"completionStatus": "Completed"}
    })
}

fn sessions_page() -> Value {
    page(
        &["id", "start_timestamp", "end_timestamp", "channel_type", "end_type", "agent_name"],
        json!([
            ["s1", "2026-03-01T10:00:00.000Z", "2026-03-01T10:05:00.000Z", "Messaging", "USER_ENDED", "Service_Agent"],
            ["s2", "2026-03-01T11:00:00.000Z", null, "Voice", null, "Service_Agent"]
        ]),
    )
}

fn interactions_page() -> Value {
    page(
        &["id", "session_id", "start_timestamp", "end_timestamp", "interaction_type", "topic_name"],
        json!([
            ["i1", "s1", "2026-03-01T10:00:01.000Z", "2026-03-01T10:00:09.000Z", "TURN", "Order_Status"],
            ["i2", "s1", "2026-03-01T10:04:59.000Z", null, "SESSION_END", null],
            ["i3", "s2", "2026-03-01T11:00:02.000Z", null, "TURN", "Billing"]
        ]),
    )
}

fn steps_page() -> Value {
    page(
        &["id", "interaction_id", "start_timestamp", "step_type", "name", "input_text", "output_text", "generation_id"],
        json!([
            ["st1", "i1", "2026-03-01T10:00:02.000Z", "LLM_STEP", "Plan", "where is my order", "lookup", "g1"],
            ["st2", "i1", "2026-03-01T10:00:03.000Z", "ACTION_STEP", "Lookup_Order", "{\"order\":42}", "shipped", null],
            ["st3", "i1", "2026-03-01T10:00:04.000Z", "LLM_STEP", "Respond", "shipped", "Your order shipped", "g2"],
            ["st4", "i3", "2026-03-01T11:00:03.000Z", "LLM_STEP", "Plan", "refund", "policy", "g3"],
            ["st5", "i3", "2026-03-01T11:00:04.000Z", "ACTION_STEP", "Issue_Refund", "{}", "ok", null]
        ]),
    )
}

fn messages_page() -> Value {
    page(
        &["id", "session_id", "start_timestamp", "request_summary", "response_summary", "agent_name"],
        json!([
            ["m1", "s1", "2026-03-01T10:00:01.000Z", "order status", "shipped", "Service_Agent"]
        ]),
    )
}

async fn mount_table(server: &MockServer, table: &str, body: Value) {
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(table))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_full_hierarchy(server: &MockServer) {
    mount_table(server, SESSION_TABLE, sessions_page()).await;
    mount_table(server, INTERACTION_TABLE, interactions_page()).await;
    mount_table(server, STEP_TABLE, steps_page()).await;
    mount_table(server, MESSAGE_TABLE, messages_page()).await;
}

fn ids(out: &Path, kind: EntityKind, column: &str) -> HashSet<String> {
    read_string_column(&out.join(kind.file_name()), column)
        .unwrap()
        .into_iter()
        .collect()
}

fn window() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let end = Utc::now();
    (end - Duration::hours(24), end)
}

// ============================================================================
// TEST 1: Hierarchical id propagation
// ============================================================================
#[tokio::test]
async fn test_window_extraction_writes_consistent_hierarchy() {
    let server = MockServer::start().await;
    mount_full_hierarchy(&server).await;
    let out = TempDir::new().unwrap();
    let orch = orchestrator(&server, out.path());

    let (start, end) = window();
    let result = orch
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.mode, ExtractionMode::Window);
    assert_eq!(result.count(EntityKind::Session), 2);
    assert_eq!(result.count(EntityKind::Interaction), 3);
    assert_eq!(result.count(EntityKind::Step), 5);
    assert_eq!(result.count(EntityKind::Message), 1);

    let session_ids = ids(out.path(), EntityKind::Session, "id");
    let interaction_ids = ids(out.path(), EntityKind::Interaction, "id");
    assert_eq!(session_ids.len(), 2);
    assert!(ids(out.path(), EntityKind::Interaction, "session_id").is_subset(&session_ids));
    assert!(ids(out.path(), EntityKind::Step, "interaction_id").is_subset(&interaction_ids));
    assert!(ids(out.path(), EntityKind::Message, "session_id").is_subset(&session_ids));

    // Written rows decode into typed entities.
    let interactions: Vec<Interaction> =
        decode_records(&read_records(&out.path().join("interactions.parquet")).unwrap()).unwrap();
    assert_eq!(interactions[1].interaction_type, Some(InteractionType::SessionEnd));
    let steps: Vec<Step> =
        decode_records(&read_records(&out.path().join("steps.parquet")).unwrap()).unwrap();
    assert_eq!(steps.len(), 5);
    assert_eq!(steps[1].generation_id, None);

    let stats = &result.stats[&EntityKind::Step];
    assert_eq!(stats.rows_fetched, 5);
    assert_eq!(stats.batches, 1);
    assert!(stats.bytes_transferred > 0);

    let metadata = read_metadata(out.path()).unwrap();
    assert_eq!(metadata.result.run_id, result.run_id);
    assert_eq!(metadata.parameters.start, Some(start));
    assert!(metadata.result.errors.is_empty());
}

#[tokio::test]
async fn test_agent_filter_is_sent_in_session_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains("ssot__AiAgentApiName__c IN ('Service_Agent')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["id"], json!([]))))
        .expect(1)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &["Service_Agent".to_string()], &ExtractOptions::default())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.total_rows(), 0);
    for kind in EntityKind::ALL {
        let table = out.path().join(kind.file_name());
        assert!(table.exists(), "{kind}");
        assert!(read_records(&table).unwrap().is_empty(), "{kind}");
    }
}

// ============================================================================
// TEST 2: Incremental watermark
// ============================================================================
#[tokio::test]
async fn test_incremental_runs_advance_watermark() {
    let server = MockServer::start().await;
    mount_full_hierarchy(&server).await;
    let out = TempDir::new().unwrap();
    let orch = orchestrator(&server, out.path());
    let store = orch.watermark_store();
    assert_eq!(store.read().unwrap(), None);

    let before = Utc::now();
    let first = orch.extract_incremental(&ExtractOptions::default()).await;
    assert!(first.is_success(), "errors: {:?}", first.errors);
    let first_mark = store.load().unwrap();
    assert!(first_mark >= before - Duration::milliseconds(1));

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let second = orch.extract_incremental(&ExtractOptions::default()).await;
    assert!(second.is_success(), "errors: {:?}", second.errors);
    let second_mark = store.load().unwrap();
    assert!(second_mark > first_mark);
    assert!(second_mark <= Utc::now());

    // Same rows twice: append + dedupe leaves one copy of each.
    assert_eq!(ids(out.path(), EntityKind::Session, "id").len(), 2);
    let steps = read_string_column(&out.path().join("steps.parquet"), "id").unwrap();
    assert_eq!(steps.len(), 5);

    let metadata = read_metadata(out.path()).unwrap();
    assert_eq!(metadata.result.mode, ExtractionMode::Incremental);
    assert_eq!(metadata.parameters.start, Some(first_mark));
    assert!(first.watermark.is_some());
}

#[tokio::test]
async fn test_failed_incremental_run_keeps_watermark() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, sessions_page()).await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(INTERACTION_TABLE))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"message": "internal error"})),
        )
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();
    let orch = orchestrator(&server, out.path());

    let result = orch.extract_incremental(&ExtractOptions::default()).await;

    assert!(!result.is_success());
    assert!(result.errors[0].contains("internal error"), "{:?}", result.errors);
    assert_eq!(result.watermark, None);
    assert_eq!(orch.watermark_store().read().unwrap(), None);
    assert_eq!(result.count(EntityKind::Session), 2);
}

// ============================================================================
// TEST 3: Partial failure
// ============================================================================
#[tokio::test]
async fn test_step_write_failure_is_reported_and_earlier_levels_survive() {
    let server = MockServer::start().await;
    mount_full_hierarchy(&server).await;
    let out = TempDir::new().unwrap();
    // A directory where the step file should go makes the final rename fail.
    fs::create_dir_all(out.path().join("steps.parquet")).unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert_eq!(result.count(EntityKind::Session), 2);
    assert_eq!(result.count(EntityKind::Interaction), 3);
    assert_eq!(result.count(EntityKind::Step), 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("step extraction failed"), "{:?}", result.errors);

    assert_eq!(ids(out.path(), EntityKind::Session, "id").len(), 2);
    assert_eq!(ids(out.path(), EntityKind::Interaction, "id").len(), 3);

    let metadata = read_metadata(out.path()).unwrap();
    assert_eq!(metadata.result.errors, result.errors);
    assert_eq!(metadata.result.counts[&EntityKind::Step], 0);
}

#[tokio::test]
async fn test_rate_limited_level_stops_cascade() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, sessions_page()).await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(INTERACTION_TABLE))
        .respond_with(ResponseTemplate::new(429))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(STEP_TABLE))
        .respond_with(ResponseTemplate::new(200).set_body_json(steps_page()))
        .expect(0)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("Rate limit exceeded after 2 attempts"));
    assert_eq!(result.stats[&EntityKind::Interaction].rate_limit_waits, 1);
    assert!(ids(out.path(), EntityKind::Interaction, "id").is_empty());
}

// ============================================================================
// TEST 4: Targeted tree and skip-children
// ============================================================================
#[tokio::test]
async fn test_tree_extraction_queries_sessions_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains("WHERE ssot__Id__c IN ('s1', 's2')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_page()))
        .expect(1)
        .mount(&server)
        .await;
    mount_table(&server, INTERACTION_TABLE, interactions_page()).await;
    mount_table(&server, STEP_TABLE, steps_page()).await;
    mount_table(&server, MESSAGE_TABLE, messages_page()).await;
    let out = TempDir::new().unwrap();

    let requested = vec!["s1".to_string(), "s2".to_string(), "s1".to_string()];
    let result = orchestrator(&server, out.path())
        .extract_tree(&requested, &ExtractOptions::default())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.mode, ExtractionMode::Tree);
    assert_eq!(result.count(EntityKind::Session), 2);
    assert_eq!(result.count(EntityKind::Step), 5);

    let metadata = read_metadata(out.path()).unwrap();
    assert_eq!(metadata.parameters.session_ids, vec!["s1", "s2"]);
    assert_eq!(metadata.parameters.start, None);
}

#[tokio::test]
async fn test_skip_children_stops_after_sessions() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, sessions_page()).await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(INTERACTION_TABLE))
        .respond_with(ResponseTemplate::new(200).set_body_json(interactions_page()))
        .expect(0)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let options = ExtractOptions {
        skip_children: true,
        ..Default::default()
    };
    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &options)
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.count(EntityKind::Session), 2);
    assert_eq!(result.count(EntityKind::Interaction), 0);
    assert!(ids(out.path(), EntityKind::Interaction, "id").is_empty());
}

#[tokio::test]
async fn test_zero_interactions_finalizes_without_leaf_queries() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, sessions_page()).await;
    mount_table(
        &server,
        INTERACTION_TABLE,
        page(&["id", "session_id"], json!([])),
    )
    .await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(MESSAGE_TABLE))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages_page()))
        .expect(0)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.count(EntityKind::Session), 2);
    assert_eq!(result.count(EntityKind::Interaction), 0);
    assert_eq!(result.count(EntityKind::Message), 0);
}

// ============================================================================
// TEST 5: Cancellation
// ============================================================================
#[tokio::test]
async fn test_cancelled_run_still_writes_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let options = ExtractOptions::default();
    options.cancel.cancel();
    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &options)
        .await;

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("cancelled"), "{:?}", result.errors);
    assert!(out.path().join("extraction_metadata.json").exists());
}

// ============================================================================
// TEST 6: Replacing runs into the same directory
// ============================================================================
#[tokio::test]
async fn test_second_full_run_leaves_no_rows_from_first() {
    let out = TempDir::new().unwrap();
    let (start, end) = window();

    let first_server = MockServer::start().await;
    mount_full_hierarchy(&first_server).await;
    let first = orchestrator(&first_server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;
    assert!(first.is_success(), "errors: {:?}", first.errors);
    assert_eq!(ids(out.path(), EntityKind::Interaction, "id").len(), 3);

    let second_server = MockServer::start().await;
    mount_table(
        &second_server,
        SESSION_TABLE,
        page(
            &["id", "start_timestamp"],
            json!([["s9", "2026-03-02T09:00:00.000Z"]]),
        ),
    )
    .await;
    mount_table(&second_server, INTERACTION_TABLE, page(&["id", "session_id"], json!([]))).await;
    let second = orchestrator(&second_server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;
    assert!(second.is_success(), "errors: {:?}", second.errors);
    assert_eq!(second.count(EntityKind::Interaction), 0);

    let session_ids = ids(out.path(), EntityKind::Session, "id");
    assert_eq!(session_ids, HashSet::from(["s9".to_string()]));
    assert!(ids(out.path(), EntityKind::Interaction, "session_id").is_subset(&session_ids));
    for kind in [EntityKind::Interaction, EntityKind::Step, EntityKind::Message] {
        assert!(
            read_records(&out.path().join(kind.file_name())).unwrap().is_empty(),
            "{kind} still holds rows from the first run"
        );
    }
}

#[tokio::test]
async fn test_failed_session_level_clears_earlier_children() {
    let out = TempDir::new().unwrap();
    let (start, end) = window();

    let first_server = MockServer::start().await;
    mount_full_hierarchy(&first_server).await;
    orchestrator(&first_server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "down"})))
        .mount(&failing)
        .await;
    let result = orchestrator(&failing, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    for kind in EntityKind::ALL {
        assert!(read_records(&out.path().join(kind.file_name())).unwrap().is_empty(), "{kind}");
    }
}

#[tokio::test]
async fn test_incremental_run_keeps_tables_it_does_not_reach() {
    let server = MockServer::start().await;
    mount_full_hierarchy(&server).await;
    let out = TempDir::new().unwrap();
    let orch = orchestrator(&server, out.path());
    let (start, end) = window();
    orch.extract_window(start, end, &[], &ExtractOptions::default()).await;

    let quiet = MockServer::start().await;
    mount_table(&quiet, SESSION_TABLE, page(&["id"], json!([]))).await;
    let result = orchestrator(&quiet, out.path())
        .extract_incremental(&ExtractOptions::default())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(ids(out.path(), EntityKind::Session, "id").len(), 2);
    assert_eq!(ids(out.path(), EntityKind::Step, "id").len(), 5);
}

// ============================================================================
// TEST 7: Decode validation at ingestion
// ============================================================================
#[tokio::test]
async fn test_session_without_id_fails_the_level() {
    let server = MockServer::start().await;
    mount_table(
        &server,
        SESSION_TABLE,
        page(
            &["id", "start_timestamp"],
            json!([
                [null, "2026-03-01T10:00:00.000Z"],
                ["s1", "2026-03-01T10:00:00.000Z"]
            ]),
        ),
    )
    .await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_QUERY_PATH))
        .and(body_string_contains(INTERACTION_TABLE))
        .respond_with(ResponseTemplate::new(200).set_body_json(interactions_page()))
        .expect(0)
        .mount(&server)
        .await;
    let out = TempDir::new().unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("session extraction failed"), "{:?}", result.errors);
    assert!(result.errors[0].contains("missing required field 'id'"), "{:?}", result.errors);
    assert_eq!(result.count(EntityKind::Session), 0);
    assert!(ids(out.path(), EntityKind::Session, "id").is_empty());
}

#[tokio::test]
async fn test_unknown_interaction_type_fails_the_level() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, sessions_page()).await;
    mount_table(
        &server,
        INTERACTION_TABLE,
        page(
            &["id", "session_id", "start_timestamp", "interaction_type"],
            json!([["i1", "s1", "2026-03-01T10:00:01.000Z", "BOGUS"]]),
        ),
    )
    .await;
    let out = TempDir::new().unwrap();

    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &ExtractOptions::default())
        .await;

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("invalid interaction_type: BOGUS"), "{:?}", result.errors);
    assert_eq!(result.count(EntityKind::Session), 2);
    assert!(ids(out.path(), EntityKind::Interaction, "id").is_empty());
}

#[tokio::test]
async fn test_duplicate_session_ids_are_written_once() {
    let server = MockServer::start().await;
    mount_table(
        &server,
        SESSION_TABLE,
        page(
            &["id", "start_timestamp", "channel_type"],
            json!([
                ["s1", "2026-03-01T10:00:00.000Z", "Voice"],
                ["s1", "2026-03-01T10:00:00.000Z", "Messaging"]
            ]),
        ),
    )
    .await;
    let out = TempDir::new().unwrap();

    let options = ExtractOptions {
        skip_children: true,
        ..Default::default()
    };
    let (start, end) = window();
    let result = orchestrator(&server, out.path())
        .extract_window(start, end, &[], &options)
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(result.count(EntityKind::Session), 1);
    let rows = read_records(&out.path().join("sessions.parquet")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["channel_type"], json!("Messaging"));
}

#[tokio::test]
async fn test_watermark_lives_in_output_dir_named_verbatim() {
    let server = MockServer::start().await;
    mount_table(&server, SESSION_TABLE, page(&["id"], json!([]))).await;
    let out = TempDir::new().unwrap();
    let dir = out.path().join("run$NOT_A_VAR~x");

    let orch = orchestrator(&server, &dir);
    assert_eq!(orch.watermark_store().path(), dir.join("watermark.json"));

    let result = orch.extract_incremental(&ExtractOptions::default()).await;
    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert!(dir.join("watermark.json").exists());
}
