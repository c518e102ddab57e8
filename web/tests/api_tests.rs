//! HTTP surface tests against the in-memory stores.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::{TestResponse, TestServer};
use serde_json::{Value, json};
use shelfmark_core::environment::Clock;
use shelfmark_core::{EngagementConfig, EngagementKind, FastStore, LockKey, SubjectId, UserId};
use shelfmark_runtime::metrics::MetricsServer;
use shelfmark_runtime::{RankingEngine, ToggleEngine};
use shelfmark_testing::helpers::book;
use shelfmark_testing::{MockEngagementRepository, MockFastStore, test_clock};
use shelfmark_web::{AppState, router};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    server: TestServer,
    store: Arc<MockFastStore>,
    repo: Arc<MockEngagementRepository>,
}

fn harness() -> Harness {
    let store = Arc::new(MockFastStore::new());
    let repo = Arc::new(MockEngagementRepository::with_subjects((1..=10).map(book)));
    let config = EngagementConfig::default();
    let toggles = ToggleEngine::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        Arc::new(test_clock()),
        config.clone(),
    );
    let rankings = RankingEngine::new(
        Arc::clone(&store),
        Arc::clone(&repo),
        Arc::new(test_clock()),
        config,
    );
    let app = router(AppState::new(toggles, rankings, MetricsServer::new()));
    Harness {
        server: TestServer::new(app).unwrap(),
        store,
        repo,
    }
}

fn user_header() -> HeaderName {
    HeaderName::from_static("x-user-id")
}

fn user(id: i64) -> HeaderValue {
    HeaderValue::from_str(&id.to_string()).unwrap()
}

impl Harness {
    async fn toggle(&self, user_id: i64, path: &str) -> TestResponse {
        self.server
            .post(path)
            .add_header(user_header(), user(user_id))
            .await
    }
}

// ============================================================================
// Engagement
// ============================================================================

#[tokio::test]
async fn test_toggle_on_and_off() {
    let h = harness();

    let first = h.toggle(1, "/api/v1/likes/7/toggle").await;
    first.assert_status(StatusCode::OK);
    assert_eq!(first.json::<Value>(), json!({ "engaged": true, "count": 1 }));

    let second = h.toggle(2, "/api/v1/likes/7/toggle").await;
    assert_eq!(second.json::<Value>(), json!({ "engaged": true, "count": 2 }));

    let third = h.toggle(1, "/api/v1/likes/7/toggle").await;
    assert_eq!(third.json::<Value>(), json!({ "engaged": false, "count": 1 }));

    let status = h
        .server
        .get("/api/v1/likes/7/status")
        .add_header(user_header(), user(2))
        .await;
    status.assert_status(StatusCode::OK);
    assert_eq!(status.json::<Value>(), json!({ "engaged": true, "count": 1 }));

    // The other kind is independent.
    let favorite = h
        .server
        .get("/api/v1/favorites/7/status")
        .add_header(user_header(), user(2))
        .await;
    assert_eq!(favorite.json::<Value>(), json!({ "engaged": false, "count": 0 }));
}

#[tokio::test]
async fn test_caller_identity_is_required() {
    let h = harness();

    h.server
        .post("/api/v1/likes/7/toggle")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    h.server
        .post("/api/v1/likes/7/toggle")
        .add_header(user_header(), HeaderValue::from_static("reader"))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(h.store.log_len(EngagementKind::Like), 0);
}

#[tokio::test]
async fn test_invalid_kind_and_book_are_rejected() {
    let h = harness();

    let unknown = h.toggle(1, "/api/v1/bookmarks/7/toggle").await;
    unknown.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(unknown.json::<Value>()["code"], "BAD_REQUEST");

    h.toggle(1, "/api/v1/likes/0/toggle")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_contention_is_too_many_requests() {
    let h = harness();
    let key = LockKey::Toggle {
        user_id: UserId(1),
        subject_id: SubjectId(7),
        kind: EngagementKind::Like,
    };
    assert!(h.store.try_lock(&key, Duration::from_secs(5)).await.unwrap());

    let response = h.toggle(1, "/api/v1/likes/7/toggle").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.json::<Value>()["code"], "TOO_FREQUENT");
}

#[tokio::test]
async fn test_total_outage_is_service_unavailable() {
    let h = harness();
    h.store.set_failing(true);
    h.repo.set_failing(true);

    let response = h.toggle(1, "/api/v1/likes/7/toggle").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_batch_status_keeps_request_order() {
    let h = harness();
    h.toggle(1, "/api/v1/favorites/3/toggle").await;
    h.toggle(2, "/api/v1/favorites/3/toggle").await;

    let response = h
        .server
        .post("/api/v1/favorites/batch-status")
        .add_header(user_header(), user(1))
        .json(&json!({ "book_ids": [5, 3] }))
        .await;
    response.assert_status(StatusCode::OK);
    assert_eq!(
        response.json::<Value>(),
        json!([
            { "book_id": 5, "engaged": false, "count": 0 },
            { "book_id": 3, "engaged": true, "count": 2 },
        ])
    );

    let too_many: Vec<i64> = (1..=101).collect();
    h.server
        .post("/api/v1/favorites/batch-status")
        .add_header(user_header(), user(1))
        .json(&json!({ "book_ids": too_many }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mine_lists_newest_first() {
    let h = harness();
    let now = test_clock().now();
    for (book, minutes) in [(1, 30), (2, 20), (3, 10)] {
        h.repo.insert_relation(
            UserId(4),
            SubjectId(book),
            EngagementKind::Like,
            now - chrono::TimeDelta::minutes(minutes),
        );
    }

    let response = h
        .server
        .get("/api/v1/likes/mine")
        .add_query_param("page", 1)
        .add_query_param("page_size", 2)
        .add_header(user_header(), user(4))
        .await;
    response.assert_status(StatusCode::OK);

    let page = response.json::<Value>();
    assert_eq!(page["total"], 3);
    assert_eq!(page["page_size"], 2);
    let books: Vec<i64> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["book_id"].as_i64().unwrap())
        .collect();
    assert_eq!(books, vec![3, 2]);
}

// ============================================================================
// Rankings
// ============================================================================

#[tokio::test]
async fn test_ranking_rebuilds_from_relations() {
    let h = harness();
    let now = test_clock().now();
    for (user_id, book) in [(1, 2), (2, 2), (1, 5)] {
        h.repo
            .insert_relation(UserId(user_id), SubjectId(book), EngagementKind::Like, now);
    }

    let response = h
        .server
        .get("/api/v1/rankings")
        .add_query_param("type", "like")
        .add_query_param("period", "week")
        .add_query_param("limit", 10)
        .await;
    response.assert_status(StatusCode::OK);

    let ranking = response.json::<Value>();
    assert_eq!(ranking["type"], "like");
    assert_eq!(ranking["period"], "week");
    assert_eq!(ranking["period_key"], "2025-W45");
    assert_eq!(ranking["total"], 2);
    assert_eq!(ranking["items"][0]["rank"], 1);
    assert_eq!(ranking["items"][0]["book_id"], 2);
    assert_eq!(ranking["items"][0]["score"], 2);
    assert_eq!(ranking["items"][1]["book_id"], 5);
}

#[tokio::test]
async fn test_ranking_rejects_unknown_period() {
    let h = harness();
    h.server
        .get("/api/v1/rankings")
        .add_query_param("type", "like")
        .add_query_param("period", "year")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rebuild_endpoint() {
    let h = harness();

    let ok = h.server.post("/api/v1/rankings/rebuild").await;
    ok.assert_status(StatusCode::OK);
    assert_eq!(ok.json::<Value>(), json!({ "ok": true }));

    h.repo.set_failing(true);
    h.server
        .post("/api/v1/rankings/rebuild")
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR);
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_health_and_metrics() {
    let h = harness();

    let health = h.server.get("/health").await;
    health.assert_status(StatusCode::OK);
    assert_eq!(health.text(), "ok");

    // No recorder installed by this harness.
    h.server
        .get("/metrics")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}
