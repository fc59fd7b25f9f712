mod common;

use common::{TestApp, TestOptions, RECORDS_PER_PAGE, SOURCE};
use reqwest::StatusCode;
use secrecy::Secret;
use serde_json::json;

#[tokio::test]
async fn short_range_completes_inline() {
    let app = TestApp::spawn().await;

    let response = app
        .post_sync(json!({"startDate": "2024-01-01", "endDate": "2024-01-10"}))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["hasMore"], false);
    assert_eq!(body["totalFetched"], 2 * RECORDS_PER_PAGE);
    assert_eq!(body["totalInserted"], 2 * RECORDS_PER_PAGE);
    assert!(body["syncRunId"].is_string());
    assert!(body["durationMs"].is_u64());
}

#[tokio::test]
async fn rerunning_a_range_does_not_duplicate_records() {
    let app = TestApp::spawn().await;
    let range = json!({"startDate": "2024-01-01", "endDate": "2024-01-10"});

    for _ in 0..2 {
        let response = app.post_sync(range.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let stored = app.store.count_transactions(SOURCE).await.unwrap();
    assert_eq!(stored, (2 * RECORDS_PER_PAGE) as i64);
}

#[tokio::test]
async fn long_range_is_finished_by_continuation_workers() {
    let app = TestApp::spawn_with(TestOptions {
        invocation_budget_secs: 0,
        ..Default::default()
    })
    .await;

    let response = app
        .post_sync(json!({
            "startDate": "2024-01-01",
            "endDate": "2024-03-15",
            "fetchAll": true
        }))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "continuing");
    assert_eq!(body["hasMore"], true);

    let id = body["syncRunId"].as_str().unwrap().to_string();
    let run = app.wait_for_run_status(&id, "completed").await;

    // Three windows of two pages each.
    assert_eq!(run["totalFetched"], 3 * 2 * RECORDS_PER_PAGE);
    assert_eq!(run["checkpoint"]["totalChunks"], 3);
    assert_eq!(
        app.store.count_transactions(SOURCE).await.unwrap(),
        (3 * 2 * RECORDS_PER_PAGE) as i64
    );

    app.shutdown().await;
}

#[tokio::test]
async fn second_start_while_continuing_conflicts() {
    let app = TestApp::spawn_with(TestOptions {
        pages: 3,
        workers_enabled: false,
        invocation_budget_secs: 0,
        ..Default::default()
    })
    .await;
    let range = json!({"startDate": "2024-01-01", "endDate": "2024-01-10"});

    let first: serde_json::Value = app
        .post_sync(range.clone())
        .await
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(first["status"], "continuing");

    let second = app.post_sync(range).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = second.json().await.expect("Failed to parse JSON");
    assert_eq!(body["success"], false);
    assert_eq!(body["existingSyncId"], first["syncRunId"]);
}

#[tokio::test]
async fn continuation_trigger_resumes_the_continuing_run() {
    let app = TestApp::spawn_with(TestOptions {
        workers_enabled: false,
        invocation_budget_secs: 0,
        ..Default::default()
    })
    .await;
    let range = json!({"startDate": "2024-01-01", "endDate": "2024-01-10"});

    let first: serde_json::Value = app
        .post_sync(range)
        .await
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(first["status"], "continuing");
    assert_eq!(first["totalFetched"], RECORDS_PER_PAGE);

    let second = app.post_sync(json!({"continuation": true})).await;
    assert_eq!(second.status(), StatusCode::OK);
    let body: serde_json::Value = second.json().await.expect("Failed to parse JSON");
    assert_eq!(body["syncRunId"], first["syncRunId"]);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["totalFetched"], 2 * RECORDS_PER_PAGE);
}

#[tokio::test]
async fn force_cancel_frees_the_source() {
    let app = TestApp::spawn_with(TestOptions {
        pages: 3,
        workers_enabled: false,
        invocation_budget_secs: 0,
        ..Default::default()
    })
    .await;
    let range = json!({"startDate": "2024-01-01", "endDate": "2024-01-10"});

    let first: serde_json::Value = app
        .post_sync(range.clone())
        .await
        .json()
        .await
        .expect("Failed to parse JSON");
    let id = first["syncRunId"].as_str().unwrap().to_string();

    let cancel = app.post_sync(json!({"forceCancel": true})).await;
    assert_eq!(cancel.status(), StatusCode::OK);
    let body: serde_json::Value = cancel.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancelled"], 1);

    let run = app.get_run(&id).await;
    assert_eq!(run["status"], "cancelled");

    let again = app.post_sync(range).await;
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn paused_source_hands_off_without_fetching() {
    let app = TestApp::spawn_with(TestOptions {
        workers_enabled: false,
        ..Default::default()
    })
    .await;

    let pause = app
        .client
        .put(format!("{}/sync/{}/pause", app.address, SOURCE))
        .json(&json!({"paused": true}))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(pause.status(), StatusCode::OK);

    let body: serde_json::Value = app
        .post_sync(json!({"startDate": "2024-01-01", "endDate": "2024-01-10"}))
        .await
        .json()
        .await
        .expect("Failed to parse JSON");

    assert_eq!(body["status"], "continuing");
    assert_eq!(body["hasMore"], true);
    assert_eq!(body["totalFetched"], 0);
}

#[tokio::test]
async fn unknown_source_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/sync/nope", app.address))
        .json(&json!({}))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_dates_are_rejected() {
    let app = TestApp::spawn().await;

    let garbage = app.post_sync(json!({"startDate": "last tuesday"})).await;
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let inverted = app
        .post_sync(json!({"startDate": "2024-02-01", "endDate": "2024-01-01"}))
        .await;
    assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn page_zero_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post_sync(json!({"startDate": "2024-01-01", "endDate": "2024-01-10", "page": 0}))
        .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(app.store.count_transactions(SOURCE).await.unwrap(), 0);
}

#[tokio::test]
async fn api_key_is_required_when_configured() {
    let app = TestApp::spawn_with(TestOptions {
        api_keys: vec![("ops".to_string(), Secret::new("s3cret".to_string()))],
        ..Default::default()
    })
    .await;
    let range = json!({"startDate": "2024-01-01", "endDate": "2024-01-02"});

    let anonymous = app.post_sync(range.clone()).await;
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let authorized = app
        .client
        .post(format!("{}/sync/{}", app.address, SOURCE))
        .bearer_auth("s3cret")
        .json(&range)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(authorized.status(), StatusCode::OK);
}
