use notify_dispatch::domain::address_hash;
use notify_dispatch::domain::Channel;
use notify_dispatch::repository;
use sqlx::Row;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::request_id_from;
use crate::helpers::spawn_app;

#[tokio::test]
async fn valid_request_is_accepted_and_persisted() {
    let app = spawn_app().await;
    let resp = app.post_notification(&app.email_body("a@x.com")).await;
    assert_eq!(resp.status(), 202);

    let body: serde_json::Value = resp.json().await.unwrap();
    let request_id = request_id_from(&body);

    let row = sqlx::query("SELECT channel, source FROM notification_requests WHERE id = $1")
        .bind(request_id)
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("channel"), "email");
    assert_eq!(row.get::<String, _>("source"), "api");
}

#[tokio::test]
async fn missing_body_and_template_is_a_400_problem() {
    let app = spawn_app().await;
    let mut body = app.email_body("a@x.com");
    body["body_text"] = serde_json::Value::Null;
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert!(problem.get("correlation_id").is_some());
    assert_eq!(problem["status"], 400);
}

#[tokio::test]
async fn body_with_template_and_inline_content_is_rejected() {
    let app = spawn_app().await;
    let mut body = app.email_body("a@x.com");
    body["template_ref"] = serde_json::json!("welcome-v2");
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn happy_path_email_reaches_sent_with_the_provider_message_id() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "m1"))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let mut body = app.email_body("a@x.com");
    body["idempotency_key"] = serde_json::json!("k1");
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 202);
    let request_id = request_id_from(&resp.json().await.unwrap());

    let (state, provider_message_id, attempt_no) =
        app.wait_for_attempt_state(request_id, "sent").await;
    assert_eq!(state, "sent");
    assert_eq!(provider_message_id.as_deref(), Some("m1"));
    assert_eq!(attempt_no, 1);
}

#[tokio::test]
async fn idempotent_replay_returns_the_original_request_id() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "m1"))
        .mount(&app.email_server)
        .await;

    let mut body = app.email_body("a@x.com");
    body["idempotency_key"] = serde_json::json!("replay-key");

    let first = app.post_notification(&body).await;
    assert_eq!(first.status(), 202);
    let first_id = request_id_from(&first.json().await.unwrap());
    app.wait_for_attempt_state(first_id, "sent").await;

    let second = app.post_notification(&body).await;
    assert!(second.status().is_success());
    let second_id = request_id_from(&second.json().await.unwrap());
    assert_eq!(first_id, second_id);

    // no second request row, no second attempt
    let requests: i64 =
        sqlx::query("SELECT count(*) AS n FROM notification_requests WHERE tenant_id = $1")
            .bind(app.tenant_id)
            .fetch_one(&app.pool)
            .await
            .unwrap()
            .get("n");
    assert_eq!(requests, 1);
    assert_eq!(app.attempt_count(first_id).await, 1);
}

#[tokio::test]
async fn same_key_with_a_different_body_is_a_409() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&app.email_server)
        .await;

    let mut body = app.email_body("a@x.com");
    body["idempotency_key"] = serde_json::json!("conflict-key");
    assert_eq!(app.post_notification(&body).await.status(), 202);

    body["subject"] = serde_json::json!("Completely different");
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn suppressed_recipient_terminates_without_a_provider_call() {
    let app = spawn_app().await;
    // zero expected requests: the mock asserts no provider call on drop
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&app.email_server)
        .await;

    repository::insert_suppression(
        &app.pool,
        app.tenant_id,
        Channel::Email,
        &address_hash("blocked@x.com"),
        "hard_bounce",
    )
    .await
    .unwrap();

    let resp = app.post_notification(&app.email_body("blocked@x.com")).await;
    assert_eq!(resp.status(), 202);
    let request_id = request_id_from(&resp.json().await.unwrap());

    let (state, _, _) = app.wait_for_attempt_state(request_id, "suppressed").await;
    assert_eq!(state, "suppressed");
}

#[tokio::test]
async fn marketing_without_consent_is_rejected_terminally() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&app.email_server)
        .await;

    let mut body = app.email_body("a@x.com");
    body["type"] = serde_json::json!("marketing");
    body["priority"] = serde_json::json!("normal");
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 202);
    let request_id = request_id_from(&resp.json().await.unwrap());

    app.wait_for_attempt_state(request_id, "rejected").await;
    let reason: Option<String> =
        sqlx::query("SELECT reason_code FROM notification_attempts WHERE request_id = $1")
            .bind(request_id)
            .fetch_one(&app.pool)
            .await
            .unwrap()
            .get("reason_code");
    assert_eq!(reason.as_deref(), Some("no_consent"));
}

#[tokio::test]
async fn transient_provider_failure_is_retried_on_a_fresh_attempt() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&app.email_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "m2"))
        .mount(&app.email_server)
        .await;

    let resp = app.post_notification(&app.email_body("a@x.com")).await;
    let request_id = request_id_from(&resp.json().await.unwrap());

    let (state, provider_message_id, attempt_no) =
        app.wait_for_attempt_state(request_id, "sent").await;
    assert_eq!(state, "sent");
    assert_eq!(provider_message_id.as_deref(), Some("m2"));
    assert_eq!(attempt_no, 2);

    // attempt 1 is terminal failed; attempt numbers are gapless
    let rows = sqlx::query(
        "SELECT attempt_no, state FROM notification_attempts WHERE request_id = $1 ORDER BY attempt_no",
    )
    .bind(request_id)
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<i32, _>("attempt_no"), 1);
    assert_eq!(rows[0].get::<String, _>("state"), "failed");
}

#[tokio::test]
async fn batch_reports_per_item_results() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&app.email_server)
        .await;

    let mut invalid = app.email_body("not-an-email");
    invalid["recipient"]["email"] = serde_json::json!("not-an-email");
    let batch = serde_json::json!([app.email_body("a@x.com"), invalid]);

    let resp = app.post_notification_batch(&batch).await;
    assert_eq!(resp.status(), 200);
    let results: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["status"], 202);
    assert!(results[0]["request_id"].is_string());
    assert_eq!(results[1]["status"], 400);
    assert!(results[1]["error"].is_string());
}
