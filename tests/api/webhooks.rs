use chrono::Utc;
use notify_dispatch::providers::sign_timestamped;
use sqlx::Row;
use uuid::Uuid;

use crate::helpers::spawn_app;
use crate::helpers::TestApp;
use crate::helpers::EMAIL_PROVIDER;
use crate::helpers::EMAIL_WEBHOOK_SECRET;

/// Seed a request with one `sent` attempt carrying `message_id`, as if the
/// dispatcher had just handed it to the provider.
async fn seed_sent_attempt(app: &TestApp, message_id: &str, email: &str) -> Uuid {
    let request_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO notification_requests
            (id, tenant_id, recipient_id, recipient_email, channel, notification_type,
             priority, subject, body_text, correlation_id, source, created_at)
        VALUES ($1, $2, 'recipient-1', $3, 'email', 'transactional',
                'normal', 'Hi', 'ok', $4, 'api', now())
        "#,
    )
    .bind(request_id)
    .bind(app.tenant_id)
    .bind(email)
    .bind(Uuid::new_v4())
    .execute(&app.pool)
    .await
    .unwrap();

    sqlx::query(
        r#"
        INSERT INTO notification_attempts
            (id, tenant_id, request_id, attempt_no, provider, provider_message_id,
             state, started_at)
        VALUES ($1, $2, $3, 1, $4, $5, 'sent', now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(app.tenant_id)
    .bind(request_id)
    .bind(EMAIL_PROVIDER)
    .bind(message_id)
    .execute(&app.pool)
    .await
    .unwrap();
    request_id
}

fn signed_event_body(event_id: &str, message_id: &str, event: &str) -> (String, String, String) {
    let body = serde_json::to_string(&serde_json::json!([{
        "sg_event_id": event_id,
        "sg_message_id": message_id,
        "event": event,
        "timestamp": Utc::now().timestamp(),
    }]))
    .unwrap();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign_timestamped(EMAIL_WEBHOOK_SECRET, &timestamp, body.as_bytes());
    (body, timestamp, signature)
}

async fn post_webhook(app: &TestApp, body: &str, timestamp: &str, signature: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/v1/webhooks/{EMAIL_PROVIDER}", app.addr))
        .header("X-Webhook-Signature", signature)
        .header("X-Webhook-Timestamp", timestamp)
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn delivery_callback_reconciles_the_attempt() {
    let app = spawn_app().await;
    let request_id = seed_sent_attempt(&app, "m1", "a@x.com").await;

    let (body, timestamp, signature) = signed_event_body("e1", "m1", "delivered");
    let resp = post_webhook(&app, &body, &timestamp, &signature).await;
    assert_eq!(resp.status(), 200);

    let (state, _, _) = app.wait_for_attempt_state(request_id, "delivered").await;
    assert_eq!(state, "delivered");
}

#[tokio::test]
async fn replayed_callback_is_deduplicated() {
    let app = spawn_app().await;
    let request_id = seed_sent_attempt(&app, "m1", "a@x.com").await;

    let (body, timestamp, signature) = signed_event_body("e1", "m1", "delivered");
    assert_eq!(post_webhook(&app, &body, &timestamp, &signature).await.status(), 200);
    app.wait_for_attempt_state(request_id, "delivered").await;

    // identical payload again: 2xx, no new event row, state untouched
    let resp = post_webhook(&app, &body, &timestamp, &signature).await;
    assert_eq!(resp.status(), 200);

    let events: i64 = sqlx::query(
        "SELECT count(*) AS n FROM webhook_events WHERE provider = $1 AND provider_event_id = 'e1'",
    )
    .bind(EMAIL_PROVIDER)
    .fetch_one(&app.pool)
    .await
    .unwrap()
    .get("n");
    assert_eq!(events, 1);
    assert_eq!(app.attempt_count(request_id).await, 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_without_touching_state() {
    let app = spawn_app().await;
    let request_id = seed_sent_attempt(&app, "m1", "a@x.com").await;

    let (body, timestamp, _) = signed_event_body("e1", "m1", "delivered");
    let forged = sign_timestamped("wrong-secret", &timestamp, body.as_bytes());
    let resp = post_webhook(&app, &body, &timestamp, &forged).await;
    assert_eq!(resp.status(), 401);

    let (state, _, _) = app.latest_attempt(request_id).await.unwrap();
    assert_eq!(state, "sent");
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let app = spawn_app().await;
    seed_sent_attempt(&app, "m1", "a@x.com").await;

    let body = serde_json::to_string(&serde_json::json!([{
        "sg_event_id": "e1", "sg_message_id": "m1", "event": "delivered"
    }]))
    .unwrap();
    let timestamp = (Utc::now().timestamp() - 400).to_string();
    let signature = sign_timestamped(EMAIL_WEBHOOK_SECRET, &timestamp, body.as_bytes());
    let resp = post_webhook(&app, &body, &timestamp, &signature).await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn hard_bounce_appends_a_suppression_entry() {
    let app = spawn_app().await;
    let request_id = seed_sent_attempt(&app, "m9", "bounce@x.com").await;

    let (body, timestamp, signature) = signed_event_body("e9", "m9", "bounce");
    assert_eq!(post_webhook(&app, &body, &timestamp, &signature).await.status(), 200);
    app.wait_for_attempt_state(request_id, "bounced").await;

    let suppressed: i64 = sqlx::query(
        r#"
        SELECT count(*) AS n FROM suppression_entries
        WHERE tenant_id = $1 AND channel = 'email' AND reason = 'hard_bounce'
        "#,
    )
    .bind(app.tenant_id)
    .fetch_one(&app.pool)
    .await
    .unwrap()
    .get("n");
    assert_eq!(suppressed, 1);
}

#[tokio::test]
async fn terminal_states_never_regress_from_late_callbacks() {
    let app = spawn_app().await;
    let request_id = seed_sent_attempt(&app, "m1", "a@x.com").await;

    let (body, timestamp, signature) = signed_event_body("e1", "m1", "delivered");
    post_webhook(&app, &body, &timestamp, &signature).await;
    app.wait_for_attempt_state(request_id, "delivered").await;

    // a late "processed" (maps to sent) must not regress delivered
    let (body, timestamp, signature) = signed_event_body("e2", "m1", "processed");
    assert_eq!(post_webhook(&app, &body, &timestamp, &signature).await.status(), 200);
    let (state, _, _) = app.latest_attempt(request_id).await.unwrap();
    assert_eq!(state, "delivered");
}

#[tokio::test]
async fn unknown_provider_is_a_404() {
    let app = spawn_app().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/webhooks/nonexistent", app.addr))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
