use std::time::Duration;

use chrono::Timelike;
use chrono::Utc;
use notify_dispatch::domain::Channel;
use notify_dispatch::domain::NotificationType;
use notify_dispatch::repository;
use sqlx::Row;
use wiremock::matchers::method;
use wiremock::matchers::path_regex;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::request_id_from;
use crate::helpers::spawn_app;

/// A timezone name in which the current wall-clock hour is 23 (inside quiet
/// hours), regardless of when the test runs. `Etc/GMT+N` is UTC-N.
fn quiet_hours_timezone() -> String {
    let utc_hour = Utc::now().hour() as i32;
    let delta = (23 - utc_hour).rem_euclid(24);
    match delta {
        0 => "Etc/GMT".to_string(),
        d if d <= 12 => format!("Etc/GMT-{d}"),
        d => format!("Etc/GMT+{}", 24 - d),
    }
}

#[tokio::test]
async fn quiet_hours_sms_is_rescheduled_not_sent() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/2010-04-01/.*"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&app.sms_server)
        .await;

    repository::grant_consent(
        &app.pool,
        app.tenant_id,
        "recipient-1",
        Channel::Sms,
        NotificationType::Marketing,
        None,
        None,
    )
    .await
    .unwrap();

    let body = serde_json::json!({
        "tenant_id": app.tenant_id,
        "recipient": {
            "id": "recipient-1",
            "phone": "+14155550123",
            "timezone": quiet_hours_timezone(),
        },
        "channel": "sms",
        "type": "marketing",
        "priority": "normal",
        "body_text": "late night promo",
    });
    let resp = app.post_notification(&body).await;
    assert_eq!(resp.status(), 202);
    let request_id = request_id_from(&resp.json().await.unwrap());

    // the job must end up parked until the next 08:00 local window
    let mut rescheduled = false;
    for _ in 0..100 {
        let row = sqlx::query(
            r#"
            SELECT scheduled_at > now() + interval '1 hour' AS parked
            FROM dispatch_queue
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&app.pool)
        .await
        .unwrap();
        if row.map(|r| r.get::<bool, _>("parked")).unwrap_or(false) {
            rescheduled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(rescheduled, "quiet-hours job was never parked");
    // no attempt row and no provider call were made
    assert_eq!(app.attempt_count(request_id).await, 0);
}

#[tokio::test]
async fn consented_marketing_email_goes_out() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(wiremock::matchers::path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "mk-1"))
        .expect(1)
        .mount(&app.email_server)
        .await;

    repository::grant_consent(
        &app.pool,
        app.tenant_id,
        "recipient-1",
        Channel::Email,
        NotificationType::Marketing,
        None,
        None,
    )
    .await
    .unwrap();

    let mut body = app.email_body("a@x.com");
    body["type"] = serde_json::json!("marketing");
    body["priority"] = serde_json::json!("normal");
    let resp = app.post_notification(&body).await;
    let request_id = request_id_from(&resp.json().await.unwrap());

    let (state, provider_message_id, _) = app.wait_for_attempt_state(request_id, "sent").await;
    assert_eq!(state, "sent");
    assert_eq!(provider_message_id.as_deref(), Some("mk-1"));
}

#[tokio::test]
async fn expired_consent_is_not_honored() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(wiremock::matchers::path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&app.email_server)
        .await;

    repository::grant_consent(
        &app.pool,
        app.tenant_id,
        "recipient-1",
        Channel::Email,
        NotificationType::Marketing,
        None,
        Some(Utc::now() - chrono::Duration::days(1)),
    )
    .await
    .unwrap();

    let mut body = app.email_body("a@x.com");
    body["type"] = serde_json::json!("marketing");
    let resp = app.post_notification(&body).await;
    let request_id = request_id_from(&resp.json().await.unwrap());

    app.wait_for_attempt_state(request_id, "rejected").await;
}

#[tokio::test]
async fn venue_scoped_consent_is_not_honored_for_another_venue() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(wiremock::matchers::path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&app.email_server)
        .await;

    let consented_venue = uuid::Uuid::new_v4();
    let other_venue = uuid::Uuid::new_v4();
    repository::grant_consent(
        &app.pool,
        app.tenant_id,
        "recipient-1",
        Channel::Email,
        NotificationType::Marketing,
        Some(consented_venue),
        None,
    )
    .await
    .unwrap();

    let mut body = app.email_body("a@x.com");
    body["type"] = serde_json::json!("marketing");
    body["venue_id"] = serde_json::json!(other_venue);
    let resp = app.post_notification(&body).await;
    let request_id = request_id_from(&resp.json().await.unwrap());

    app.wait_for_attempt_state(request_id, "rejected").await;
}
