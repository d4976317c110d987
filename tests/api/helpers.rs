use std::sync::atomic::Ordering;
use std::time::Duration;

use notify_dispatch::configuration::AdapterKind;
use notify_dispatch::configuration::ApplicationSettings;
use notify_dispatch::configuration::CacheSettings;
use notify_dispatch::configuration::ChannelSettings;
use notify_dispatch::configuration::DatabaseSettings;
use notify_dispatch::configuration::DispatcherSettings;
use notify_dispatch::configuration::IdempotencySettings;
use notify_dispatch::configuration::ProviderFleetSettings;
use notify_dispatch::configuration::ProviderSettings;
use notify_dispatch::configuration::QueueSettings;
use notify_dispatch::configuration::RateLimitSettings;
use notify_dispatch::configuration::RecipientDirectorySettings;
use notify_dispatch::configuration::Settings;
use notify_dispatch::dispatcher::init_dispatch_workers;
use notify_dispatch::outbox::init_outbox_publisher;
use notify_dispatch::startup::build_shared_state;
use notify_dispatch::startup::Application;
use notify_dispatch::telemetry::get_subscriber;
use notify_dispatch::telemetry::init_subscriber;
use once_cell::sync::Lazy;
use secrecy::Secret;
use sqlx::Connection;
use sqlx::Executor;
use sqlx::PgConnection;
use sqlx::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use uuid::Uuid;
use wiremock::MockServer;

/// Opt in to test logs with `TEST_LOG=true cargo test | bunyan`.
static TRACING: Lazy<()> = Lazy::new(|| match std::env::var("TEST_LOG") {
    Ok(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::stdout);
        init_subscriber(subscriber);
    }
    Err(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::sink);
        init_subscriber(subscriber);
    }
});

pub struct TestApp {
    pub addr: String,
    pub pool: PgPool,
    pub email_server: MockServer,
    pub sms_server: MockServer,
    pub tenant_id: Uuid,
    // dropping this would stop the background workers mid-test
    _shutdown: watch::Sender<bool>,
}

pub const EMAIL_PROVIDER: &str = "sendgrid-primary";
pub const EMAIL_WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const SMS_PROVIDER: &str = "twilio-primary";
pub const SMS_WEBHOOK_SECRET: &str = "test-twilio-token";

fn test_settings(email_url: &str, sms_url: &str) -> Settings {
    Settings {
        application: ApplicationSettings {
            host: "127.0.0.1".into(),
            port: 0,
            base_url: "http://127.0.0.1".into(),
            signing_key: Secret::new("integration-test-signing-key-0123456789".into()),
        },
        database: DatabaseSettings {
            username: "postgres".into(),
            password: Secret::new("password".into()),
            port: 5432,
            host: "127.0.0.1".into(),
            database_name: Uuid::new_v4().to_string(),
            require_ssl: false,
        },
        queue: QueueSettings {
            url: Secret::new("amqp://127.0.0.1:5672".into()),
            exchange: "domain-events".into(),
            queue: "notify-dispatch".into(),
            prefetch: 20,
            signature_key: None,
            enabled: false,
        },
        cache: CacheSettings { url: None },
        providers: ProviderFleetSettings {
            email: ChannelSettings {
                enabled: true,
                primary: Some(ProviderSettings {
                    adapter: AdapterKind::Sendgrid,
                    name: EMAIL_PROVIDER.into(),
                    base_url: email_url.into(),
                    api_key: Secret::new("test-sendgrid-key".into()),
                    account_ref: None,
                    sender: Some("no-reply@test.invalid".into()),
                    webhook_secret: Secret::new(EMAIL_WEBHOOK_SECRET.into()),
                    timeout_ms: 5000,
                }),
                backup: None,
            },
            sms: ChannelSettings {
                enabled: true,
                primary: Some(ProviderSettings {
                    adapter: AdapterKind::Twilio,
                    name: SMS_PROVIDER.into(),
                    base_url: sms_url.into(),
                    api_key: Secret::new(SMS_WEBHOOK_SECRET.into()),
                    account_ref: Some("AC00000000000000000000000000000000".into()),
                    sender: Some("+15550001111".into()),
                    webhook_secret: Secret::new(SMS_WEBHOOK_SECRET.into()),
                    timeout_ms: 5000,
                }),
                backup: None,
            },
            push: ChannelSettings {
                enabled: false,
                primary: None,
                backup: None,
            },
        },
        dispatcher: DispatcherSettings {
            workers: Some(2),
            max_workers: 8,
            lease_seconds: 10,
            poll_interval_ms: 50,
            drain_timeout_seconds: 5,
        },
        rate_limits: RateLimitSettings {
            recipient_rate_per_sec: 50.0,
            recipient_burst: 100.0,
            principal_rate_per_sec: 50.0,
            principal_burst: 100.0,
            tenant_rate_per_sec: 100.0,
            tenant_burst: 500.0,
            ip_rate_per_sec: 100.0,
            ip_burst: 1000.0,
        },
        recipient_directory: RecipientDirectorySettings {
            base_url: None,
            connect_timeout_ms: 3000,
            total_timeout_ms: 10000,
            cache_ttl_seconds: 300,
        },
        idempotency: IdempotencySettings { ttl_hours: 24 },
    }
}

/// Create a randomized database and run the migrations against it.
async fn configure_database(cfg: &DatabaseSettings) -> PgPool {
    let mut conn = PgConnection::connect_with(&cfg.connection_without_db())
        .await
        .expect("postgres must be running");
    conn.execute(format!(r#"CREATE DATABASE "{}";"#, cfg.database_name).as_str())
        .await
        .expect("failed to create test database");

    let pool = PgPool::connect_with(cfg.connection())
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to migrate test database");
    pool
}

pub async fn spawn_app() -> TestApp {
    Lazy::force(&TRACING);

    let email_server = MockServer::start().await;
    let sms_server = MockServer::start().await;
    let cfg = test_settings(&email_server.uri(), &sms_server.uri());
    configure_database(&cfg.database).await;

    let state = build_shared_state(&cfg).await.expect("failed to build shared state");
    // the bus is disabled for tests; readiness treats it as healthy
    state.queue_healthy.store(true, Ordering::Relaxed);

    let app = Application::build(cfg.clone(), &state)
        .await
        .expect("failed to build application");
    let addr = format!("http://127.0.0.1:{}", app.get_port());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(app.run_until_stopped());
    tokio::spawn(init_dispatch_workers(
        state.dispatch.clone(),
        2,
        shutdown_rx.clone(),
    ));
    tokio::spawn(init_outbox_publisher(
        state.pool.clone(),
        Duration::from_millis(100),
        shutdown_rx.clone(),
    ));

    TestApp {
        addr,
        pool: state.pool.clone(),
        email_server,
        sms_server,
        tenant_id: Uuid::new_v4(),
        _shutdown: shutdown_tx,
    }
}

impl TestApp {
    pub async fn post_notification(&self, body: &serde_json::Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/v1/notifications", self.addr))
            .json(body)
            .send()
            .await
            .expect("failed to execute request")
    }

    pub async fn post_notification_batch(&self, body: &serde_json::Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/v1/notifications/batch", self.addr))
            .json(body)
            .send()
            .await
            .expect("failed to execute request")
    }

    /// A valid transactional email body for this app's tenant.
    pub fn email_body(&self, recipient_email: &str) -> serde_json::Value {
        serde_json::json!({
            "tenant_id": self.tenant_id,
            "recipient": { "id": "recipient-1", "email": recipient_email },
            "channel": "email",
            "type": "transactional",
            "subject": "Hi",
            "body_text": "ok",
        })
    }

    pub async fn latest_attempt(
        &self,
        request_id: Uuid,
    ) -> Option<(String, Option<String>, i32)> {
        sqlx::query(
            r#"
            SELECT state, provider_message_id, attempt_no
            FROM notification_attempts
            WHERE request_id = $1
            ORDER BY attempt_no DESC
            LIMIT 1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .expect("failed to query attempts")
        .map(|row| {
            (
                row.get("state"),
                row.get("provider_message_id"),
                row.get("attempt_no"),
            )
        })
    }

    /// Poll the attempt log until the request reaches `state` or 10s pass.
    pub async fn wait_for_attempt_state(&self, request_id: Uuid, state: &str) -> (String, Option<String>, i32) {
        for _ in 0..100 {
            if let Some(attempt) = self.latest_attempt(request_id).await {
                if attempt.0 == state {
                    return attempt;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!(
            "request {request_id} never reached state {state}; latest: {:?}",
            self.latest_attempt(request_id).await
        );
    }

    pub async fn attempt_count(&self, request_id: Uuid) -> i64 {
        sqlx::query("SELECT count(*) AS n FROM notification_attempts WHERE request_id = $1")
            .bind(request_id)
            .fetch_one(&self.pool)
            .await
            .expect("failed to count attempts")
            .get("n")
    }
}

pub fn request_id_from(body: &serde_json::Value) -> Uuid {
    body.get("request_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("response carries no request_id")
}
