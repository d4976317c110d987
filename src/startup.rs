use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use redis::aio::ConnectionManager;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::compliance::ComplianceGate;
use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::degradation::DegradationController;
use crate::dispatcher::DispatchContext;
use crate::providers::build_providers;
use crate::rate_limit::InMemoryTokenStore;
use crate::rate_limit::RateLimiter;
use crate::rate_limit::RedisTokenStore;
use crate::rate_limit::TokenStore;
use crate::retry::RetryPolicy;
use crate::routes::detailed_health;
use crate::routes::live;
use crate::routes::post_notification;
use crate::routes::post_notification_batch;
use crate::routes::post_webhook;
use crate::routes::ready;
use crate::routes::startup_probe;
use crate::routes::HealthState;
use crate::selector::ProviderDirectory;

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy_with(db_cfg.connection())
}

/// Wrapper for the externally visible base URL (what providers sign against
/// in URL-based webhook schemes).
pub struct AppBaseUrl(pub String);

/// Process-wide dependencies built once at startup and shared by the HTTP
/// surface and every background worker.
pub struct SharedState {
    pub pool: PgPool,
    pub redis: Option<ConnectionManager>,
    pub directory: Arc<ProviderDirectory>,
    pub degradation: Arc<DegradationController>,
    pub queue_healthy: Arc<AtomicBool>,
    pub dispatch: Arc<DispatchContext>,
}

pub async fn build_shared_state(cfg: &Settings) -> Result<SharedState, anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);

    let redis = match &cfg.cache.url {
        Some(url) => {
            let client = redis::Client::open(url.expose_secret().as_str())?;
            Some(ConnectionManager::new(client).await?)
        }
        None => None,
    };

    let providers = build_providers(&cfg.providers);
    let mut breaker_names: Vec<String> = providers.iter().map(|p| p.id().to_string()).collect();
    breaker_names.extend(["postgres".to_string(), "amqp".to_string(), "redis".to_string()]);
    let breakers = CircuitBreakerRegistry::new(breaker_names, CircuitBreakerConfig::default());
    let directory = Arc::new(ProviderDirectory::new(providers, breakers));

    let store: Arc<dyn TokenStore> = match redis.clone() {
        Some(connection) => Arc::new(RedisTokenStore::new(connection)),
        None => Arc::new(InMemoryTokenStore::new()),
    };
    let limiter = RateLimiter::new(store, cfg.rate_limits);

    let degradation = Arc::new(DegradationController::new());
    let queue_healthy = Arc::new(AtomicBool::new(false));

    let dispatch = Arc::new(DispatchContext {
        pool: pool.clone(),
        directory: directory.clone(),
        compliance: ComplianceGate::new(pool.clone()),
        limiter,
        retry: RetryPolicy::default(),
        degradation: degradation.clone(),
        lease: Duration::from_secs(cfg.dispatcher.lease_seconds as u64),
        poll_interval: Duration::from_millis(cfg.dispatcher.poll_interval_ms),
    });

    Ok(SharedState {
        pool,
        redis,
        directory,
        degradation,
        queue_healthy,
        dispatch,
    })
}

/// Wrapper for actix's `Server` with access to the bound port (randomized
/// ports in tests).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings, state: &SharedState) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let server = run(listener, cfg, state).await?;
        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Consumes `self`; either `.await` it or hand it to `tokio::spawn`.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

/// Declare the API surface. The listener is already bound; binding failures
/// belong to `Application::build`.
pub async fn run(
    listener: TcpListener,
    cfg: Settings,
    state: &SharedState,
) -> Result<Server, anyhow::Error> {
    let pool = Data::new(state.pool.clone());
    let directory = Data::new(state.directory.clone());
    let degradation: Data<DegradationController> = Data::from(state.degradation.clone());
    let limiter = Data::new(state.dispatch.limiter.clone());
    let health_state = Data::new(HealthState {
        pool: state.pool.clone(),
        redis: state.redis.clone(),
        queue_healthy: state.queue_healthy.clone(),
        directory: state.directory.clone(),
        degradation: state.degradation.clone(),
    });
    let base_url = Data::new(AppBaseUrl(cfg.application.base_url.clone()));

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health/live", web::get().to(live))
            .route("/health/ready", web::get().to(ready))
            .route("/health/startup", web::get().to(startup_probe))
            .route("/health/detailed", web::get().to(detailed_health))
            .service(
                web::scope("/v1")
                    .route("/notifications", web::post().to(post_notification))
                    .route("/notifications/batch", web::post().to(post_notification_batch))
                    .route("/webhooks/{provider}", web::post().to(post_webhook)),
            )
            .app_data(pool.clone())
            .app_data(directory.clone())
            .app_data(degradation.clone())
            .app_data(limiter.clone())
            .app_data(health_state.clone())
            .app_data(base_url.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
