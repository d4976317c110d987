use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use actix_web::web;
use actix_web::HttpResponse;
use redis::aio::ConnectionManager;
use serde_json::json;
use sqlx::PgPool;

use crate::degradation::DegradationController;
use crate::selector::ProviderDirectory;

/// Shared dependencies the health endpoints report on.
pub struct HealthState {
    pub pool: PgPool,
    pub redis: Option<ConnectionManager>,
    pub queue_healthy: Arc<AtomicBool>,
    pub directory: Arc<ProviderDirectory>,
    pub degradation: Arc<DegradationController>,
}

/// Liveness is a static ok: it must never touch a resource, so a saturated
/// dependency cannot get the process killed.
pub async fn live() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn startup_probe() -> HttpResponse {
    // serving traffic at all means startup validation passed
    HttpResponse::Ok().json(json!({ "status": "started" }))
}

/// Ready means: database reachable, queue consumer alive, cache reachable
/// (when configured), and at least one provider usable.
pub async fn ready(state: web::Data<HealthState>) -> HttpResponse {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let cache = match state.redis.clone() {
        None => true,
        Some(mut conn) => redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok(),
    };
    let queue = state.queue_healthy.load(Ordering::Relaxed);
    let providers = state.directory.any_provider_healthy();

    let body = json!({
        "database": database,
        "queue": queue,
        "cache": cache,
        "providers": providers,
    });
    if database && queue && cache && providers {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_health(state: web::Data<HealthState>) -> HttpResponse {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    HttpResponse::Ok().json(json!({
        "mode": state.degradation.mode(),
        "database": database,
        "queue": state.queue_healthy.load(Ordering::Relaxed),
        "circuits": state.directory.breakers().snapshot_all(),
        "providers": state.directory.health().snapshot(),
    }))
}
