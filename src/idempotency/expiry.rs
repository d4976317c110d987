use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;

use crate::configuration::Settings;
use crate::startup::get_connection_pool;

async fn expire_old_keys(pool: &PgPool, ttl_hours: u32) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM idempotency WHERE now() - created_at > make_interval(hours => $1)")
        .bind(ttl_hours as i32)
        .execute(pool)
        .await?;
    Ok(())
}

async fn expire_keys_loop(
    pool: &PgPool,
    ttl_hours: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    loop {
        let sleep = match expire_old_keys(pool, ttl_hours).await {
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, "idempotency expiry sweep failed");
                Duration::from_secs(60)
            }
            Ok(_) => Duration::from_secs(600),
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Background sweeper deleting idempotency records past their TTL. Run as a
/// separate worker alongside the API.
pub async fn init_expiry_worker(
    cfg: Settings,
    shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    expire_keys_loop(&pool, cfg.idempotency.ttl_hours, shutdown).await
}
