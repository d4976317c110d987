use anyhow::Context;
use sqlx::PgPool;

/// Record an inbound callback. Returns `false` when the
/// `(provider, provider_event_id)` pair was already seen, in which case the
/// caller acks and skips.
#[tracing::instrument(skip(pool, payload), fields(provider, provider_event_id))]
pub async fn insert_webhook_event(
    pool: &PgPool,
    provider: &str,
    provider_event_id: &str,
    payload: &serde_json::Value,
) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_events (provider, provider_event_id, payload, received_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (provider, provider_event_id) DO NOTHING
        "#,
    )
    .bind(provider)
    .bind(provider_event_id)
    .bind(payload)
    .execute(pool)
    .await
    .context("failed to record webhook event")?;
    Ok(result.rows_affected() > 0)
}
