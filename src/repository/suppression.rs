use anyhow::Context;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::Channel;

#[tracing::instrument(skip(pool, address_hash), fields(%tenant_id, channel = %channel))]
pub async fn is_suppressed(
    pool: &PgPool,
    tenant_id: Uuid,
    channel: Channel,
    address_hash: &str,
) -> Result<bool, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM suppression_entries
            WHERE tenant_id = $1 AND channel = $2 AND recipient_address_hash = $3
        ) AS suppressed
        "#,
    )
    .bind(tenant_id)
    .bind(channel.as_str())
    .bind(address_hash)
    .fetch_one(pool)
    .await
    .context("failed to check suppression list")?;
    Ok(row.get("suppressed"))
}

/// Append a hard block. Idempotent; repeated bounces for one address keep
/// the original entry.
#[tracing::instrument(skip(pool, address_hash), fields(%tenant_id, channel = %channel, reason))]
pub async fn insert_suppression(
    pool: &PgPool,
    tenant_id: Uuid,
    channel: Channel,
    address_hash: &str,
    reason: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO suppression_entries
            (tenant_id, channel, recipient_address_hash, reason, created_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (tenant_id, channel, recipient_address_hash) DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .bind(channel.as_str())
    .bind(address_hash)
    .bind(reason)
    .execute(pool)
    .await
    .context("failed to insert suppression entry")?;
    Ok(())
}
