use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::Channel;
use crate::domain::Priority;
use crate::repository::PgTransaction;

/// Row written in the same transaction as its request; the publisher turns
/// it into a dispatch job later, making persist-and-enqueue atomic.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub channel: Channel,
    pub priority: Priority,
    pub not_before: Option<DateTime<Utc>>,
}

#[tracing::instrument(skip(transaction), fields(%request_id))]
pub async fn insert_outbox_entry(
    transaction: &mut PgTransaction,
    request_id: Uuid,
    tenant_id: Uuid,
    channel: Channel,
    priority: Priority,
    not_before: Option<DateTime<Utc>>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox
            (id, request_id, tenant_id, channel, priority, not_before, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request_id)
    .bind(tenant_id)
    .bind(channel.as_str())
    .bind(priority.as_str())
    .bind(not_before)
    .execute(&mut **transaction)
    .await
    .context("failed to insert outbox entry")?;
    Ok(())
}

/// Lock a batch of unpublished entries for this publisher tick. Rows stay
/// locked until the surrounding transaction commits, so concurrent
/// publishers skip them.
pub async fn fetch_unpublished(
    transaction: &mut PgTransaction,
    batch: i64,
) -> Result<Vec<OutboxEntry>, anyhow::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, request_id, tenant_id, channel, priority, not_before
        FROM outbox
        WHERE published_at IS NULL
        ORDER BY created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(batch)
    .fetch_all(&mut **transaction)
    .await
    .context("failed to fetch outbox batch")?;

    rows.into_iter()
        .map(|row| {
            let channel: String = row.try_get("channel")?;
            let priority: String = row.try_get("priority")?;
            Ok(OutboxEntry {
                id: row.try_get("id")?,
                request_id: row.try_get("request_id")?,
                tenant_id: row.try_get("tenant_id")?,
                channel: Channel::parse(&channel).map_err(anyhow::Error::msg)?,
                priority: Priority::parse(&priority).map_err(anyhow::Error::msg)?,
                not_before: row.try_get("not_before")?,
            })
        })
        .collect()
}

pub async fn mark_published(
    transaction: &mut PgTransaction,
    ids: &[Uuid],
) -> Result<(), anyhow::Error> {
    sqlx::query("UPDATE outbox SET published_at = now() WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut **transaction)
        .await
        .context("failed to mark outbox entries published")?;
    Ok(())
}
