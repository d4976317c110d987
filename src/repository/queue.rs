use std::time::Duration;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::Channel;
use crate::domain::Priority;
use crate::repository::PgTransaction;

/// One executable unit of the dispatch queue. `channel` may differ from the
/// request's original channel after a degradation fallback.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub attempt_no: i32,
    pub channel: Channel,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
}

#[tracing::instrument(skip(transaction), fields(%request_id, attempt_no))]
pub async fn enqueue_job(
    transaction: &mut PgTransaction,
    request_id: Uuid,
    tenant_id: Uuid,
    attempt_no: i32,
    channel: Channel,
    priority: Priority,
    scheduled_at: DateTime<Utc>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO dispatch_queue
            (id, request_id, tenant_id, attempt_no, channel, priority_rank,
             scheduled_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (request_id, attempt_no) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request_id)
    .bind(tenant_id)
    .bind(attempt_no)
    .bind(channel.as_str())
    .bind(priority.rank())
    .bind(scheduled_at)
    .execute(&mut **transaction)
    .await
    .context("failed to enqueue dispatch job")?;
    Ok(())
}

/// Claim the next due job with a lease, in one statement. The row lock is
/// released when the statement commits, so nothing is held while the worker
/// does provider I/O; an expired lease makes the job claimable again
/// (at-least-once).
#[tracing::instrument(skip(pool))]
pub async fn claim_due_job(
    pool: &PgPool,
    lease: Duration,
) -> Result<Option<JobRow>, anyhow::Error> {
    let row = sqlx::query(
        r#"
        UPDATE dispatch_queue
        SET leased_until = now() + make_interval(secs => $1)
        WHERE id = (
            SELECT id
            FROM dispatch_queue
            WHERE scheduled_at <= now()
              AND (leased_until IS NULL OR leased_until < now())
            ORDER BY priority_rank DESC, scheduled_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, request_id, tenant_id, attempt_no, channel, priority_rank, scheduled_at
        "#,
    )
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await
    .context("failed to claim dispatch job")?;
    row.map(job_from_row).transpose()
}

/// Ack: the job reached a terminal business outcome.
#[tracing::instrument(skip(pool), fields(%job_id))]
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM dispatch_queue WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to delete dispatch job")?;
    Ok(())
}

/// Requeue with a delay. `next_attempt_no` advances the slot after a failed
/// provider call; deferrals (rate limit, shed, quiet hours) keep the current
/// one. A fallback decision may rewrite the channel.
#[tracing::instrument(skip(pool), fields(%job_id))]
pub async fn reschedule_job(
    pool: &PgPool,
    job_id: Uuid,
    delay: Duration,
    next_attempt_no: Option<i32>,
    channel: Option<Channel>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        UPDATE dispatch_queue
        SET scheduled_at = now() + make_interval(secs => $2),
            attempt_no = COALESCE($3, attempt_no),
            channel = COALESCE($4, channel),
            leased_until = NULL
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(delay.as_secs_f64())
    .bind(next_attempt_no)
    .bind(channel.map(|c| c.as_str()))
    .execute(pool)
    .await
    .context("failed to reschedule dispatch job")?;
    Ok(())
}

fn job_from_row(row: PgRow) -> Result<JobRow, anyhow::Error> {
    let channel: String = row.try_get("channel")?;
    let priority_rank: i16 = row.try_get("priority_rank")?;
    let priority = match priority_rank {
        0 => Priority::Low,
        1 => Priority::Normal,
        2 => Priority::High,
        _ => Priority::Critical,
    };
    Ok(JobRow {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        tenant_id: row.try_get("tenant_id")?,
        attempt_no: row.try_get("attempt_no")?,
        channel: Channel::parse(&channel).map_err(anyhow::Error::msg)?,
        priority,
        scheduled_at: row.try_get("scheduled_at")?,
    })
}
