use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

/// A job that exhausted its retry budget without a terminal business
/// outcome, kept with enough context to replay or inspect by hand.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub attempt_no: i32,
    pub reason: String,
    pub error_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[tracing::instrument(skip(pool, error_context), fields(%request_id, reason))]
pub async fn insert_dead_letter(
    pool: &PgPool,
    tenant_id: Uuid,
    request_id: Uuid,
    attempt_no: i32,
    reason: &str,
    error_context: serde_json::Value,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters
            (id, tenant_id, request_id, attempt_no, reason, error_context, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(request_id)
    .bind(attempt_no)
    .bind(reason)
    .bind(error_context)
    .execute(pool)
    .await
    .context("failed to insert dead letter")?;
    Ok(())
}

#[tracing::instrument(skip(pool), fields(%tenant_id))]
pub async fn list_dead_letters(
    pool: &PgPool,
    tenant_id: Uuid,
    limit: i64,
) -> Result<Vec<DeadLetter>, anyhow::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, tenant_id, request_id, attempt_no, reason, error_context, created_at
        FROM dead_letters
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters")?;

    rows.into_iter()
        .map(|row| {
            Ok(DeadLetter {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                request_id: row.try_get("request_id")?,
                attempt_no: row.try_get("attempt_no")?,
                reason: row.try_get("reason")?,
                error_context: row.try_get("error_context")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
