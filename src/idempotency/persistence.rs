use anyhow::Context;
use sha2::Digest;
use sha2::Sha256;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::IdempotencyKey;
use crate::repository::PgTransaction;

/// A previously stored HTTP outcome for a replayed key.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub request_id: Uuid,
    pub status_code: i16,
    pub body: serde_json::Value,
}

/// Outcome of claiming an idempotency key. Synchronization lives in the
/// database unique constraint so replicated API instances agree: exactly one
/// caller gets `StartProcessing`, everyone else sees the stored state.
pub enum NextAction {
    /// This caller owns the key; the returned transaction must carry the
    /// request insert and the final `save_response`.
    StartProcessing(PgTransaction),
    ReturnSavedResponse(StoredResponse),
    /// Same key, same body, but the owner has not finished yet.
    InFlight,
    /// Same key with a different body; the client gets a 409.
    FingerprintMismatch,
}

/// SHA-256 over the raw request body; differing bodies under one key are a
/// client error, not a replay.
pub fn body_fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[tracing::instrument(skip_all, fields(%tenant_id))]
pub async fn try_begin(
    pool: &PgPool,
    tenant_id: Uuid,
    key: &IdempotencyKey,
    fingerprint: &str,
    request_id: Uuid,
) -> Result<NextAction, anyhow::Error> {
    let mut transaction = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency
            (tenant_id, idempotency_key, request_fingerprint, request_id, created_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .bind(key.as_ref())
    .bind(fingerprint)
    .bind(request_id)
    .execute(&mut *transaction)
    .await
    .context("failed to claim idempotency key")?
    .rows_affected()
        > 0;

    if inserted {
        return Ok(NextAction::StartProcessing(transaction));
    }
    transaction.rollback().await?;

    let saved = sqlx::query(
        r#"
        SELECT request_id, request_fingerprint, response_status_code, response_body
        FROM idempotency
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(key.as_ref())
    .fetch_optional(pool)
    .await
    .context("failed to load saved idempotency record")?
    .ok_or_else(|| anyhow::anyhow!("idempotency record vanished between claim and read"))?;

    let stored_fingerprint: String = saved.try_get("request_fingerprint")?;
    if stored_fingerprint != fingerprint {
        return Ok(NextAction::FingerprintMismatch);
    }

    let status_code: Option<i16> = saved.try_get("response_status_code")?;
    match status_code {
        None => Ok(NextAction::InFlight),
        Some(status_code) => Ok(NextAction::ReturnSavedResponse(StoredResponse {
            request_id: saved.try_get("request_id")?,
            status_code,
            body: saved
                .try_get::<Option<serde_json::Value>, _>("response_body")?
                .unwrap_or(serde_json::Value::Null),
        })),
    }
}

/// Complete the record. Committing the transaction is the last action: the
/// response becomes replayable in the same instant the request becomes
/// durable.
#[tracing::instrument(skip_all, fields(%tenant_id))]
pub async fn save_response(
    mut transaction: PgTransaction,
    tenant_id: Uuid,
    key: &IdempotencyKey,
    status_code: i16,
    body: &serde_json::Value,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        UPDATE idempotency
        SET response_status_code = $3, response_body = $4
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(key.as_ref())
    .bind(status_code)
    .bind(body)
    .execute(&mut *transaction)
    .await
    .context("failed to save idempotent response")?;
    transaction.commit().await?;
    Ok(())
}
