use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::AttemptState;
use crate::domain::ErrorClass;
use crate::domain::NotificationAttempt;

/// Open a new attempt in `sending`. Returns `None` when the
/// `(request_id, attempt_no)` slot is already taken, which means another
/// worker owns this attempt and the caller must back off.
#[tracing::instrument(skip(pool), fields(%request_id, attempt_no))]
pub async fn insert_sending_attempt(
    pool: &PgPool,
    tenant_id: Uuid,
    request_id: Uuid,
    attempt_no: i32,
    provider: &str,
) -> Result<Option<Uuid>, anyhow::Error> {
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO notification_attempts
            (id, tenant_id, request_id, attempt_no, provider, state, started_at)
        VALUES ($1, $2, $3, $4, $5, 'sending', now())
        ON CONFLICT (request_id, attempt_no) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(tenant_id)
    .bind(request_id)
    .bind(attempt_no)
    .bind(provider)
    .fetch_optional(pool)
    .await
    .context("failed to open sending attempt")?;
    Ok(row.map(|r| r.get("id")))
}

/// Record a compliance or admission decision as a terminal attempt without
/// any provider call. Conflict on the slot means the decision was already
/// recorded.
#[tracing::instrument(skip(pool), fields(%request_id, attempt_no, state = %state))]
pub async fn insert_terminal_attempt(
    pool: &PgPool,
    tenant_id: Uuid,
    request_id: Uuid,
    attempt_no: i32,
    state: AttemptState,
    reason_code: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO notification_attempts
            (id, tenant_id, request_id, attempt_no, provider, state, reason_code,
             started_at, finished_at)
        VALUES ($1, $2, $3, $4, 'none', $5, $6, now(), now())
        ON CONFLICT (request_id, attempt_no) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(request_id)
    .bind(attempt_no)
    .bind(state.as_str())
    .bind(reason_code)
    .execute(pool)
    .await
    .context("failed to record terminal attempt")?;
    Ok(())
}

/// Close a `sending` attempt with its provider call outcome.
#[tracing::instrument(skip(pool), fields(%attempt_id, state = %state))]
pub async fn record_attempt_outcome(
    pool: &PgPool,
    attempt_id: Uuid,
    state: AttemptState,
    provider_message_id: Option<&str>,
    error_code: Option<&str>,
    error_class: Option<ErrorClass>,
    latency_ms: Option<i64>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        UPDATE notification_attempts
        SET state = $2,
            provider_message_id = $3,
            error_code = $4,
            error_class = $5,
            latency_ms = $6,
            finished_at = now()
        WHERE id = $1
        "#,
    )
    .bind(attempt_id)
    .bind(state.as_str())
    .bind(provider_message_id)
    .bind(error_code)
    .bind(error_class.map(|c| c.as_str()))
    .bind(latency_ms)
    .execute(pool)
    .await
    .context("failed to record attempt outcome")?;
    Ok(())
}

/// A worker cancelled mid-call leaves its attempt stuck in `sending`; the
/// successor closes it as a timeout before opening the next slot.
#[tracing::instrument(skip(pool), fields(%request_id, attempt_no))]
pub async fn mark_attempt_timed_out(
    pool: &PgPool,
    request_id: Uuid,
    attempt_no: i32,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        UPDATE notification_attempts
        SET state = 'failed',
            error_class = 'timeout',
            reason_code = 'stale_sending',
            finished_at = now()
        WHERE request_id = $1 AND attempt_no = $2 AND state = 'sending'
        "#,
    )
    .bind(request_id)
    .bind(attempt_no)
    .execute(pool)
    .await
    .context("failed to close stale sending attempt")?;
    Ok(())
}

#[tracing::instrument(skip(pool), fields(%request_id))]
pub async fn latest_attempt(
    pool: &PgPool,
    request_id: Uuid,
) -> Result<Option<NotificationAttempt>, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, request_id, attempt_no, provider, provider_message_id, state,
               error_code, error_class, reason_code, latency_ms, started_at, finished_at
        FROM notification_attempts
        WHERE request_id = $1
        ORDER BY attempt_no DESC
        LIMIT 1
        "#,
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await
    .context("failed to load latest attempt")?;
    row.map(attempt_from_row).transpose()
}

#[tracing::instrument(skip(pool))]
pub async fn find_attempt_by_provider_message(
    pool: &PgPool,
    provider: &str,
    provider_message_id: &str,
) -> Result<Option<NotificationAttempt>, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, request_id, attempt_no, provider, provider_message_id, state,
               error_code, error_class, reason_code, latency_ms, started_at, finished_at
        FROM notification_attempts
        WHERE provider = $1 AND provider_message_id = $2
        "#,
    )
    .bind(provider)
    .bind(provider_message_id)
    .fetch_optional(pool)
    .await
    .context("failed to find attempt by provider message id")?;
    row.map(attempt_from_row).transpose()
}

/// Result of reconciling one provider event against the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State advanced; the request and tenant are returned so the caller can
    /// act on terminal outcomes (e.g. append suppressions on bounce).
    Applied { request_id: Uuid, tenant_id: Uuid },
    /// The transition would regress and was dropped.
    Ignored,
    /// No attempt carries this provider message id.
    NoMatch,
}

/// Reconcile a webhook-reported state under an advisory transaction lock on
/// the provider message id, so concurrent callbacks for the same message are
/// serialized. Only monotone transitions are applied.
#[tracing::instrument(skip(pool), fields(provider, provider_message_id, next = %next_state))]
pub async fn apply_provider_event(
    pool: &PgPool,
    provider: &str,
    provider_message_id: &str,
    next_state: AttemptState,
) -> Result<TransitionOutcome, anyhow::Error> {
    let mut transaction = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(provider_message_id)
        .execute(&mut *transaction)
        .await
        .context("failed to take advisory lock")?;

    let row = sqlx::query(
        r#"
        SELECT id, request_id, tenant_id, state
        FROM notification_attempts
        WHERE provider = $1 AND provider_message_id = $2
        FOR UPDATE
        "#,
    )
    .bind(provider)
    .bind(provider_message_id)
    .fetch_optional(&mut *transaction)
    .await
    .context("failed to load attempt for reconciliation")?;

    let Some(row) = row else {
        transaction.rollback().await?;
        return Ok(TransitionOutcome::NoMatch);
    };

    let attempt_id: Uuid = row.try_get("id")?;
    let request_id: Uuid = row.try_get("request_id")?;
    let tenant_id: Uuid = row.try_get("tenant_id")?;
    let current: String = row.try_get("state")?;
    let current = AttemptState::parse(&current).map_err(anyhow::Error::msg)?;

    if !current.can_transition_to(next_state) {
        transaction.rollback().await?;
        return Ok(TransitionOutcome::Ignored);
    }

    sqlx::query(
        r#"
        UPDATE notification_attempts
        SET state = $2,
            finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
        WHERE id = $1
        "#,
    )
    .bind(attempt_id)
    .bind(next_state.as_str())
    .bind(next_state.is_terminal())
    .execute(&mut *transaction)
    .await
    .context("failed to apply state transition")?;

    transaction.commit().await?;
    Ok(TransitionOutcome::Applied {
        request_id,
        tenant_id,
    })
}

fn attempt_from_row(row: PgRow) -> Result<NotificationAttempt, anyhow::Error> {
    let state: String = row.try_get("state")?;
    let error_class: Option<String> = row.try_get("error_class")?;
    Ok(NotificationAttempt {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        attempt_no: row.try_get("attempt_no")?,
        provider: row.try_get("provider")?,
        provider_message_id: row.try_get("provider_message_id")?,
        state: AttemptState::parse(&state).map_err(anyhow::Error::msg)?,
        error_code: row.try_get("error_code")?,
        error_class: error_class
            .map(|c| ErrorClass::parse(&c).map_err(anyhow::Error::msg))
            .transpose()?,
        reason_code: row.try_get("reason_code")?,
        latency_ms: row.try_get("latency_ms")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
