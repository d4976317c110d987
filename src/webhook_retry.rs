use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::address_hash;
use crate::domain::AttemptState;
use crate::providers::NotificationProvider;
use crate::providers::ProviderEvent;
use crate::repository;
use crate::repository::TransitionOutcome;
use crate::selector::ProviderDirectory;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_LEASE: Duration = Duration::from_secs(60);
const MAX_PROCESSING_ATTEMPTS: i32 = 10;

/// Reconcile one verified provider event against the attempt log and apply
/// side effects of terminal outcomes (suppression on hard bounce or
/// complaint). Shared by the webhook route (inline path) and the retry
/// worker.
#[tracing::instrument(skip_all, fields(provider = provider.id(), event_id = %event.provider_event_id))]
pub async fn process_event(
    pool: &PgPool,
    provider: &dyn NotificationProvider,
    event: &ProviderEvent,
) -> Result<(), anyhow::Error> {
    let Some(next_state) = provider.translate_status(&event.raw_status) else {
        tracing::debug!(raw_status = %event.raw_status, "status carries no delivery information");
        return Ok(());
    };

    let outcome = repository::apply_provider_event(
        pool,
        provider.id(),
        &event.provider_message_id,
        next_state,
    )
    .await?;

    match outcome {
        TransitionOutcome::Applied {
            request_id,
            tenant_id,
        } => {
            tracing::info!(state = %next_state, %request_id, "delivery state reconciled");
            let suppression_reason = match next_state {
                AttemptState::Bounced => Some("hard_bounce"),
                AttemptState::Suppressed => Some("complaint"),
                _ => None,
            };
            if let Some(reason) = suppression_reason {
                append_suppression(pool, provider, tenant_id, request_id, reason).await?;
            }
        }
        TransitionOutcome::Ignored => {
            tracing::debug!(state = %next_state, "non-monotone transition ignored");
        }
        TransitionOutcome::NoMatch => {
            tracing::warn!(
                provider_message_id = %event.provider_message_id,
                "callback references no known attempt"
            );
        }
    }
    Ok(())
}

async fn append_suppression(
    pool: &PgPool,
    provider: &dyn NotificationProvider,
    tenant_id: Uuid,
    request_id: Uuid,
    reason: &str,
) -> Result<(), anyhow::Error> {
    let Some(request) = repository::get_request(pool, tenant_id, request_id).await? else {
        return Ok(());
    };
    let channel = provider.channel();
    if let Some(address) = request.recipient.contact_for(channel) {
        repository::insert_suppression(pool, tenant_id, channel, &address_hash(address), reason)
            .await?;
        tracing::info!(reason, channel = %channel, "suppression entry appended");
    }
    Ok(())
}

/// Park verified events whose post-ack processing failed; the worker below
/// drains them. Failing this insert is the only reason the webhook endpoint
/// may answer 5xx.
pub async fn enqueue_retry(
    pool: &PgPool,
    provider_id: &str,
    events: &[ProviderEvent],
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO webhook_retry_queue
            (id, provider, events, attempts, next_attempt_at, created_at)
        VALUES ($1, $2, $3, 0, now(), now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(provider_id)
    .bind(serde_json::to_value(events)?)
    .execute(pool)
    .await
    .context("failed to enqueue webhook retry")?;
    Ok(())
}

struct RetryRow {
    id: Uuid,
    provider: String,
    events: Vec<ProviderEvent>,
    attempts: i32,
}

async fn claim_due_retries(pool: &PgPool) -> Result<Vec<RetryRow>, anyhow::Error> {
    let rows = sqlx::query(
        r#"
        UPDATE webhook_retry_queue
        SET next_attempt_at = now() + make_interval(secs => $1),
            attempts = attempts + 1
        WHERE id IN (
            SELECT id
            FROM webhook_retry_queue
            WHERE next_attempt_at <= now()
            ORDER BY created_at ASC
            LIMIT 20
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, provider, events, attempts
        "#,
    )
    .bind(RETRY_LEASE.as_secs_f64())
    .fetch_all(pool)
    .await
    .context("failed to claim webhook retries")?;

    rows.into_iter()
        .map(|row| {
            let events: serde_json::Value = row.try_get("events")?;
            Ok(RetryRow {
                id: row.try_get("id")?,
                provider: row.try_get("provider")?,
                events: serde_json::from_value(events)?,
                attempts: row.try_get("attempts")?,
            })
        })
        .collect()
}

/// Processor for callbacks that were acknowledged 2xx but failed afterwards.
pub async fn init_webhook_retry_worker(
    pool: PgPool,
    directory: Arc<ProviderDirectory>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            _ = shutdown.changed() => return Ok(()),
        }

        let rows = match claim_due_retries(&pool).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, "webhook retry claim failed");
                continue;
            }
        };

        for row in rows {
            let Some(provider) = directory.get(&row.provider) else {
                tracing::error!(provider = %row.provider, "retry row for unconfigured provider; dropping");
                let _ = sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1")
                    .bind(row.id)
                    .execute(&pool)
                    .await;
                continue;
            };

            let mut all_ok = true;
            for event in &row.events {
                if let Err(e) = process_event(&pool, provider.as_ref(), event).await {
                    tracing::warn!(error.cause_chain = ?e, "webhook retry processing failed");
                    all_ok = false;
                    break;
                }
            }

            if all_ok || row.attempts >= MAX_PROCESSING_ATTEMPTS {
                if !all_ok {
                    tracing::error!(
                        provider = %row.provider,
                        attempts = row.attempts,
                        "webhook retry exhausted; dropping events"
                    );
                }
                if let Err(e) = sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1")
                    .bind(row.id)
                    .execute(&pool)
                    .await
                {
                    tracing::error!(error.cause_chain = ?e, "failed to delete webhook retry row");
                }
            }
        }
    }
}
