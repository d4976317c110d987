use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::repository;

const BATCH_SIZE: i64 = 100;

/// Drain one batch: every outbox row becomes a first-attempt dispatch job,
/// in the same transaction that marks the row published. Re-running after a
/// crash is harmless; the job insert is conflict-free on
/// `(request_id, attempt_no)`.
#[tracing::instrument(skip_all)]
async fn publish_batch(pool: &PgPool) -> Result<usize, anyhow::Error> {
    let mut transaction = pool.begin().await?;
    let entries = repository::fetch_unpublished(&mut transaction, BATCH_SIZE).await?;
    if entries.is_empty() {
        transaction.commit().await?;
        return Ok(0);
    }

    let mut ids = Vec::with_capacity(entries.len());
    for entry in &entries {
        repository::enqueue_job(
            &mut transaction,
            entry.request_id,
            entry.tenant_id,
            1,
            entry.channel,
            entry.priority,
            entry.not_before.unwrap_or_else(Utc::now),
        )
        .await?;
        ids.push(entry.id);
    }
    repository::mark_published(&mut transaction, &ids).await?;
    transaction.commit().await?;

    tracing::debug!(published = ids.len(), "outbox batch published");
    Ok(ids.len())
}

/// Background publisher turning outbox rows into dispatch jobs.
pub async fn init_outbox_publisher(
    pool: PgPool,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    loop {
        let published = match publish_batch(&pool).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, "outbox publish failed");
                0
            }
        };
        // a full batch means more is probably waiting; drain immediately
        if published as i64 == BATCH_SIZE {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
