use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::Channel;
use crate::domain::NotificationType;

/// A consent is effective iff it is not revoked and not expired. Venue-scoped
/// consent is only honored for its own venue: with no venue on the request,
/// only global grants match; with a venue, global grants or that venue's
/// grants match.
#[tracing::instrument(skip(pool), fields(%tenant_id, recipient_id, channel = %channel))]
pub async fn has_effective_consent(
    pool: &PgPool,
    tenant_id: Uuid,
    recipient_id: &str,
    channel: Channel,
    notification_type: NotificationType,
    venue_id: Option<Uuid>,
) -> Result<bool, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM consent_records
            WHERE tenant_id = $1
              AND recipient_id = $2
              AND channel = $3
              AND notification_type = $4
              AND (venue_id IS NULL OR venue_id = $5)
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > now())
        ) AS granted
        "#,
    )
    .bind(tenant_id)
    .bind(recipient_id)
    .bind(channel.as_str())
    .bind(notification_type.as_str())
    .bind(venue_id)
    .fetch_one(pool)
    .await
    .context("failed to check consent")?;
    Ok(row.get("granted"))
}

/// Record a grant. The core only reads consent; this write exists for the
/// ingestion surface that syncs grants in, and for test fixtures.
pub async fn grant_consent(
    pool: &PgPool,
    tenant_id: Uuid,
    recipient_id: &str,
    channel: Channel,
    notification_type: NotificationType,
    venue_id: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO consent_records
            (id, tenant_id, recipient_id, channel, notification_type, venue_id,
             granted_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, now(), $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(recipient_id)
    .bind(channel.as_str())
    .bind(notification_type.as_str())
    .bind(venue_id)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("failed to record consent grant")?;
    Ok(())
}
