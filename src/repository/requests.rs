use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::Channel;
use crate::domain::NewNotification;
use crate::domain::NotificationRequest;
use crate::domain::NotificationType;
use crate::domain::Priority;
use crate::domain::Recipient;
use crate::domain::RequestSource;
use crate::repository::PgTransaction;

/// Persist an accepted intent. The row is immutable after this insert; the
/// `(tenant_id, idempotency_key)` unique index is the replay guard.
#[tracing::instrument(skip_all, fields(tenant_id = %new.tenant_id, request_id = %request_id))]
pub async fn insert_request(
    transaction: &mut PgTransaction,
    request_id: Uuid,
    new: &NewNotification,
    idempotency_key: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO notification_requests
            (id, tenant_id, venue_id, recipient_id, recipient_email, recipient_phone,
             recipient_push_token, recipient_timezone, channel, notification_type,
             priority, subject, body_text, body_html, template_ref, idempotency_key,
             correlation_id, source, created_at)
        VALUES
            ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
             $11, $12, $13, $14, $15, $16, $17, $18, now())
        "#,
    )
    .bind(request_id)
    .bind(new.tenant_id)
    .bind(new.venue_id)
    .bind(&new.recipient.id)
    .bind(&new.recipient.email)
    .bind(&new.recipient.phone)
    .bind(&new.recipient.push_token)
    .bind(&new.recipient.timezone)
    .bind(new.channel.as_str())
    .bind(new.notification_type.as_str())
    .bind(new.priority.as_str())
    .bind(&new.subject)
    .bind(&new.body_text)
    .bind(&new.body_html)
    .bind(&new.template_ref)
    .bind(idempotency_key)
    .bind(new.correlation_id)
    .bind(new.source.as_str())
    .execute(&mut **transaction)
    .await
    .context("failed to insert notification request")?;
    Ok(())
}

/// Tenant-scoped load; a job carrying the wrong tenant finds nothing.
#[tracing::instrument(skip(pool))]
pub async fn get_request(
    pool: &PgPool,
    tenant_id: Uuid,
    request_id: Uuid,
) -> Result<Option<NotificationRequest>, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant_id, venue_id, recipient_id, recipient_email, recipient_phone,
               recipient_push_token, recipient_timezone, channel, notification_type,
               priority, subject, body_text, body_html, template_ref, idempotency_key,
               correlation_id, source, created_at
        FROM notification_requests
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(request_id)
    .fetch_optional(pool)
    .await
    .context("failed to load notification request")?;

    row.map(request_from_row).transpose()
}

fn request_from_row(row: PgRow) -> Result<NotificationRequest, anyhow::Error> {
    let channel: String = row.try_get("channel")?;
    let notification_type: String = row.try_get("notification_type")?;
    let priority: String = row.try_get("priority")?;
    let source: String = row.try_get("source")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(NotificationRequest {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        venue_id: row.try_get("venue_id")?,
        recipient: Recipient {
            id: row.try_get("recipient_id")?,
            email: row.try_get("recipient_email")?,
            phone: row.try_get("recipient_phone")?,
            push_token: row.try_get("recipient_push_token")?,
            timezone: row.try_get("recipient_timezone")?,
        },
        channel: Channel::parse(&channel).map_err(anyhow::Error::msg)?,
        notification_type: NotificationType::parse(&notification_type)
            .map_err(anyhow::Error::msg)?,
        priority: Priority::parse(&priority).map_err(anyhow::Error::msg)?,
        subject: row.try_get("subject")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        template_ref: row.try_get("template_ref")?,
        idempotency_key: row.try_get("idempotency_key")?,
        correlation_id: row.try_get("correlation_id")?,
        source: RequestSource::parse(&source).map_err(anyhow::Error::msg)?,
        created_at,
    })
}
