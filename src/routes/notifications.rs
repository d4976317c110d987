use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::degradation::AdmissionDecision;
use crate::degradation::DegradationController;
use crate::domain::Channel;
use crate::domain::NewNotification;
use crate::domain::NewNotificationParts;
use crate::domain::NotificationType;
use crate::domain::Priority;
use crate::domain::Recipient;
use crate::domain::RequestSource;
use crate::errors::ApiError;
use crate::idempotency;
use crate::idempotency::IdempotencyKey;
use crate::idempotency::NextAction;
use crate::rate_limit::client_ip_from_forwarded;
use crate::rate_limit::LimitDecision;
use crate::rate_limit::RateLimiter;
use crate::repository;

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationBody {
    pub tenant_id: Uuid,
    pub venue_id: Option<Uuid>,
    pub recipient: RecipientBody,
    pub channel: Channel,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub priority: Option<Priority>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub template_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientBody {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    pub timezone: Option<String>,
}

fn default_priority(notification_type: NotificationType) -> Priority {
    match notification_type {
        NotificationType::Critical => Priority::Critical,
        NotificationType::Transactional | NotificationType::Operational => Priority::Normal,
        NotificationType::Marketing => Priority::Low,
    }
}

struct ParsedSubmission {
    notification: NewNotification,
    idempotency_key: Option<IdempotencyKey>,
    fingerprint: String,
}

fn parse_submission(
    body: NotificationBody,
    header_key: Option<String>,
) -> Result<ParsedSubmission, ApiError> {
    // the canonical serialization is the replay fingerprint, so formatting
    // differences in the wire body do not count as a different request
    let fingerprint_source =
        serde_json::to_vec(&body).context("failed to canonicalize request body")?;
    let fingerprint = idempotency::body_fingerprint(&fingerprint_source);

    let priority = body
        .priority
        .unwrap_or_else(|| default_priority(body.notification_type));
    let body_key = body.idempotency_key;

    let notification = NewNotification::parse(NewNotificationParts {
        tenant_id: body.tenant_id,
        venue_id: body.venue_id,
        recipient: Recipient {
            id: body.recipient.id,
            email: body.recipient.email,
            phone: body.recipient.phone,
            push_token: body.recipient.push_token,
            timezone: body.recipient.timezone,
        },
        channel: body.channel,
        notification_type: body.notification_type,
        priority,
        subject: body.subject,
        body_text: body.body_text,
        body_html: body.body_html,
        template_ref: body.template_ref,
        correlation_id: body.correlation_id,
        source: RequestSource::Api,
    })
    .map_err(ApiError::Validation)?;

    let idempotency_key = header_key
        .or(body_key)
        .map(IdempotencyKey::try_from)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    Ok(ParsedSubmission {
        notification,
        idempotency_key,
        fingerprint,
    })
}

/// The proxy-appended (right-most) forwarded entry, else the socket peer.
/// Client-supplied identities are never trusted as limit keys.
fn client_ip(request: &HttpRequest) -> Option<String> {
    request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(client_ip_from_forwarded)
        .or_else(|| request.peer_addr().map(|a| a.ip().to_string()))
}

/// Synchronous edge throttle on the client-IP bucket; refusals surface as
/// 429 + Retry-After. The finer-grained buckets are charged at dispatch.
async fn check_source_rate(
    limiter: &RateLimiter,
    client_ip: Option<&str>,
    notification: &NewNotification,
) -> Result<(), ApiError> {
    let Some(ip) = client_ip else {
        return Ok(());
    };
    match limiter.check_source_ip(ip).await {
        LimitDecision::Allowed => Ok(()),
        LimitDecision::Denied { retry_after } => Err(ApiError::RateLimited {
            retry_after,
            correlation_id: notification.correlation_id,
        }),
    }
}

fn check_admission(
    degradation: &DegradationController,
    notification: &NewNotification,
) -> Result<(), ApiError> {
    match degradation.decide_admission(notification.notification_type, notification.priority) {
        AdmissionDecision::Admit => Ok(()),
        AdmissionDecision::Shed { retry_after } => Err(ApiError::Shedding {
            retry_after,
            correlation_id: notification.correlation_id,
        }),
        AdmissionDecision::Reject => Err(ApiError::Unavailable {
            correlation_id: notification.correlation_id,
        }),
    }
}

/// Accept a request durably: request row + outbox row in one transaction;
/// the dispatch job follows via the outbox publisher. With an idempotency
/// key, the stored response is completed in the same transaction.
async fn accept(
    pool: &PgPool,
    submission: &ParsedSubmission,
) -> Result<(StatusCode, serde_json::Value), ApiError> {
    let request_id = Uuid::new_v4();
    let accepted_body = json!({ "request_id": request_id });

    let Some(key) = &submission.idempotency_key else {
        let mut transaction = pool.begin().await.context("failed to begin transaction")?;
        persist(&mut transaction, request_id, &submission.notification, None).await?;
        transaction
            .commit()
            .await
            .context("failed to commit accepted request")?;
        return Ok((StatusCode::ACCEPTED, accepted_body));
    };

    match idempotency::try_begin(
        pool,
        submission.notification.tenant_id,
        key,
        &submission.fingerprint,
        request_id,
    )
    .await?
    {
        NextAction::StartProcessing(mut transaction) => {
            persist(
                &mut transaction,
                request_id,
                &submission.notification,
                Some(key.as_ref()),
            )
            .await?;
            idempotency::save_response(
                transaction,
                submission.notification.tenant_id,
                key,
                StatusCode::ACCEPTED.as_u16() as i16,
                &accepted_body,
            )
            .await?;
            Ok((StatusCode::ACCEPTED, accepted_body))
        }
        NextAction::ReturnSavedResponse(saved) => {
            let status =
                StatusCode::from_u16(saved.status_code as u16).unwrap_or(StatusCode::ACCEPTED);
            Ok((status, saved.body))
        }
        NextAction::InFlight | NextAction::FingerprintMismatch => {
            Err(ApiError::IdempotencyConflict {
                correlation_id: submission.notification.correlation_id,
            })
        }
    }
}

async fn persist(
    transaction: &mut repository::PgTransaction,
    request_id: Uuid,
    notification: &NewNotification,
    idempotency_key: Option<&str>,
) -> Result<(), ApiError> {
    repository::insert_request(transaction, request_id, notification, idempotency_key).await?;
    repository::insert_outbox_entry(
        transaction,
        request_id,
        notification.tenant_id,
        notification.channel,
        notification.priority,
        None,
    )
    .await?;
    Ok(())
}

#[tracing::instrument(
    name = "Accepting notification request",
    skip_all,
    fields(correlation_id = tracing::field::Empty, tenant_id = tracing::field::Empty)
)]
pub async fn post_notification(
    raw: web::Json<NotificationBody>,
    request: HttpRequest,
    pool: web::Data<PgPool>,
    degradation: web::Data<DegradationController>,
    limiter: web::Data<RateLimiter>,
) -> Result<HttpResponse, ApiError> {
    let header_key = request
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_ip = client_ip(&request);

    let submission = parse_submission(raw.into_inner(), header_key)?;
    tracing::Span::current()
        .record(
            "correlation_id",
            tracing::field::display(submission.notification.correlation_id),
        )
        .record(
            "tenant_id",
            tracing::field::display(submission.notification.tenant_id),
        );

    check_admission(&degradation, &submission.notification)?;
    check_source_rate(&limiter, client_ip.as_deref(), &submission.notification).await?;
    let (status, body) = accept(&pool, &submission).await?;
    Ok(HttpResponse::build(status).json(body))
}

#[derive(Serialize)]
struct BatchItemResult {
    status: u16,
    request_id: Option<Uuid>,
    error: Option<String>,
}

/// Per-item semantics identical to the single endpoint; one bad item does
/// not fail its siblings.
#[tracing::instrument(name = "Accepting notification batch", skip_all)]
pub async fn post_notification_batch(
    raw: web::Json<Vec<NotificationBody>>,
    request: HttpRequest,
    pool: web::Data<PgPool>,
    degradation: web::Data<DegradationController>,
    limiter: web::Data<RateLimiter>,
) -> Result<HttpResponse, ApiError> {
    let client_ip = client_ip(&request);
    let mut results = Vec::with_capacity(raw.len());
    for item in raw.into_inner() {
        let outcome = async {
            let submission = parse_submission(item, None)?;
            check_admission(&degradation, &submission.notification)?;
            check_source_rate(&limiter, client_ip.as_deref(), &submission.notification).await?;
            accept(&pool, &submission).await
        }
        .await;

        results.push(match outcome {
            Ok((status, body)) => BatchItemResult {
                status: status.as_u16(),
                request_id: body
                    .get("request_id")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok()),
                error: None,
            },
            Err(e) => BatchItemResult {
                status: actix_web::ResponseError::status_code(&e).as_u16(),
                request_id: None,
                error: Some(e.to_string()),
            },
        });
    }
    Ok(HttpResponse::Ok().json(results))
}
