use std::sync::Arc;

use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use serde_json::json;
use sqlx::PgPool;

use crate::errors::ApiError;
use crate::providers::InboundWebhook;
use crate::providers::WebhookVerifyError;
use crate::repository;
use crate::selector::ProviderDirectory;
use crate::startup::AppBaseUrl;
use crate::webhook_retry;

/// Signature material accepted on inbound callbacks. Twilio-style schemes
/// use their own header and no timestamp.
const SIGNATURE_HEADERS: [&str; 2] = ["X-Webhook-Signature", "X-Twilio-Signature"];
const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

fn header(request: &HttpRequest, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `POST /v1/webhooks/{provider}`.
///
/// The raw body is verified before any parse; dedupe is the
/// `(provider, provider_event_id)` unique index; reconciliation failures
/// after the event is recorded go to the internal retry queue so the
/// provider still gets its 2xx.
#[tracing::instrument(
    name = "Ingesting provider webhook",
    skip_all,
    fields(provider = %path.as_str())
)]
pub async fn post_webhook(
    path: web::Path<String>,
    body: web::Bytes,
    request: HttpRequest,
    pool: web::Data<PgPool>,
    directory: web::Data<Arc<ProviderDirectory>>,
    base_url: web::Data<AppBaseUrl>,
) -> Result<HttpResponse, ApiError> {
    let provider_name = path.into_inner();
    let Some(provider) = directory.get(&provider_name) else {
        return Ok(HttpResponse::NotFound().finish());
    };

    let webhook = InboundWebhook {
        body: body.to_vec(),
        signature: SIGNATURE_HEADERS
            .iter()
            .find_map(|name| header(&request, name)),
        timestamp: header(&request, TIMESTAMP_HEADER),
        url: format!("{}/v1/webhooks/{provider_name}", base_url.0),
    };

    let events = match provider.verify_webhook(&webhook) {
        Ok(events) => events,
        Err(e @ (WebhookVerifyError::MalformedPayload(_) | WebhookVerifyError::Unsupported)) => {
            tracing::warn!(error = %e, "webhook body rejected");
            return Err(ApiError::Validation(e.to_string()));
        }
        Err(e) => {
            // no body peek on signature failures; log and count only
            tracing::warn!(error = %e, "webhook signature rejected");
            return Err(ApiError::Auth(e.into()));
        }
    };

    let mut accepted = 0usize;
    for event in &events {
        let payload = serde_json::to_value(event)
            .map_err(|e| ApiError::Unexpected(anyhow::Error::from(e)))?;
        let fresh = repository::insert_webhook_event(
            &pool,
            provider.id(),
            &event.provider_event_id,
            &payload,
        )
        .await?;
        if !fresh {
            tracing::debug!(event_id = %event.provider_event_id, "duplicate callback skipped");
            continue;
        }
        accepted += 1;

        if let Err(e) = webhook_retry::process_event(&pool, provider.as_ref(), event).await {
            tracing::error!(
                error.cause_chain = ?e,
                event_id = %event.provider_event_id,
                "post-ack processing failed; queueing for retry"
            );
            // only an enqueue failure may surface as 5xx
            webhook_retry::enqueue_retry(&pool, provider.id(), std::slice::from_ref(event))
                .await?;
        }
    }

    Ok(HttpResponse::Ok().json(json!({ "received": events.len(), "accepted": accepted })))
}
