mod email;
mod push;
mod sms;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::DateTime;
use chrono::Utc;
pub use email::PostmarkEmail;
pub use email::SendgridEmail;
use hmac::Hmac;
use hmac::Mac;
pub use push::FcmPush;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sha1::Sha1;
use sha2::Sha256;
pub use sms::TwilioSms;
use uuid::Uuid;

use crate::configuration::AdapterKind;
use crate::configuration::ProviderFleetSettings;
use crate::configuration::ProviderSettings;
use crate::domain::AttemptState;
use crate::domain::Channel;
use crate::domain::ErrorClass;

pub const SERVICE_IDENTITY_HEADER: &str = "X-Service-Identity";
pub const SERVICE_IDENTITY: &str = "notification-service";
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Webhook callbacks must arrive within this window of their timestamp.
pub const WEBHOOK_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(300);

/// Structured result of one provider call. Expected provider failures are
/// values, not errors; `accepted` means the provider acknowledged receipt
/// for delivery, not final delivery.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub accepted: bool,
    pub provider_message_id: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub error_code: Option<String>,
    /// Redacted; never contains recipient addresses or credentials.
    pub error_detail: Option<String>,
    pub retry_after: Option<Duration>,
    pub latency: Duration,
}

impl SendOutcome {
    pub fn accepted(provider_message_id: Option<String>, latency: Duration) -> Self {
        Self {
            accepted: true,
            provider_message_id,
            error_class: None,
            error_code: None,
            error_detail: None,
            retry_after: None,
            latency,
        }
    }

    pub fn failure(
        error_class: ErrorClass,
        error_code: impl Into<String>,
        error_detail: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            accepted: false,
            provider_message_id: None,
            error_class: Some(error_class),
            error_code: Some(error_code.into()),
            error_detail: Some(error_detail.into()),
            retry_after: None,
            latency,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Pre-rendered content handed to an adapter.
#[derive(Debug, Clone)]
pub struct ProviderPayload<'a> {
    pub to: &'a str,
    pub subject: Option<&'a str>,
    pub body_text: Option<&'a str>,
    pub body_html: Option<&'a str>,
    pub correlation_id: Uuid,
}

/// Raw inbound callback, captured before any parsing.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    /// Full public URL the provider signed (Twilio-style schemes).
    pub url: String,
}

/// One status event extracted from a verified callback. Serializable so the
/// internal retry queue can persist already-verified events.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProviderEvent {
    pub provider_event_id: String,
    pub provider_message_id: String,
    pub raw_status: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookVerifyError {
    #[error("missing signature material")]
    MissingSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("timestamp outside tolerance")]
    StaleTimestamp,
    #[error("malformed payload")]
    MalformedPayload(#[source] anyhow::Error),
    #[error("provider does not emit webhooks")]
    Unsupported,
}

/// Uniform contract over heterogeneous vendor APIs. Adding a provider means
/// implementing this trait and registering the adapter kind; the dispatcher
/// never changes.
#[async_trait]
pub trait NotificationProvider: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;
    fn channel(&self) -> Channel;
    async fn send(&self, payload: &ProviderPayload<'_>) -> SendOutcome;
    fn verify_webhook(&self, webhook: &InboundWebhook)
        -> Result<Vec<ProviderEvent>, WebhookVerifyError>;
    /// Maps vendor vocabulary onto the canonical state enum; unknown words
    /// yield `None` and are skipped by the caller.
    fn translate_status(&self, raw: &str) -> Option<AttemptState>;
    /// Cheap and side-effect free.
    async fn health_probe(&self) -> bool;
}

/// Shared outbound HTTP client: connect 3s, total capped by the per-provider
/// timeout (never above 30s, enforced at configuration load).
pub fn http_client(total_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(total_timeout)
        .build()
        .expect("failed to build http client")
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorClass::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorClass::Auth,
        StatusCode::REQUEST_TIMEOUT => ErrorClass::Timeout,
        s if s.is_server_error() => ErrorClass::Retryable,
        s if s.is_client_error() => ErrorClass::Validation,
        _ => ErrorClass::Unknown,
    }
}

pub fn classify_transport_error(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() {
        ErrorClass::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unknown
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Strip the recipient address and clamp length before an error body is
/// surfaced anywhere.
pub fn redact_detail(body: &str, address: &str) -> String {
    let mut detail = body.replace(address, "[redacted]");
    detail.truncate(200);
    detail
}

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// SendGrid-style signature: hex HMAC-SHA256 over `timestamp || body`.
/// Also used for outbound customer webhooks.
pub fn sign_timestamped(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Timing-safe verification of the scheme above.
pub fn verify_timestamped(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    provided_hex: &str,
) -> Result<(), WebhookVerifyError> {
    let provided = hex::decode(provided_hex).map_err(|_| WebhookVerifyError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| WebhookVerifyError::InvalidSignature)
}

/// Twilio-style signature: base64 HMAC-SHA1 over the full URL followed by
/// each form parameter name and value in sorted order.
pub fn sign_url_params<'a>(
    secret: &str,
    url: &str,
    sorted_params: impl Iterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(url.as_bytes());
    for (name, value) in sorted_params {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

pub fn verify_url_params<'a>(
    secret: &str,
    url: &str,
    sorted_params: impl Iterator<Item = (&'a str, &'a str)>,
    provided_b64: &str,
) -> Result<(), WebhookVerifyError> {
    let provided = base64::engine::general_purpose::STANDARD
        .decode(provided_b64)
        .map_err(|_| WebhookVerifyError::InvalidSignature)?;
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(url.as_bytes());
    for (name, value) in sorted_params {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    mac.verify_slice(&provided)
        .map_err(|_| WebhookVerifyError::InvalidSignature)
}

/// Reject callbacks whose declared timestamp drifts more than the tolerance
/// from our clock, in either direction.
pub fn check_timestamp_tolerance(timestamp_secs: i64) -> Result<(), WebhookVerifyError> {
    let now = Utc::now().timestamp();
    if (now - timestamp_secs).unsigned_abs() > WEBHOOK_TIMESTAMP_TOLERANCE.as_secs() {
        return Err(WebhookVerifyError::StaleTimestamp);
    }
    Ok(())
}

/// Instantiate the configured fleet. The adapter set is a closed enum;
/// unknown kinds cannot be configured.
pub fn build_providers(
    settings: &ProviderFleetSettings,
) -> Vec<Arc<dyn NotificationProvider>> {
    let mut providers: Vec<Arc<dyn NotificationProvider>> = Vec::new();
    for channel in [&settings.email, &settings.sms, &settings.push] {
        if !channel.enabled {
            continue;
        }
        for provider in channel.configured() {
            providers.push(build_adapter(provider));
        }
    }
    providers
}

fn build_adapter(settings: &ProviderSettings) -> Arc<dyn NotificationProvider> {
    match settings.adapter {
        AdapterKind::Sendgrid => Arc::new(SendgridEmail::new(settings)),
        AdapterKind::Postmark => Arc::new(PostmarkEmail::new(settings)),
        AdapterKind::Twilio => Arc::new(TwilioSms::new(settings)),
        AdapterKind::Fcm => Arc::new(FcmPush::new(settings)),
    }
}
