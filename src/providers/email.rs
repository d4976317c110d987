use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_json::json;

use crate::configuration::ProviderSettings;
use crate::domain::AttemptState;
use crate::domain::Channel;
use crate::providers::check_timestamp_tolerance;
use crate::providers::classify_status;
use crate::providers::classify_transport_error;
use crate::providers::http_client;
use crate::providers::parse_retry_after;
use crate::providers::redact_detail;
use crate::providers::verify_timestamped;
use crate::providers::InboundWebhook;
use crate::providers::NotificationProvider;
use crate::providers::ProviderEvent;
use crate::providers::ProviderPayload;
use crate::providers::SendOutcome;
use crate::providers::WebhookVerifyError;
use crate::providers::CORRELATION_HEADER;
use crate::providers::SERVICE_IDENTITY;
use crate::providers::SERVICE_IDENTITY_HEADER;

/// SendGrid v3 mail adapter.
#[derive(Debug)]
pub struct SendgridEmail {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    sender: String,
    webhook_secret: Secret<String>,
}

impl SendgridEmail {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: http_client(settings.timeout()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            sender: settings.sender.clone().unwrap_or_default(),
            webhook_secret: settings.webhook_secret.clone(),
        }
    }
}

#[derive(Deserialize)]
struct SendgridEventRecord {
    sg_event_id: String,
    sg_message_id: Option<String>,
    event: String,
    timestamp: Option<i64>,
}

#[async_trait]
impl NotificationProvider for SendgridEmail {
    fn id(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name, correlation_id = %payload.correlation_id))]
    async fn send(&self, payload: &ProviderPayload<'_>) -> SendOutcome {
        let mut content = Vec::new();
        if let Some(text) = payload.body_text {
            content.push(json!({"type": "text/plain", "value": text}));
        }
        if let Some(html) = payload.body_html {
            content.push(json!({"type": "text/html", "value": html}));
        }
        let body = json!({
            "personalizations": [{"to": [{"email": payload.to}]}],
            "from": {"email": self.sender},
            "subject": payload.subject.unwrap_or_default(),
            "content": content,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .header(CORRELATION_HEADER, payload.correlation_id.to_string())
            .json(&body)
            .send()
            .await;
        let latency = started.elapsed();

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .headers()
                    .get("X-Message-Id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                SendOutcome::accepted(message_id, latency)
            }
            Ok(resp) => {
                let status = resp.status();
                let retry_after = parse_retry_after(resp.headers());
                let text = resp.text().await.unwrap_or_default();
                SendOutcome::failure(
                    classify_status(status),
                    status.as_u16().to_string(),
                    redact_detail(&text, payload.to),
                    latency,
                )
                .with_retry_after(retry_after)
            }
            Err(e) => SendOutcome::failure(
                classify_transport_error(&e),
                "transport",
                e.without_url().to_string(),
                latency,
            ),
        }
    }

    fn verify_webhook(
        &self,
        webhook: &InboundWebhook,
    ) -> Result<Vec<ProviderEvent>, WebhookVerifyError> {
        let signature = webhook
            .signature
            .as_deref()
            .ok_or(WebhookVerifyError::MissingSignature)?;
        let timestamp = webhook
            .timestamp
            .as_deref()
            .ok_or(WebhookVerifyError::MissingSignature)?;

        // signature first: the body is untrusted until this passes
        verify_timestamped(
            self.webhook_secret.expose_secret(),
            timestamp,
            &webhook.body,
            signature,
        )?;
        let timestamp_secs: i64 = timestamp
            .parse()
            .map_err(|_| WebhookVerifyError::StaleTimestamp)?;
        check_timestamp_tolerance(timestamp_secs)?;

        let records: Vec<SendgridEventRecord> = serde_json::from_slice(&webhook.body)
            .map_err(|e| WebhookVerifyError::MalformedPayload(e.into()))?;
        Ok(records
            .into_iter()
            .filter_map(|r| {
                let provider_message_id = r.sg_message_id?;
                Some(ProviderEvent {
                    provider_event_id: r.sg_event_id,
                    provider_message_id,
                    raw_status: r.event,
                    occurred_at: r.timestamp.and_then(|t| DateTime::from_timestamp(t, 0)),
                })
            })
            .collect())
    }

    fn translate_status(&self, raw: &str) -> Option<AttemptState> {
        match raw {
            "processed" | "deferred" => Some(AttemptState::Sent),
            "delivered" => Some(AttemptState::Delivered),
            "bounce" => Some(AttemptState::Bounced),
            "dropped" => Some(AttemptState::Dropped),
            "spamreport" | "unsubscribe" => Some(AttemptState::Suppressed),
            // engagement events carry no delivery information
            "open" | "click" => None,
            _ => None,
        }
    }

    async fn health_probe(&self) -> bool {
        self.client
            .get(format!("{}/v3/scopes", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Postmark transactional email adapter.
#[derive(Debug)]
pub struct PostmarkEmail {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    sender: String,
    webhook_secret: Secret<String>,
}

impl PostmarkEmail {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: http_client(settings.timeout()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            sender: settings.sender.clone().unwrap_or_default(),
            webhook_secret: settings.webhook_secret.clone(),
        }
    }
}

#[derive(Deserialize)]
struct PostmarkSendResponse {
    #[serde(rename = "MessageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PostmarkWebhookRecord {
    #[serde(rename = "RecordType")]
    record_type: String,
    #[serde(rename = "MessageID")]
    message_id: String,
}

#[async_trait]
impl NotificationProvider for PostmarkEmail {
    fn id(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name, correlation_id = %payload.correlation_id))]
    async fn send(&self, payload: &ProviderPayload<'_>) -> SendOutcome {
        let body = json!({
            "From": self.sender,
            "To": payload.to,
            "Subject": payload.subject.unwrap_or_default(),
            "TextBody": payload.body_text,
            "HtmlBody": payload.body_html,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/email", self.base_url))
            .header("X-Postmark-Server-Token", self.api_key.expose_secret())
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .header(CORRELATION_HEADER, payload.correlation_id.to_string())
            .json(&body)
            .send()
            .await;
        let latency = started.elapsed();

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<PostmarkSendResponse>()
                    .await
                    .ok()
                    .map(|r| r.message_id);
                SendOutcome::accepted(message_id, latency)
            }
            Ok(resp) => {
                let status = resp.status();
                let retry_after = parse_retry_after(resp.headers());
                let text = resp.text().await.unwrap_or_default();
                SendOutcome::failure(
                    classify_status(status),
                    status.as_u16().to_string(),
                    redact_detail(&text, payload.to),
                    latency,
                )
                .with_retry_after(retry_after)
            }
            Err(e) => SendOutcome::failure(
                classify_transport_error(&e),
                "transport",
                e.without_url().to_string(),
                latency,
            ),
        }
    }

    fn verify_webhook(
        &self,
        webhook: &InboundWebhook,
    ) -> Result<Vec<ProviderEvent>, WebhookVerifyError> {
        let signature = webhook
            .signature
            .as_deref()
            .ok_or(WebhookVerifyError::MissingSignature)?;
        let timestamp = webhook
            .timestamp
            .as_deref()
            .ok_or(WebhookVerifyError::MissingSignature)?;

        verify_timestamped(
            self.webhook_secret.expose_secret(),
            timestamp,
            &webhook.body,
            signature,
        )?;
        let timestamp_secs: i64 = timestamp
            .parse()
            .map_err(|_| WebhookVerifyError::StaleTimestamp)?;
        check_timestamp_tolerance(timestamp_secs)?;

        let record: PostmarkWebhookRecord = serde_json::from_slice(&webhook.body)
            .map_err(|e| WebhookVerifyError::MalformedPayload(e.into()))?;
        // Postmark emits one record per callback and no event id of its own;
        // (message, record type) identifies the event for dedupe
        Ok(vec![ProviderEvent {
            provider_event_id: format!("{}:{}", record.message_id, record.record_type),
            provider_message_id: record.message_id,
            raw_status: record.record_type,
            occurred_at: None,
        }])
    }

    fn translate_status(&self, raw: &str) -> Option<AttemptState> {
        match raw {
            "Delivery" => Some(AttemptState::Delivered),
            "Bounce" => Some(AttemptState::Bounced),
            "SpamComplaint" => Some(AttemptState::Suppressed),
            "SubscriptionChange" => Some(AttemptState::Suppressed),
            "Open" | "Click" => None,
            _ => None,
        }
    }

    async fn health_probe(&self) -> bool {
        self.client
            .get(format!("{}/server", self.base_url))
            .header("X-Postmark-Server-Token", self.api_key.expose_secret())
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use secrecy::Secret;

    use super::*;
    use crate::configuration::AdapterKind;
    use crate::providers::sign_timestamped;

    fn settings() -> ProviderSettings {
        ProviderSettings {
            adapter: AdapterKind::Sendgrid,
            name: "sendgrid-primary".to_string(),
            base_url: "https://api.sendgrid.test".to_string(),
            api_key: Secret::new("key".to_string()),
            account_ref: None,
            sender: Some("no-reply@example.com".to_string()),
            webhook_secret: Secret::new("whsec".to_string()),
            timeout_ms: 5000,
        }
    }

    fn signed_webhook(secret: &str, body: &[u8]) -> InboundWebhook {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_timestamped(secret, &timestamp, body);
        InboundWebhook {
            body: body.to_vec(),
            signature: Some(signature),
            timestamp: Some(timestamp),
            url: "https://notify.example.com/v1/webhooks/sendgrid-primary".to_string(),
        }
    }

    #[test]
    fn sendgrid_webhook_verifies_and_extracts_events() {
        let provider = SendgridEmail::new(&settings());
        let body = serde_json::to_vec(&serde_json::json!([
            {"sg_event_id": "e1", "sg_message_id": "m1", "event": "delivered", "timestamp": 1_700_000_000},
            {"sg_event_id": "e2", "event": "open"}
        ]))
        .unwrap();
        let events = provider.verify_webhook(&signed_webhook("whsec", &body)).unwrap();
        // the second record has no message id and is dropped
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_event_id, "e1");
        assert_eq!(events[0].provider_message_id, "m1");
        assert_eq!(events[0].raw_status, "delivered");
    }

    #[test]
    fn sendgrid_webhook_rejects_bad_signature_before_parse() {
        let provider = SendgridEmail::new(&settings());
        // deliberately unparseable body: verification must fail first
        let mut webhook = signed_webhook("wrong-secret", b"not json");
        webhook.url = "ignored".to_string();
        let err = provider.verify_webhook(&webhook).unwrap_err();
        assert!(matches!(err, WebhookVerifyError::InvalidSignature));
    }

    #[test]
    fn sendgrid_webhook_rejects_stale_timestamp() {
        let provider = SendgridEmail::new(&settings());
        let body = b"[]";
        let timestamp = (Utc::now().timestamp() - 301).to_string();
        let signature = sign_timestamped("whsec", &timestamp, body);
        let webhook = InboundWebhook {
            body: body.to_vec(),
            signature: Some(signature),
            timestamp: Some(timestamp),
            url: String::new(),
        };
        let err = provider.verify_webhook(&webhook).unwrap_err();
        assert!(matches!(err, WebhookVerifyError::StaleTimestamp));
    }

    #[test]
    fn sendgrid_vocabulary_maps_to_canonical_states() {
        let provider = SendgridEmail::new(&settings());
        assert_eq!(provider.translate_status("delivered"), Some(AttemptState::Delivered));
        assert_eq!(provider.translate_status("bounce"), Some(AttemptState::Bounced));
        assert_eq!(provider.translate_status("dropped"), Some(AttemptState::Dropped));
        assert_eq!(provider.translate_status("spamreport"), Some(AttemptState::Suppressed));
        assert_eq!(provider.translate_status("open"), None);
        assert_eq!(provider.translate_status("mystery"), None);
    }

    #[test]
    fn postmark_single_record_becomes_one_event() {
        let mut cfg = settings();
        cfg.adapter = AdapterKind::Postmark;
        let provider = PostmarkEmail::new(&cfg);
        let body =
            serde_json::to_vec(&serde_json::json!({"RecordType": "Bounce", "MessageID": "pm-1"}))
                .unwrap();
        let events = provider.verify_webhook(&signed_webhook("whsec", &body)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_event_id, "pm-1:Bounce");
        assert_eq!(provider.translate_status(&events[0].raw_status), Some(AttemptState::Bounced));
    }
}
