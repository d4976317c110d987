use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use crate::configuration::ProviderSettings;
use crate::domain::AttemptState;
use crate::domain::Channel;
use crate::providers::classify_status;
use crate::providers::classify_transport_error;
use crate::providers::http_client;
use crate::providers::parse_retry_after;
use crate::providers::redact_detail;
use crate::providers::verify_url_params;
use crate::providers::InboundWebhook;
use crate::providers::NotificationProvider;
use crate::providers::ProviderEvent;
use crate::providers::ProviderPayload;
use crate::providers::SendOutcome;
use crate::providers::WebhookVerifyError;
use crate::providers::CORRELATION_HEADER;
use crate::providers::SERVICE_IDENTITY;
use crate::providers::SERVICE_IDENTITY_HEADER;

/// Twilio Messages adapter. `account_ref` is the account SID; the API key is
/// the auth token, which also signs status callbacks.
#[derive(Debug)]
pub struct TwilioSms {
    name: String,
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: Secret<String>,
    sender: String,
    webhook_secret: Secret<String>,
}

impl TwilioSms {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: http_client(settings.timeout()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            account_sid: settings.account_ref.clone().unwrap_or_default(),
            auth_token: settings.api_key.clone(),
            sender: settings.sender.clone().unwrap_or_default(),
            webhook_secret: settings.webhook_secret.clone(),
        }
    }
}

#[derive(Deserialize)]
struct TwilioSendResponse {
    sid: String,
}

#[derive(Deserialize)]
struct TwilioErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

#[async_trait]
impl NotificationProvider for TwilioSms {
    fn id(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name, correlation_id = %payload.correlation_id))]
    async fn send(&self, payload: &ProviderPayload<'_>) -> SendOutcome {
        let form = [
            ("To", payload.to),
            ("From", self.sender.as_str()),
            ("Body", payload.body_text.unwrap_or_default()),
        ];

        let started = Instant::now();
        let response = self
            .client
            .post(format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                self.base_url, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .header(CORRELATION_HEADER, payload.correlation_id.to_string())
            .form(&form)
            .send()
            .await;
        let latency = started.elapsed();

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<TwilioSendResponse>()
                    .await
                    .ok()
                    .map(|r| r.sid);
                SendOutcome::accepted(message_id, latency)
            }
            Ok(resp) => {
                let status = resp.status();
                let retry_after = parse_retry_after(resp.headers());
                let text = resp.text().await.unwrap_or_default();
                let code = serde_json::from_str::<TwilioErrorBody>(&text)
                    .ok()
                    .and_then(|b| b.code)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| status.as_u16().to_string());
                let detail = serde_json::from_str::<TwilioErrorBody>(&text)
                    .ok()
                    .and_then(|b| b.message)
                    .unwrap_or(text);
                SendOutcome::failure(
                    classify_status(status),
                    code,
                    redact_detail(&detail, payload.to),
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

        // the scheme signs the public URL plus each form field in sorted
        // order; BTreeMap gives us the ordering
        let params: BTreeMap<String, String> = serde_urlencoded::from_bytes(&webhook.body)
            .map_err(|_| WebhookVerifyError::InvalidSignature)?;
        verify_url_params(
            self.webhook_secret.expose_secret(),
            &webhook.url,
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            signature,
        )?;

        let message_sid = params
            .get("MessageSid")
            .or_else(|| params.get("SmsSid"))
            .cloned()
            .ok_or_else(|| {
                WebhookVerifyError::MalformedPayload(anyhow::anyhow!("missing MessageSid"))
            })?;
        let status = params
            .get("MessageStatus")
            .or_else(|| params.get("SmsStatus"))
            .cloned()
            .ok_or_else(|| {
                WebhookVerifyError::MalformedPayload(anyhow::anyhow!("missing MessageStatus"))
            })?;

        // status callbacks carry no event id; (sid, status) is the dedupe key
        Ok(vec![ProviderEvent {
            provider_event_id: format!("{message_sid}:{status}"),
            provider_message_id: message_sid,
            raw_status: status,
            occurred_at: None,
        }])
    }

    fn translate_status(&self, raw: &str) -> Option<AttemptState> {
        match raw {
            "queued" | "accepted" | "sending" | "sent" => Some(AttemptState::Sent),
            "delivered" => Some(AttemptState::Delivered),
            "undelivered" | "failed" => Some(AttemptState::Failed),
            "canceled" => Some(AttemptState::Dropped),
            _ => None,
        }
    }

    async fn health_probe(&self) -> bool {
        self.client
            .get(format!(
                "{}/2010-04-01/Accounts/{}.json",
                self.base_url, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::Secret;

    use super::*;
    use crate::configuration::AdapterKind;
    use crate::providers::sign_url_params;

    fn provider() -> TwilioSms {
        TwilioSms::new(&ProviderSettings {
            adapter: AdapterKind::Twilio,
            name: "twilio-primary".to_string(),
            base_url: "https://api.twilio.test".to_string(),
            api_key: Secret::new("auth-token".to_string()),
            account_ref: Some("AC123".to_string()),
            sender: Some("+15550001111".to_string()),
            webhook_secret: Secret::new("auth-token".to_string()),
            timeout_ms: 5000,
        })
    }

    fn callback(url: &str, secret: &str) -> InboundWebhook {
        let params: BTreeMap<&str, &str> = BTreeMap::from([
            ("MessageSid", "SM42"),
            ("MessageStatus", "delivered"),
            ("To", "+14155550123"),
        ]);
        let signature = sign_url_params(secret, url, params.iter().map(|(k, v)| (*k, *v)));
        InboundWebhook {
            body: serde_urlencoded::to_string(&params).unwrap().into_bytes(),
            signature: Some(signature),
            timestamp: None,
            url: url.to_string(),
        }
    }

    #[test]
    fn status_callback_verifies_and_extracts_the_event() {
        let provider = provider();
        let url = "https://notify.example.com/v1/webhooks/twilio-primary";
        let events = provider.verify_webhook(&callback(url, "auth-token")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "SM42");
        assert_eq!(events[0].provider_event_id, "SM42:delivered");
    }

    #[test]
    fn wrong_secret_or_url_is_rejected() {
        let provider = provider();
        let url = "https://notify.example.com/v1/webhooks/twilio-primary";
        let err = provider.verify_webhook(&callback(url, "other-token")).unwrap_err();
        assert!(matches!(err, WebhookVerifyError::InvalidSignature));

        let mut replayed = callback(url, "auth-token");
        replayed.url = "https://attacker.example.com/".to_string();
        let err = provider.verify_webhook(&replayed).unwrap_err();
        assert!(matches!(err, WebhookVerifyError::InvalidSignature));
    }

    #[test]
    fn twilio_vocabulary_maps_to_canonical_states() {
        let provider = provider();
        assert_eq!(provider.translate_status("queued"), Some(AttemptState::Sent));
        assert_eq!(provider.translate_status("delivered"), Some(AttemptState::Delivered));
        assert_eq!(provider.translate_status("undelivered"), Some(AttemptState::Failed));
        assert_eq!(provider.translate_status("weird"), None);
    }
}
