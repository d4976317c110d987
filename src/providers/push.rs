use std::time::Instant;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_json::json;

use crate::configuration::ProviderSettings;
use crate::domain::AttemptState;
use crate::domain::Channel;
use crate::providers::classify_status;
use crate::providers::classify_transport_error;
use crate::providers::http_client;
use crate::providers::parse_retry_after;
use crate::providers::redact_detail;
use crate::providers::InboundWebhook;
use crate::providers::NotificationProvider;
use crate::providers::ProviderEvent;
use crate::providers::ProviderPayload;
use crate::providers::SendOutcome;
use crate::providers::WebhookVerifyError;
use crate::providers::CORRELATION_HEADER;
use crate::providers::SERVICE_IDENTITY;
use crate::providers::SERVICE_IDENTITY_HEADER;

/// FCM HTTP v1 adapter. `account_ref` is the project id. FCM reports no
/// delivery callbacks; a push attempt is terminal at `sent`.
#[derive(Debug)]
pub struct FcmPush {
    name: String,
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: Secret<String>,
}

impl FcmPush {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: http_client(settings.timeout()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            project_id: settings.account_ref.clone().unwrap_or_default(),
            api_key: settings.api_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct FcmSendResponse {
    name: String,
}

#[async_trait]
impl NotificationProvider for FcmPush {
    fn id(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name, correlation_id = %payload.correlation_id))]
    async fn send(&self, payload: &ProviderPayload<'_>) -> SendOutcome {
        let body = json!({
            "message": {
                "token": payload.to,
                "notification": {
                    "title": payload.subject.unwrap_or_default(),
                    "body": payload.body_text.unwrap_or_default(),
                },
            }
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!(
                "{}/v1/projects/{}/messages:send",
                self.base_url, self.project_id
            ))
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
                    .json::<FcmSendResponse>()
                    .await
                    .ok()
                    .map(|r| r.name);
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
        _webhook: &InboundWebhook,
    ) -> Result<Vec<ProviderEvent>, WebhookVerifyError> {
        Err(WebhookVerifyError::Unsupported)
    }

    fn translate_status(&self, _raw: &str) -> Option<AttemptState> {
        None
    }

    async fn health_probe(&self) -> bool {
        // no unauthenticated ping endpoint; reachability is the probe
        self.client
            .get(&self.base_url)
            .header(SERVICE_IDENTITY_HEADER, SERVICE_IDENTITY)
            .send()
            .await
            .map(|r| r.status().as_u16() < 500)
            .unwrap_or(false)
    }
}
