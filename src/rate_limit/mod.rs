mod store;

use std::sync::Arc;
use std::time::Duration;

pub use store::InMemoryTokenStore;
pub use store::RedisTokenStore;
pub use store::StoreError;
pub use store::TakeOutcome;
pub use store::TokenStore;
use uuid::Uuid;

use crate::configuration::RateLimitSettings;
use crate::domain::Channel;
use crate::domain::NotificationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied { retry_after: Duration },
}

/// Identities a send can be attributed to, most specific first. The bucket
/// key always embeds the tenant; client-supplied identities are never used
/// as keys.
#[derive(Debug, Clone)]
pub struct LimitSubject {
    pub tenant_id: Uuid,
    pub channel: Channel,
    pub recipient_id: Option<String>,
    /// Authenticated API principal; absent for event-sourced jobs.
    pub principal: Option<String>,
}

/// Distributed token-bucket limiter. Every applicable bucket must admit;
/// the first refusal wins and its wait is surfaced as Retry-After.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TokenStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TokenStore>, settings: RateLimitSettings) -> Self {
        if !store.is_shared() {
            tracing::warn!(
                "rate limiter is using process-local bucket state; limits are per-instance, \
                 not fleet-wide"
            );
        }
        Self { store, settings }
    }

    /// Check all buckets for one dispatch. Critical notifications bypass the
    /// recipient and principal buckets but still consume tenant capacity so
    /// provider quotas stay protected.
    #[tracing::instrument(skip_all, fields(tenant_id = %subject.tenant_id, channel = %subject.channel))]
    pub async fn check(
        &self,
        subject: &LimitSubject,
        notification_type: NotificationType,
    ) -> LimitDecision {
        let mut buckets: Vec<(String, f64, f64)> = Vec::with_capacity(3);
        let is_critical = notification_type == NotificationType::Critical;

        if !is_critical {
            if let Some(recipient) = &subject.recipient_id {
                buckets.push((
                    format!(
                        "rl:{}:{}:recipient:{recipient}",
                        subject.tenant_id, subject.channel
                    ),
                    self.settings.recipient_rate_per_sec,
                    self.settings.recipient_burst,
                ));
            }
            if let Some(principal) = &subject.principal {
                buckets.push((
                    format!(
                        "rl:{}:{}:principal:{principal}",
                        subject.tenant_id, subject.channel
                    ),
                    self.settings.principal_rate_per_sec,
                    self.settings.principal_burst,
                ));
            }
        }
        buckets.push((
            format!("rl:{}:{}", subject.tenant_id, subject.channel),
            self.settings.tenant_rate_per_sec,
            self.settings.tenant_burst,
        ));

        for (key, rate, capacity) in buckets {
            match self.take(&key, rate, capacity).await {
                LimitDecision::Allowed => continue,
                denied => return denied,
            }
        }
        LimitDecision::Allowed
    }

    /// Pre-admission gate for the HTTP surface, keyed by client IP — the
    /// only identity that exists before a request is accepted. The
    /// recipient/principal/tenant buckets are charged at dispatch time,
    /// where retries and bus-sourced traffic converge.
    #[tracing::instrument(skip_all)]
    pub async fn check_source_ip(&self, ip: &str) -> LimitDecision {
        self.take(
            &format!("rl:ip:{ip}"),
            self.settings.ip_rate_per_sec,
            self.settings.ip_burst,
        )
        .await
    }

    async fn take(&self, key: &str, rate: f64, capacity: f64) -> LimitDecision {
        match self.store.try_take(key, rate, capacity, 1.0).await {
            Ok(TakeOutcome::Allowed { .. }) => LimitDecision::Allowed,
            Ok(TakeOutcome::Denied { wait }) => {
                tracing::info!(bucket = %key, wait_secs = wait.as_secs(), "rate limit refusal");
                LimitDecision::Denied {
                    retry_after: wait.max(Duration::from_secs(1)),
                }
            }
            Err(e) => {
                // the limiter is a throttle, not a gate: store outages must
                // not stop traffic
                tracing::error!(error.cause_chain = ?e, bucket = %key, "rate limit store failed; admitting");
                LimitDecision::Allowed
            }
        }
    }
}

/// Right-most entry of a proxy-forwarded header is the only hop our own edge
/// appended; everything left of it is client-controlled.
pub fn client_ip_from_forwarded(header_value: &str) -> Option<String> {
    header_value
        .rsplit(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
