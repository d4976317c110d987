use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::domain::Channel;
use crate::providers::NotificationProvider;

/// Consecutive failures past which a provider is skipped even while its
/// circuit is still technically closed.
pub const HARD_FAIL_LIMIT: u32 = 10;

pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_state_change_at: DateTime<Utc>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_error: None,
            last_state_change_at: Utc::now(),
        }
    }
}

/// Process-local provider health, fed by send outcomes and the probe loop.
/// Reconstructed from live traffic after a restart.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<Mutex<HashMap<String, ProviderHealth>>>,
}

impl HealthRegistry {
    pub fn record_success(&self, provider_id: &str) {
        let mut inner = self.inner.lock().expect("health mutex poisoned");
        let entry = inner.entry(provider_id.to_string()).or_default();
        if !entry.healthy {
            entry.last_state_change_at = Utc::now();
            tracing::info!(provider = provider_id, "provider healthy again");
        }
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    /// A failed send bumps the streak but leaves `healthy` to the probes;
    /// retries on the same provider stay possible until the breaker or the
    /// hard-fail limit cuts in.
    pub fn record_failure(&self, provider_id: &str, error: &str) {
        let mut inner = self.inner.lock().expect("health mutex poisoned");
        let entry = inner.entry(provider_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
    }

    /// Probe verdicts own the `healthy` flag.
    pub fn record_probe_result(&self, provider_id: &str, ok: bool) {
        if ok {
            self.record_success(provider_id);
            return;
        }
        let mut inner = self.inner.lock().expect("health mutex poisoned");
        let entry = inner.entry(provider_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some("health probe failed".to_string());
        if entry.healthy {
            entry.healthy = false;
            entry.last_state_change_at = Utc::now();
            tracing::warn!(provider = provider_id, "provider marked unhealthy by probe");
        }
    }

    pub fn get(&self, provider_id: &str) -> ProviderHealth {
        self.inner
            .lock()
            .expect("health mutex poisoned")
            .get(provider_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.inner.lock().expect("health mutex poisoned").clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no provider available for channel {channel}")]
pub struct NoProviderAvailable {
    pub channel: Channel,
}

/// How much of a channel's configured fleet is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAvailability {
    Full,
    Partial,
    Down,
    Unconfigured,
}

/// The configured fleet plus its derived availability state. Selection is a
/// pure read over snapshots; nothing here holds a lock across I/O.
pub struct ProviderDirectory {
    providers: HashMap<String, Arc<dyn NotificationProvider>>,
    /// Priority order per channel, primary first.
    by_channel: HashMap<Channel, Vec<String>>,
    health: HealthRegistry,
    breakers: CircuitBreakerRegistry,
}

impl ProviderDirectory {
    pub fn new(
        ordered_providers: Vec<Arc<dyn NotificationProvider>>,
        breakers: CircuitBreakerRegistry,
    ) -> Self {
        let mut providers = HashMap::new();
        let mut by_channel: HashMap<Channel, Vec<String>> = HashMap::new();
        for provider in ordered_providers {
            by_channel
                .entry(provider.channel())
                .or_default()
                .push(provider.id().to_string());
            providers.insert(provider.id().to_string(), provider);
        }
        Self {
            providers,
            by_channel,
            health: HealthRegistry::default(),
            breakers,
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn NotificationProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn NotificationProvider>> {
        self.providers.values()
    }

    fn is_usable(&self, provider_id: &str) -> bool {
        // CLOSED, or HALF_OPEN with a free probe slot; a saturated half-open
        // circuit must not be offered to callers
        let circuit_ok = self
            .breakers
            .get(provider_id)
            .map(|b| b.has_capacity())
            .unwrap_or(false);
        let health = self.health.get(provider_id);
        circuit_ok && health.healthy && health.consecutive_failures < HARD_FAIL_LIMIT
    }

    /// Highest-priority usable provider for the channel. Taking anything but
    /// the primary is a failover and is logged as such.
    #[tracing::instrument(skip(self), fields(channel = %channel))]
    pub fn select(
        &self,
        channel: Channel,
    ) -> Result<Arc<dyn NotificationProvider>, NoProviderAvailable> {
        let candidates = self
            .by_channel
            .get(&channel)
            .ok_or(NoProviderAvailable { channel })?;

        for (position, candidate) in candidates.iter().enumerate() {
            if self.is_usable(candidate) {
                if position > 0 {
                    tracing::warn!(
                        primary = %candidates[0],
                        failover_to = %candidate,
                        "primary provider unavailable; failing over"
                    );
                }
                return Ok(self.providers[candidate].clone());
            }
        }
        Err(NoProviderAvailable { channel })
    }

    /// Every usable provider for the channel, in priority order. The
    /// dispatcher walks this list at call time so a candidate that loses the
    /// race for its last half-open slot falls through to the next one.
    pub fn usable_candidates(
        &self,
        channel: Channel,
    ) -> Result<Vec<Arc<dyn NotificationProvider>>, NoProviderAvailable> {
        let candidates = self
            .by_channel
            .get(&channel)
            .ok_or(NoProviderAvailable { channel })?;
        let usable: Vec<_> = candidates
            .iter()
            .filter(|c| self.is_usable(c))
            .map(|c| self.providers[c.as_str()].clone())
            .collect();
        if usable.is_empty() {
            return Err(NoProviderAvailable { channel });
        }
        Ok(usable)
    }

    pub fn primary_id(&self, channel: Channel) -> Option<&str> {
        self.by_channel
            .get(&channel)
            .and_then(|c| c.first())
            .map(String::as_str)
    }

    pub fn channel_availability(&self, channel: Channel) -> ChannelAvailability {
        let Some(candidates) = self.by_channel.get(&channel) else {
            return ChannelAvailability::Unconfigured;
        };
        let usable = candidates.iter().filter(|c| self.is_usable(c)).count();
        if usable == 0 {
            ChannelAvailability::Down
        } else if usable < candidates.len() {
            ChannelAvailability::Partial
        } else {
            ChannelAvailability::Full
        }
    }

    pub fn any_provider_healthy(&self) -> bool {
        self.providers.keys().any(|id| self.is_usable(id))
    }
}

/// 30-second probe loop over cheap provider endpoints. Results feed the
/// health registry always, and the circuit breaker when the circuit admits
/// the probe (which is how an OPEN circuit recovers without real traffic).
pub async fn run_health_probes(
    directory: Arc<ProviderDirectory>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        for provider in directory.all() {
            let id = provider.id().to_string();
            let breaker_permit = directory
                .breakers
                .get(&id)
                .map(|b| b.try_acquire().is_ok())
                .unwrap_or(false);
            let ok = provider.health_probe().await;
            directory.health.record_probe_result(&id, ok);
            if breaker_permit {
                if let Some(breaker) = directory.breakers.get(&id) {
                    if ok {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                }
            }
            tracing::debug!(provider = %id, healthy = ok, "health probe completed");
        }
    }
}
