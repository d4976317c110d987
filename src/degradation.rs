use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::domain::Channel;
use crate::domain::NotificationRequest;
use crate::domain::NotificationType;
use crate::domain::Priority;
use crate::selector::ChannelAvailability;
use crate::selector::ProviderDirectory;

/// Global coarse health level, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceMode {
    Normal,
    Partial,
    Degraded,
    Critical,
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceMode::Normal => "NORMAL",
            ServiceMode::Partial => "PARTIAL",
            ServiceMode::Degraded => "DEGRADED",
            ServiceMode::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// One probe round over every dependency the mode derives from.
#[derive(Debug, Clone)]
pub struct DependencySnapshot {
    pub datastore_healthy: bool,
    pub queue_healthy: bool,
    pub cache_healthy: bool,
    pub channels: HashMap<Channel, ChannelAvailability>,
}

/// Pure mode derivation; the controller only adds damping on top.
pub fn derive_mode(snapshot: &DependencySnapshot) -> ServiceMode {
    if !snapshot.datastore_healthy {
        return ServiceMode::Critical;
    }
    let any_channel_down = snapshot
        .channels
        .values()
        .any(|a| *a == ChannelAvailability::Down);
    if any_channel_down || !snapshot.queue_healthy || !snapshot.cache_healthy {
        return ServiceMode::Degraded;
    }
    let any_partial = snapshot
        .channels
        .values()
        .any(|a| *a == ChannelAvailability::Partial);
    if any_partial {
        return ServiceMode::Partial;
    }
    ServiceMode::Normal
}

/// What to do with an inbound request at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    /// 429 + Retry-After.
    Shed { retry_after: Duration },
    /// 503.
    Reject,
}

/// What to do with a claimed job before any compliance or provider work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    Proceed,
    /// Requeue with a delay.
    Defer { delay: Duration },
    /// Rewrite the job onto another channel the recipient can receive.
    Fallback { channel: Channel },
}

const SHED_RETRY_AFTER: Duration = Duration::from_secs(30);
const DEFER_DELAY: Duration = Duration::from_secs(60);

struct ModeState {
    current: ServiceMode,
    recent: VecDeque<ServiceMode>,
}

/// Holds the damped global mode. Changing mode requires the same candidate
/// in two of the last three probe rounds, so one flapping probe cannot swing
/// admission behavior.
pub struct DegradationController {
    state: Mutex<ModeState>,
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new()
    }
}

impl DegradationController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModeState {
                current: ServiceMode::Normal,
                recent: VecDeque::with_capacity(3),
            }),
        }
    }

    pub fn mode(&self) -> ServiceMode {
        self.state.lock().expect("mode mutex poisoned").current
    }

    /// Feed one probe round. Returns the (possibly unchanged) active mode.
    pub fn observe(&self, snapshot: &DependencySnapshot) -> ServiceMode {
        let candidate = derive_mode(snapshot);
        let mut state = self.state.lock().expect("mode mutex poisoned");
        if state.recent.len() == 3 {
            state.recent.pop_front();
        }
        state.recent.push_back(candidate);

        if candidate != state.current {
            let votes = state.recent.iter().filter(|m| **m == candidate).count();
            if votes >= 2 {
                tracing::warn!(
                    from = %state.current,
                    to = %candidate,
                    datastore = snapshot.datastore_healthy,
                    queue = snapshot.queue_healthy,
                    cache = snapshot.cache_healthy,
                    "service mode change"
                );
                state.current = candidate;
            }
        }
        state.current
    }

    /// Admission for the synchronous API surface.
    pub fn decide_admission(
        &self,
        notification_type: NotificationType,
        priority: Priority,
    ) -> AdmissionDecision {
        match self.mode() {
            // critical-type traffic still lands in the durable outbox
            ServiceMode::Critical if notification_type != NotificationType::Critical => {
                AdmissionDecision::Reject
            }
            ServiceMode::Degraded
                if notification_type == NotificationType::Marketing
                    || priority == Priority::Low =>
            {
                AdmissionDecision::Shed {
                    retry_after: SHED_RETRY_AFTER,
                }
            }
            _ => AdmissionDecision::Admit,
        }
    }

    /// Dispatch-time decision for a claimed job.
    pub fn decide_dispatch(
        &self,
        request: &NotificationRequest,
        job_channel: Channel,
        availability: ChannelAvailability,
    ) -> DispatchDecision {
        let mode = self.mode();

        if mode >= ServiceMode::Degraded
            && (request.notification_type == NotificationType::Marketing
                || request.priority == Priority::Low)
        {
            return DispatchDecision::Defer { delay: DEFER_DELAY };
        }

        if availability == ChannelAvailability::Down
            || availability == ChannelAvailability::Unconfigured
        {
            if request.notification_type.allows_channel_substitution() {
                if let Some(channel) = fallback_channel(request, job_channel) {
                    return DispatchDecision::Fallback { channel };
                }
            }
            return DispatchDecision::Defer { delay: DEFER_DELAY };
        }

        DispatchDecision::Proceed
    }
}

/// The substitute channel the recipient can actually receive. Consent on the
/// substitute is re-checked by the compliance gate afterwards.
fn fallback_channel(request: &NotificationRequest, from: Channel) -> Option<Channel> {
    let candidate = match from {
        Channel::Email => Channel::Sms,
        Channel::Sms | Channel::Push => Channel::Email,
    };
    request
        .recipient
        .has_contact_for(candidate)
        .then_some(candidate)
}

/// Periodic dependency probe feeding the controller. The queue consumer
/// reports its own liveness through `queue_healthy`.
#[allow(clippy::too_many_arguments)]
pub async fn run_mode_probes(
    controller: Arc<DegradationController>,
    pool: PgPool,
    directory: Arc<ProviderDirectory>,
    queue_healthy: Arc<AtomicBool>,
    redis: Option<ConnectionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }

        let datastore_healthy = sqlx::query("SELECT 1").execute(&pool).await.is_ok();
        let cache_healthy = match redis.clone() {
            None => true,
            Some(mut conn) => redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok(),
        };
        let snapshot = DependencySnapshot {
            datastore_healthy,
            queue_healthy: queue_healthy.load(Ordering::Relaxed),
            cache_healthy,
            channels: Channel::ALL
                .iter()
                .map(|c| (*c, directory.channel_availability(*c)))
                .collect(),
        };
        controller.observe(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::Recipient;
    use crate::domain::RequestSource;

    fn snapshot(datastore: bool, queue: bool, cache: bool, email: ChannelAvailability) -> DependencySnapshot {
        DependencySnapshot {
            datastore_healthy: datastore,
            queue_healthy: queue,
            cache_healthy: cache,
            channels: HashMap::from([(Channel::Email, email)]),
        }
    }

    fn request(notification_type: NotificationType, phone: Option<&str>) -> NotificationRequest {
        NotificationRequest {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            venue_id: None,
            recipient: Recipient {
                id: "r-1".into(),
                email: Some("a@x.com".into()),
                phone: phone.map(String::from),
                push_token: None,
                timezone: None,
            },
            channel: Channel::Email,
            notification_type,
            priority: Priority::Normal,
            subject: None,
            body_text: Some("ok".into()),
            body_html: None,
            template_ref: None,
            idempotency_key: None,
            correlation_id: Uuid::new_v4(),
            source: RequestSource::Api,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn mode_derivation_orders_by_severity() {
        let full = ChannelAvailability::Full;
        assert_eq!(derive_mode(&snapshot(true, true, true, full)), ServiceMode::Normal);
        assert_eq!(
            derive_mode(&snapshot(true, true, true, ChannelAvailability::Partial)),
            ServiceMode::Partial
        );
        assert_eq!(
            derive_mode(&snapshot(true, true, true, ChannelAvailability::Down)),
            ServiceMode::Degraded
        );
        assert_eq!(derive_mode(&snapshot(true, false, true, full)), ServiceMode::Degraded);
        assert_eq!(derive_mode(&snapshot(true, true, false, full)), ServiceMode::Degraded);
        assert_eq!(
            derive_mode(&snapshot(false, true, true, full)),
            ServiceMode::Critical
        );
    }

    #[test]
    fn one_bad_probe_round_does_not_change_mode() {
        let controller = DegradationController::new();
        let bad = snapshot(true, true, true, ChannelAvailability::Down);
        let good = snapshot(true, true, true, ChannelAvailability::Full);

        assert_eq!(controller.observe(&bad), ServiceMode::Normal);
        assert_eq!(controller.observe(&good), ServiceMode::Normal);
        assert_eq!(controller.observe(&good), ServiceMode::Normal);
    }

    #[test]
    fn two_of_three_rounds_change_mode() {
        let controller = DegradationController::new();
        let bad = snapshot(true, true, true, ChannelAvailability::Down);
        assert_eq!(controller.observe(&bad), ServiceMode::Normal);
        assert_eq!(controller.observe(&bad), ServiceMode::Degraded);
    }

    #[test]
    fn critical_mode_rejects_all_but_critical_type() {
        let controller = DegradationController::new();
        let down = snapshot(false, true, true, ChannelAvailability::Full);
        controller.observe(&down);
        controller.observe(&down);
        assert_eq!(controller.mode(), ServiceMode::Critical);

        assert_eq!(
            controller.decide_admission(NotificationType::Transactional, Priority::High),
            AdmissionDecision::Reject
        );
        assert_eq!(
            controller.decide_admission(NotificationType::Critical, Priority::Critical),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn degraded_mode_sheds_marketing_and_low_priority() {
        let controller = DegradationController::new();
        let degraded = snapshot(true, false, true, ChannelAvailability::Full);
        controller.observe(&degraded);
        controller.observe(&degraded);

        assert!(matches!(
            controller.decide_admission(NotificationType::Marketing, Priority::Normal),
            AdmissionDecision::Shed { .. }
        ));
        assert_eq!(
            controller.decide_admission(NotificationType::Transactional, Priority::High),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn downed_email_falls_back_to_sms_when_the_recipient_has_a_phone() {
        let controller = DegradationController::new();
        let request = request(NotificationType::Transactional, Some("+14155550123"));
        assert_eq!(
            controller.decide_dispatch(&request, Channel::Email, ChannelAvailability::Down),
            DispatchDecision::Fallback {
                channel: Channel::Sms
            }
        );
    }

    #[test]
    fn downed_email_defers_without_a_fallback_contact() {
        let controller = DegradationController::new();
        let request = request(NotificationType::Transactional, None);
        assert!(matches!(
            controller.decide_dispatch(&request, Channel::Email, ChannelAvailability::Down),
            DispatchDecision::Defer { .. }
        ));
    }

    #[test]
    fn marketing_never_substitutes_channels() {
        let controller = DegradationController::new();
        let request = request(NotificationType::Marketing, Some("+14155550123"));
        assert!(matches!(
            controller.decide_dispatch(&request, Channel::Email, ChannelAvailability::Down),
            DispatchDecision::Defer { .. }
        ));
    }
}
