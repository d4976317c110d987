use std::time::Duration;

use rand::Rng;

use crate::domain::ErrorClass;
use crate::domain::NotificationType;

/// What the dispatcher should do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule the job for `next_attempt_no` after `delay`.
    Retry {
        delay: Duration,
        next_attempt_no: i32,
    },
    /// Retry budget exhausted on a transient cause; the job dead-letters.
    DeadLetter,
    /// Permanent cause; the attempt is terminal and nothing is rescheduled.
    GiveUp,
}

/// Exponential backoff with jitter and per-type attempt budgets.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(notification_type: NotificationType) -> i32 {
        match notification_type {
            NotificationType::Marketing => 3,
            NotificationType::Critical => 8,
            NotificationType::Transactional | NotificationType::Operational => 5,
        }
    }

    /// Deterministic backoff for `attempt_no` (1-indexed): `min(base * 2^(n-1), cap)`.
    pub fn backoff(&self, attempt_no: i32) -> Duration {
        let exponent = attempt_no.saturating_sub(1).clamp(0, 63) as u32;
        let multiplier = 2u64.saturating_pow(exponent);
        let raw_ms = (self.base.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(raw_ms.min(self.cap.as_millis() as u64))
    }

    /// Apply the `1 +/- jitter` factor.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }

    /// Decide the follow-up for a failed attempt. `retry_after_hint` is a
    /// provider-supplied Retry-After, which overrides backoff when present
    /// (clipped to the cap).
    pub fn decide(
        &self,
        notification_type: NotificationType,
        error_class: ErrorClass,
        attempt_no: i32,
        retry_after_hint: Option<Duration>,
    ) -> RetryDecision {
        if !error_class.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if attempt_no >= Self::max_attempts(notification_type) {
            return RetryDecision::DeadLetter;
        }

        let delay = match (error_class, retry_after_hint) {
            (ErrorClass::RateLimited, Some(hint)) => hint.min(self.cap),
            _ => self.with_jitter(self.backoff(attempt_no)),
        };
        RetryDecision::Retry {
            delay,
            next_attempt_no: attempt_no + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_ge;
    use claims::assert_le;

    use super::*;

    #[test]
    fn backoff_follows_the_doubling_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(63), Duration::from_secs(300));
        // absurd attempt numbers must not overflow
        assert_eq!(policy.backoff(i32::MAX), Duration::from_secs(300));
    }

    #[quickcheck_macros::quickcheck]
    fn backoff_is_monotone_and_bounded(attempt: u8) -> bool {
        let policy = RetryPolicy::default();
        let attempt = attempt as i32 + 1;
        policy.backoff(attempt) <= policy.backoff(attempt + 1)
            && policy.backoff(attempt) <= policy.cap
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::default();
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let jittered = policy.with_jitter(base);
            assert_ge!(jittered, Duration::from_secs(3));
            assert_le!(jittered, Duration::from_secs(5));
        }
    }

    #[test]
    fn permanent_classes_give_up_immediately() {
        let policy = RetryPolicy::default();
        for class in [
            ErrorClass::Permanent,
            ErrorClass::Auth,
            ErrorClass::Validation,
            ErrorClass::Unknown,
        ] {
            assert_eq!(
                policy.decide(NotificationType::Transactional, class, 1, None),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn transient_failure_exhaustion_dead_letters() {
        let policy = RetryPolicy::default();
        // transactional budget is 5 attempts; attempt 5 failing is the end
        assert_eq!(
            policy.decide(NotificationType::Transactional, ErrorClass::Retryable, 5, None),
            RetryDecision::DeadLetter
        );
        // marketing gives up two attempts earlier
        assert_eq!(
            policy.decide(NotificationType::Marketing, ErrorClass::Retryable, 3, None),
            RetryDecision::DeadLetter
        );
        // critical keeps going
        assert!(matches!(
            policy.decide(NotificationType::Critical, ErrorClass::Retryable, 5, None),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn retry_increments_the_attempt_number() {
        let policy = RetryPolicy::default();
        match policy.decide(NotificationType::Transactional, ErrorClass::Timeout, 2, None) {
            RetryDecision::Retry {
                next_attempt_no, ..
            } => assert_eq!(next_attempt_no, 3),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn provider_retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        match policy.decide(
            NotificationType::Transactional,
            ErrorClass::RateLimited,
            1,
            Some(Duration::from_secs(42)),
        ) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(42)),
            other => panic!("expected retry, got {other:?}"),
        }
        // but never beyond the cap
        match policy.decide(
            NotificationType::Transactional,
            ErrorClass::RateLimited,
            1,
            Some(Duration::from_secs(3600)),
        ) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(300)),
            other => panic!("expected retry, got {other:?}"),
        }
    }
}
