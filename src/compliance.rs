use chrono::DateTime;
use chrono::Days;
use chrono::NaiveTime;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use sqlx::PgPool;

use crate::domain::address_hash;
use crate::domain::Channel;
use crate::domain::NotificationRequest;
use crate::domain::NotificationType;
use crate::repository;

/// SMS sends outside `[08:00, 21:00)` recipient-local time wait for the next
/// window unless the notification is critical.
fn quiet_window() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
        NaiveTime::from_hms_opt(21, 0, 0).expect("valid time"),
    )
}

/// Pre-send verdict, recorded on the attempt with its reason code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceDecision {
    Allow,
    /// Hard block list hit; terminal `suppressed`.
    Suppress { reason_code: &'static str },
    /// Terminal `rejected`; includes the fail-closed internal-error case.
    Reject { reason_code: &'static str },
    /// Outside an allowed send window; requeue for `resume_at`.
    Reschedule {
        resume_at: DateTime<Utc>,
        reason_code: &'static str,
    },
}

/// The pre-send checks: suppression, consent (with venue scope), quiet
/// hours, in that order. Fail-closed: an internal error yields a
/// non-retryable rejection, never a send.
#[derive(Clone)]
pub struct ComplianceGate {
    pool: PgPool,
}

impl ComplianceGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(
        skip_all,
        fields(tenant_id = %request.tenant_id, request_id = %request.id, channel = %channel)
    )]
    pub async fn evaluate(
        &self,
        request: &NotificationRequest,
        channel: Channel,
    ) -> ComplianceDecision {
        match self.evaluate_inner(request, channel).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    error.cause_chain = ?e,
                    correlation_id = %request.correlation_id,
                    "compliance check failed; rejecting fail-closed"
                );
                ComplianceDecision::Reject {
                    reason_code: "compliance_error",
                }
            }
        }
    }

    async fn evaluate_inner(
        &self,
        request: &NotificationRequest,
        channel: Channel,
    ) -> Result<ComplianceDecision, anyhow::Error> {
        let Some(address) = request.recipient.contact_for(channel) else {
            return Ok(ComplianceDecision::Reject {
                reason_code: "missing_contact",
            });
        };

        if repository::is_suppressed(
            &self.pool,
            request.tenant_id,
            channel,
            &address_hash(address),
        )
        .await?
        {
            return Ok(ComplianceDecision::Suppress {
                reason_code: "suppressed_address",
            });
        }

        if request.notification_type.requires_consent() {
            let granted = repository::has_effective_consent(
                &self.pool,
                request.tenant_id,
                &request.recipient.id,
                channel,
                request.notification_type,
                request.venue_id,
            )
            .await?;
            if !granted {
                return Ok(ComplianceDecision::Reject {
                    reason_code: "no_consent",
                });
            }
        }

        if channel == Channel::Sms && request.notification_type != NotificationType::Critical {
            let tz = resolve_timezone(request.recipient.timezone.as_deref());
            if let Some(resume_at) = next_quiet_hours_exit(Utc::now(), tz) {
                return Ok(ComplianceDecision::Reschedule {
                    resume_at,
                    reason_code: "quiet_hours",
                });
            }
        }

        Ok(ComplianceDecision::Allow)
    }
}

/// Unknown or missing timezone names fall back to UTC; the send is still
/// windowed, just against the least-surprising clock.
pub fn resolve_timezone(name: Option<&str>) -> Tz {
    name.and_then(|n| n.parse().ok()).unwrap_or(chrono_tz::UTC)
}

/// `None` when `now` is inside the allowed window; otherwise the next 08:00
/// in the recipient's timezone, as UTC.
pub fn next_quiet_hours_exit(now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let (window_start, window_end) = quiet_window();
    let local = now.with_timezone(&tz);
    let time = local.time();
    if time >= window_start && time < window_end {
        return None;
    }

    let resume_date = if time >= window_end {
        local
            .date_naive()
            .checked_add_days(Days::new(1))
            .expect("date overflow")
    } else {
        local.date_naive()
    };
    let resume_local = resume_date.and_time(window_start);
    let resume = tz
        .from_local_datetime(&resume_local)
        .earliest()
        // DST gap exactly at 08:00; an hour late beats never
        .unwrap_or_else(|| tz.from_utc_datetime(&(resume_local + chrono::Duration::hours(1))));
    Some(resume.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono_tz::America::Los_Angeles;
    use chrono_tz::UTC;

    use super::*;

    fn at(tz: Tz, h: u32, m: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(2026, 3, 2, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn midday_is_inside_the_window() {
        assert_eq!(next_quiet_hours_exit(at(Los_Angeles, 12, 0), Los_Angeles), None);
        assert_eq!(next_quiet_hours_exit(at(Los_Angeles, 8, 0), Los_Angeles), None);
        assert_eq!(next_quiet_hours_exit(at(Los_Angeles, 20, 59), Los_Angeles), None);
    }

    #[test]
    fn late_evening_reschedules_to_next_morning() {
        let resume = next_quiet_hours_exit(at(Los_Angeles, 23, 15), Los_Angeles).unwrap();
        let local = resume.with_timezone(&Los_Angeles);
        assert_eq!(local.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(local.date_naive().to_string(), "2026-03-03");
    }

    #[test]
    fn nine_pm_sharp_is_outside() {
        let resume = next_quiet_hours_exit(at(Los_Angeles, 21, 0), Los_Angeles).unwrap();
        let local = resume.with_timezone(&Los_Angeles);
        assert_eq!(local.date_naive().to_string(), "2026-03-03");
    }

    #[test]
    fn early_morning_waits_for_same_day_window() {
        let resume = next_quiet_hours_exit(at(Los_Angeles, 6, 30), Los_Angeles).unwrap();
        let local = resume.with_timezone(&Los_Angeles);
        assert_eq!(local.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(local.date_naive().to_string(), "2026-03-02");
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone(Some("Not/AZone")), UTC);
        assert_eq!(resolve_timezone(None), UTC);
        assert_eq!(resolve_timezone(Some("America/Los_Angeles")), Los_Angeles);
    }
}
