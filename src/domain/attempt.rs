use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Canonical state of one provider call. Provider-specific vocabularies are
/// mapped onto this enum by each adapter's `translate_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Queued,
    Sending,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Rejected,
    Dropped,
    Suppressed,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Queued => "queued",
            AttemptState::Sending => "sending",
            AttemptState::Sent => "sent",
            AttemptState::Delivered => "delivered",
            AttemptState::Bounced => "bounced",
            AttemptState::Failed => "failed",
            AttemptState::Rejected => "rejected",
            AttemptState::Dropped => "dropped",
            AttemptState::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(AttemptState::Queued),
            "sending" => Ok(AttemptState::Sending),
            "sent" => Ok(AttemptState::Sent),
            "delivered" => Ok(AttemptState::Delivered),
            "bounced" => Ok(AttemptState::Bounced),
            "failed" => Ok(AttemptState::Failed),
            "rejected" => Ok(AttemptState::Rejected),
            "dropped" => Ok(AttemptState::Dropped),
            "suppressed" => Ok(AttemptState::Suppressed),
            other => Err(format!("unknown attempt state: {other:?}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Delivered
                | AttemptState::Bounced
                | AttemptState::Failed
                | AttemptState::Rejected
                | AttemptState::Dropped
                | AttemptState::Suppressed
        )
    }

    /// Whether a webhook-reported transition from `self` to `next` may be
    /// applied. Terminal states never regress; within non-terminal states the
    /// progression queued -> sending -> sent is one-way.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        if *self == next {
            return false;
        }
        if self.is_terminal() {
            return false;
        }
        self.rank() < next.rank() || next.is_terminal()
    }

    fn rank(&self) -> u8 {
        match self {
            AttemptState::Queued => 0,
            AttemptState::Sending => 1,
            AttemptState::Sent => 2,
            // all terminal states rank equal and last
            _ => 3,
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification driving the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    RateLimited,
    Auth,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Permanent => "permanent",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "retryable" => Ok(ErrorClass::Retryable),
            "permanent" => Ok(ErrorClass::Permanent),
            "rate_limited" => Ok(ErrorClass::RateLimited),
            "auth" => Ok(ErrorClass::Auth),
            "timeout" => Ok(ErrorClass::Timeout),
            "validation" => Ok(ErrorClass::Validation),
            "unknown" => Ok(ErrorClass::Unknown),
            other => Err(format!("unknown error class: {other:?}")),
        }
    }

    /// Classes the retry engine may reschedule; everything else terminates.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Retryable | ErrorClass::RateLimited | ErrorClass::Timeout
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider call outcome, owned by its request and appended only.
#[derive(Debug, Clone)]
pub struct NotificationAttempt {
    pub id: Uuid,
    pub request_id: Uuid,
    pub attempt_no: i32,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub state: AttemptState,
    pub error_code: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub reason_code: Option<String>,
    pub latency_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
