use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::Channel;
use crate::domain::EmailAddress;
use crate::domain::PhoneNumber;
use crate::domain::Recipient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Transactional,
    Marketing,
    Critical,
    Operational,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Transactional => "transactional",
            NotificationType::Marketing => "marketing",
            NotificationType::Critical => "critical",
            NotificationType::Operational => "operational",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "transactional" => Ok(NotificationType::Transactional),
            "marketing" => Ok(NotificationType::Marketing),
            "critical" => Ok(NotificationType::Critical),
            "operational" => Ok(NotificationType::Operational),
            other => Err(format!("unknown notification type: {other:?}")),
        }
    }

    /// Consent is required for the opt-in categories only.
    pub fn requires_consent(&self) -> bool {
        matches!(
            self,
            NotificationType::Marketing | NotificationType::Operational
        )
    }

    /// Whether the degradation controller may rewrite the channel for this
    /// type. Opt-in categories stay on the channel that was consented to.
    pub fn allows_channel_substitution(&self) -> bool {
        matches!(
            self,
            NotificationType::Transactional | NotificationType::Critical
        )
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other:?}")),
        }
    }

    /// Queue ordering rank; higher dequeues first.
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    Api,
    Event,
    Scheduled,
}

impl RequestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestSource::Api => "api",
            RequestSource::Event => "event",
            RequestSource::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "api" => Ok(RequestSource::Api),
            "event" => Ok(RequestSource::Event),
            "scheduled" => Ok(RequestSource::Scheduled),
            other => Err(format!("unknown request source: {other:?}")),
        }
    }
}

/// An accepted intent to notify. Immutable once persisted.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub venue_id: Option<Uuid>,
    pub recipient: Recipient,
    pub channel: Channel,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub template_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Uuid,
    pub source: RequestSource,
    pub created_at: DateTime<Utc>,
}

/// Validated input for a new request. Construction enforces:
/// exactly one of (template_ref, inline body) is present, and the recipient
/// carries a well-formed contact for the requested channel.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub tenant_id: Uuid,
    pub venue_id: Option<Uuid>,
    pub recipient: Recipient,
    pub channel: Channel,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub template_ref: Option<String>,
    pub correlation_id: Uuid,
    pub source: RequestSource,
}

pub struct NewNotificationParts {
    pub tenant_id: Uuid,
    pub venue_id: Option<Uuid>,
    pub recipient: Recipient,
    pub channel: Channel,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub template_ref: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub source: RequestSource,
}

impl NewNotification {
    pub fn parse(parts: NewNotificationParts) -> Result<Self, String> {
        let has_body = parts.body_text.as_deref().is_some_and(|b| !b.is_empty())
            || parts.body_html.as_deref().is_some_and(|b| !b.is_empty());
        let has_template = parts.template_ref.as_deref().is_some_and(|t| !t.is_empty());
        match (has_template, has_body) {
            (true, true) => return Err("template_ref and inline body are exclusive".into()),
            (false, false) => return Err("either template_ref or a body is required".into()),
            _ => {}
        }

        match parts.channel {
            Channel::Email => {
                let email = parts
                    .recipient
                    .email
                    .clone()
                    .ok_or("email channel requires recipient.email")?;
                EmailAddress::parse(email)?;
            }
            Channel::Sms => {
                let phone = parts
                    .recipient
                    .phone
                    .clone()
                    .ok_or("sms channel requires recipient.phone")?;
                PhoneNumber::parse(phone)?;
            }
            Channel::Push => {
                if !parts.recipient.has_contact_for(Channel::Push) {
                    return Err("push channel requires recipient.push_token".into());
                }
            }
        }

        if parts.recipient.id.is_empty() {
            return Err("recipient.id is required".into());
        }

        Ok(Self {
            tenant_id: parts.tenant_id,
            venue_id: parts.venue_id,
            recipient: parts.recipient,
            channel: parts.channel,
            notification_type: parts.notification_type,
            priority: parts.priority,
            subject: parts.subject,
            body_text: parts.body_text,
            body_html: parts.body_html,
            template_ref: parts.template_ref,
            correlation_id: parts.correlation_id.unwrap_or_else(Uuid::new_v4),
            source: parts.source,
        })
    }
}
