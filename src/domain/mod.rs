mod attempt;
mod channel;
mod recipient;
mod request;

pub use attempt::AttemptState;
pub use attempt::ErrorClass;
pub use attempt::NotificationAttempt;
pub use channel::Channel;
pub use recipient::address_hash;
pub use recipient::redact_email;
pub use recipient::redact_phone;
pub use recipient::EmailAddress;
pub use recipient::PhoneNumber;
pub use recipient::Recipient;
pub use request::NewNotification;
pub use request::NewNotificationParts;
pub use request::NotificationRequest;
pub use request::NotificationType;
pub use request::Priority;
pub use request::RequestSource;
