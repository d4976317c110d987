mod health;
mod notifications;
mod webhooks;

pub use health::detailed_health;
pub use health::live;
pub use health::ready;
pub use health::startup_probe;
pub use health::HealthState;
pub use notifications::post_notification;
pub use notifications::post_notification_batch;
pub use webhooks::post_webhook;
