mod dispatch;
mod health;
mod helpers;
mod notifications;
mod webhooks;
