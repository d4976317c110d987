use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use hmac::Hmac;
use hmac::Mac;
use lapin::options::BasicAckOptions;
use lapin::options::BasicConsumeOptions;
use lapin::options::BasicNackOptions;
use lapin::options::BasicPublishOptions;
use lapin::options::BasicQosOptions;
use lapin::options::ExchangeDeclareOptions;
use lapin::options::QueueBindOptions;
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::BasicProperties;
use lapin::Connection;
use lapin::ConnectionProperties;
use lapin::ExchangeKind;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::configuration::RecipientDirectorySettings;
use crate::configuration::Settings;
use crate::domain::Channel;
use crate::domain::NewNotification;
use crate::domain::NewNotificationParts;
use crate::domain::NotificationType;
use crate::domain::Priority;
use crate::domain::Recipient;
use crate::repository;

/// Domain events the service consumes, with their channel and priority
/// policy.
const ROUTING_KEYS: [&str; 8] = [
    "payment.completed",
    "payment.failed",
    "refund.processed",
    "dispute.created",
    "ticket.transferred",
    "event.reminder",
    "event.cancelled",
    "event.updated",
];

const EVENT_DEDUPE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Deserialize)]
struct BusEvent {
    event_id: String,
    event_type: String,
    tenant_id: Uuid,
    venue_id: Option<Uuid>,
    subject: Option<String>,
    body_text: Option<String>,
    body_html: Option<String>,
    template_ref: Option<String>,
    recipients: Vec<EventRecipient>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventRecipient {
    id: String,
    email: Option<String>,
    phone: Option<String>,
    push_token: Option<String>,
    timezone: Option<String>,
}

/// Channel/priority/type policy per event, straight from the routing table.
fn event_policy(event_type: &str) -> Option<(Vec<Channel>, Priority, NotificationType)> {
    let policy = match event_type {
        "payment.completed" => (
            vec![Channel::Email, Channel::Sms],
            Priority::High,
            NotificationType::Transactional,
        ),
        "payment.failed" => (
            vec![Channel::Email, Channel::Sms],
            Priority::High,
            NotificationType::Transactional,
        ),
        "refund.processed" => (
            vec![Channel::Email],
            Priority::High,
            NotificationType::Transactional,
        ),
        "dispute.created" => (
            vec![Channel::Email],
            Priority::Critical,
            NotificationType::Critical,
        ),
        "ticket.transferred" => (
            vec![Channel::Email],
            Priority::High,
            NotificationType::Transactional,
        ),
        "event.reminder" => (
            vec![Channel::Email],
            Priority::Normal,
            NotificationType::Operational,
        ),
        "event.cancelled" => (
            vec![Channel::Email, Channel::Sms],
            Priority::Critical,
            NotificationType::Critical,
        ),
        "event.updated" => (
            vec![Channel::Email],
            Priority::Normal,
            NotificationType::Operational,
        ),
        _ => return None,
    };
    Some(policy)
}

#[derive(Debug, thiserror::Error)]
enum MapError {
    #[error("unknown event type {0:?}")]
    UnknownType(String),
    #[error("no deliverable recipient after enrichment")]
    MissingRecipientData,
}

/// Expand one bus event into notification requests: one per recipient per
/// policy channel the recipient has a contact for. A recipient missing the
/// contact for one channel still gets the others.
fn map_event(event: &BusEvent, recipients: &[Recipient]) -> Result<Vec<NewNotification>, MapError> {
    let (channels, priority, notification_type) =
        event_policy(&event.event_type).ok_or_else(|| MapError::UnknownType(event.event_type.clone()))?;

    let has_body = event.body_text.is_some() || event.body_html.is_some();
    let template_ref = if has_body {
        event.template_ref.clone()
    } else {
        // pre-rendered templates are referenced by event type by default
        Some(
            event
                .template_ref
                .clone()
                .unwrap_or_else(|| event.event_type.clone()),
        )
    };

    let mut notifications = Vec::new();
    for recipient in recipients {
        for channel in &channels {
            if !recipient.has_contact_for(*channel) {
                continue;
            }
            let parsed = NewNotification::parse(NewNotificationParts {
                tenant_id: event.tenant_id,
                venue_id: event.venue_id,
                recipient: recipient.clone(),
                channel: *channel,
                notification_type,
                priority,
                subject: event.subject.clone(),
                body_text: event.body_text.clone(),
                body_html: event.body_html.clone(),
                template_ref: template_ref.clone(),
                correlation_id: Uuid::try_parse(&event.event_id).ok(),
                source: crate::domain::RequestSource::Event,
            });
            match parsed {
                Ok(n) => notifications.push(n),
                Err(e) => {
                    tracing::warn!(
                        event_type = %event.event_type,
                        channel = %channel,
                        error = %e,
                        "skipping undeliverable recipient/channel pair"
                    );
                }
            }
        }
    }
    if notifications.is_empty() {
        return Err(MapError::MissingRecipientData);
    }
    Ok(notifications)
}

/// Short-TTL guard against bus redeliveries.
#[async_trait]
trait EventDedupe: Send + Sync {
    /// Marks the id seen; returns true when it already was.
    async fn check_and_mark(&self, event_id: &str) -> bool;
}

struct RedisDedupe {
    connection: ConnectionManager,
}

#[async_trait]
impl EventDedupe for RedisDedupe {
    async fn check_and_mark(&self, event_id: &str) -> bool {
        let mut conn = self.connection.clone();
        let key = format!("evt:{event_id}");
        let set: Result<bool, _> = conn
            .set_nx::<_, _, bool>(&key, 1)
            .await;
        match set {
            Ok(true) => {
                let _: Result<(), _> = conn.expire(&key, EVENT_DEDUPE_TTL.as_secs() as i64).await;
                false
            }
            Ok(false) => true,
            Err(e) => {
                // dedupe is best-effort; failing open preserves at-least-once
                tracing::error!(error.cause_chain = ?e, "event dedupe store failed");
                false
            }
        }
    }
}

struct InMemoryDedupe {
    seen: Mutex<HashMap<String, Instant>>,
}

#[async_trait]
impl EventDedupe for InMemoryDedupe {
    async fn check_and_mark(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedupe mutex poisoned");
        let now = Instant::now();
        seen.retain(|_, inserted| now.duration_since(*inserted) < EVENT_DEDUPE_TTL);
        seen.insert(event_id.to_string(), now).is_some()
    }
}

/// Upstream contact lookup with a bounded in-process TTL cache. Events that
/// already carry contacts skip the lookup entirely.
pub struct RecipientDirectory {
    client: reqwest::Client,
    base_url: Option<String>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Recipient, Instant)>>,
}

#[derive(Deserialize)]
struct DirectoryContact {
    email: Option<String>,
    phone: Option<String>,
    push_token: Option<String>,
    timezone: Option<String>,
}

impl RecipientDirectory {
    pub fn new(settings: &RecipientDirectorySettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
                .timeout(Duration::from_millis(settings.total_timeout_ms))
                .build()
                .expect("failed to build directory client"),
            base_url: settings.base_url.clone(),
            cache_ttl: Duration::from_secs(settings.cache_ttl_seconds),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn enrich(&self, tenant_id: Uuid, recipient: &EventRecipient) -> Recipient {
        let provided = Recipient {
            id: recipient.id.clone(),
            email: recipient.email.clone(),
            phone: recipient.phone.clone(),
            push_token: recipient.push_token.clone(),
            timezone: recipient.timezone.clone(),
        };
        let has_any_contact =
            provided.email.is_some() || provided.phone.is_some() || provided.push_token.is_some();
        let Some(base_url) = &self.base_url else {
            return provided;
        };
        if has_any_contact {
            return provided;
        }

        let cache_key = format!("{tenant_id}:{}", recipient.id);
        if let Some((cached, inserted)) = self
            .cache
            .lock()
            .expect("directory cache poisoned")
            .get(&cache_key)
            .cloned()
        {
            if inserted.elapsed() < self.cache_ttl {
                return cached;
            }
        }

        let url = format!("{base_url}/tenants/{tenant_id}/recipients/{}", recipient.id);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<DirectoryContact>().await {
                Ok(contact) => {
                    let enriched = Recipient {
                        id: recipient.id.clone(),
                        email: contact.email,
                        phone: contact.phone,
                        push_token: contact.push_token,
                        timezone: contact.timezone,
                    };
                    self.cache
                        .lock()
                        .expect("directory cache poisoned")
                        .insert(cache_key, (enriched.clone(), Instant::now()));
                    enriched
                }
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, "directory response unparseable");
                    provided
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "directory lookup failed");
                provided
            }
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "directory lookup failed");
                provided
            }
        }
    }
}

enum HandleOutcome {
    Ack,
    DeadLetter(String),
    Requeue,
}

async fn handle_message(
    pool: &PgPool,
    dedupe: &dyn EventDedupe,
    directory: &RecipientDirectory,
    signature_key: Option<&str>,
    headers: Option<&FieldTable>,
    body: &[u8],
) -> HandleOutcome {
    if let Some(key) = signature_key {
        let provided = headers
            .and_then(|h| {
                h.inner()
                    .iter()
                    .find(|(name, _)| name.as_str() == "x-signature")
                    .map(|(_, value)| value)
            })
            .and_then(|v| v.as_long_string())
            .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned());
        let Some(provided) = provided else {
            tracing::warn!("bus message missing signature; dropping");
            return HandleOutcome::Ack;
        };
        if !verify_bus_signature(key, body, &provided) {
            tracing::warn!("bus message signature mismatch; dropping");
            return HandleOutcome::Ack;
        }
    }

    let event: BusEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error.cause_chain = ?e, "malformed bus message");
            return HandleOutcome::DeadLetter("malformed".to_string());
        }
    };

    if dedupe.check_and_mark(&event.event_id).await {
        tracing::debug!(event_id = %event.event_id, "duplicate event skipped");
        return HandleOutcome::Ack;
    }

    let mut recipients = Vec::with_capacity(event.recipients.len());
    for recipient in &event.recipients {
        recipients.push(directory.enrich(event.tenant_id, recipient).await);
    }

    let notifications = match map_event(&event, &recipients) {
        Ok(n) => n,
        Err(e @ MapError::UnknownType(_)) => {
            tracing::warn!(error = %e, "unroutable event");
            return HandleOutcome::DeadLetter(e.to_string());
        }
        Err(e @ MapError::MissingRecipientData) => {
            tracing::warn!(event_id = %event.event_id, error = %e, "event missing critical data");
            return HandleOutcome::DeadLetter(e.to_string());
        }
    };

    // request + outbox row in one transaction; the bus ack follows commit
    match persist_notifications(pool, &notifications).await {
        Ok(()) => HandleOutcome::Ack,
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, event_id = %event.event_id, "event persistence failed");
            HandleOutcome::Requeue
        }
    }
}

async fn persist_notifications(
    pool: &PgPool,
    notifications: &[NewNotification],
) -> Result<(), anyhow::Error> {
    let mut transaction = pool.begin().await?;
    for notification in notifications {
        let request_id = Uuid::new_v4();
        repository::insert_request(&mut transaction, request_id, notification, None).await?;
        repository::insert_outbox_entry(
            &mut transaction,
            request_id,
            notification.tenant_id,
            notification.channel,
            notification.priority,
            None,
        )
        .await?;
    }
    transaction.commit().await?;
    Ok(())
}

fn verify_bus_signature(key: &str, body: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Bus consumer: declares the topology, consumes with bounded prefetch, and
/// reconnects with a fixed backoff. `queue_healthy` feeds the degradation
/// controller.
pub async fn init_event_ingress(
    cfg: Settings,
    pool: PgPool,
    redis: Option<ConnectionManager>,
    queue_healthy: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    if !cfg.queue.enabled {
        tracing::info!("event ingress disabled by configuration");
        queue_healthy.store(true, Ordering::Relaxed);
        // park until shutdown so the supervisor doesn't treat this as a crash
        let _ = shutdown.changed().await;
        return Ok(());
    }

    let dedupe: Arc<dyn EventDedupe> = match redis {
        Some(connection) => Arc::new(RedisDedupe { connection }),
        None => {
            tracing::warn!("event dedupe is process-local; bus redeliveries across instances \
                            will not be deduplicated");
            Arc::new(InMemoryDedupe {
                seen: Mutex::new(HashMap::new()),
            })
        }
    };
    let directory = RecipientDirectory::new(&cfg.recipient_directory);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match consume_until_closed(&cfg, &pool, dedupe.as_ref(), &directory, &queue_healthy, &mut shutdown)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                queue_healthy.store(false, Ordering::Relaxed);
                tracing::error!(error.cause_chain = ?e, "bus consumer failed; reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
    }
}

async fn consume_until_closed(
    cfg: &Settings,
    pool: &PgPool,
    dedupe: &dyn EventDedupe,
    directory: &RecipientDirectory,
    queue_healthy: &AtomicBool,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let connection = Connection::connect(
        cfg.queue.url.expose_secret(),
        ConnectionProperties::default(),
    )
    .await?;
    let channel = connection.create_channel().await?;

    channel
        .exchange_declare(
            &cfg.queue.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &cfg.queue.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &cfg.queue.dead_letter_queue(),
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    for key in ROUTING_KEYS {
        channel
            .queue_bind(
                &cfg.queue.queue,
                &cfg.queue.exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    channel
        .basic_qos(cfg.queue.prefetch, BasicQosOptions::default())
        .await?;

    let mut consumer = channel
        .basic_consume(
            &cfg.queue.queue,
            "notify-dispatch",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    queue_healthy.store(true, Ordering::Relaxed);
    tracing::info!(queue = %cfg.queue.queue, "bus consumer started");

    let signature_key = cfg
        .queue
        .signature_key
        .as_ref()
        .map(|k| k.expose_secret().clone());

    loop {
        let delivery = tokio::select! {
            delivery = consumer.next() => delivery,
            _ = shutdown.changed() => {
                // remaining prefetched messages are redelivered after close
                return Ok(());
            }
        };
        let Some(delivery) = delivery else {
            anyhow::bail!("bus consumer stream closed");
        };
        let delivery = delivery?;

        let outcome = handle_message(
            pool,
            dedupe,
            directory,
            signature_key.as_deref(),
            delivery.properties.headers().as_ref(),
            &delivery.data,
        )
        .await;

        match outcome {
            HandleOutcome::Ack => delivery.ack(BasicAckOptions::default()).await?,
            HandleOutcome::DeadLetter(reason) => {
                let _confirm = channel
                    .basic_publish(
                        "",
                        &cfg.queue.dead_letter_queue(),
                        BasicPublishOptions::default(),
                        &delivery.data,
                        BasicProperties::default().with_app_id(reason.into()),
                    )
                    .await?;
                delivery.ack(BasicAckOptions::default()).await?;
            }
            HandleOutcome::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await?;
            }
        }
    }
}
