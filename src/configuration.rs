use std::time::Duration;

use config::ConfigError;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::PgConnectOptions;
use sqlx::postgres::PgSslMode;

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub cache: CacheSettings,
    pub providers: ProviderFleetSettings,
    pub dispatcher: DispatcherSettings,
    pub rate_limits: RateLimitSettings,
    pub recipient_directory: RecipientDirectorySettings,
    pub idempotency: IdempotencySettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub base_url: String,
    /// Signs outbound customer webhooks. No default; must be >= 32 chars.
    pub signing_key: Secret<String>,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    pub fn connection_without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }

    pub fn connection(&self) -> PgConnectOptions {
        self.connection_without_db().database(&self.database_name)
    }
}

#[derive(Deserialize, Clone)]
pub struct QueueSettings {
    /// AMQP URI. Production deployments must use `amqps://`.
    pub url: Secret<String>,
    pub exchange: String,
    pub queue: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub prefetch: u16,
    /// HMAC key for bus message signatures; unset disables the check.
    pub signature_key: Option<Secret<String>>,
    /// Local/test runs can disable the bus consumer entirely.
    pub enabled: bool,
}

impl QueueSettings {
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }
}

#[derive(Deserialize, Clone)]
pub struct CacheSettings {
    /// Redis URI backing rate-limit buckets and the event dedupe store.
    /// Unset falls back to in-process state, which is logged as a
    /// single-instance degradation.
    pub url: Option<Secret<String>>,
}

#[derive(Deserialize, Clone)]
pub struct ProviderFleetSettings {
    pub email: ChannelSettings,
    pub sms: ChannelSettings,
    pub push: ChannelSettings,
}

#[derive(Deserialize, Clone)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub primary: Option<ProviderSettings>,
    pub backup: Option<ProviderSettings>,
}

impl ChannelSettings {
    pub fn configured(&self) -> Vec<&ProviderSettings> {
        let mut out = Vec::new();
        if let Some(p) = &self.primary {
            out.push(p);
        }
        if let Some(b) = &self.backup {
            out.push(b);
        }
        out
    }
}

/// Which vendor adapter a configured provider entry uses.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Sendgrid,
    Postmark,
    Twilio,
    Fcm,
}

#[derive(Deserialize, Clone)]
pub struct ProviderSettings {
    pub adapter: AdapterKind,
    /// Stable identifier recorded on attempts, e.g. `sendgrid-primary`.
    pub name: String,
    pub base_url: String,
    pub api_key: Secret<String>,
    /// Twilio account SID, FCM project id, etc. Adapter-specific.
    pub account_ref: Option<String>,
    /// Sender address/number for the channel.
    pub sender: Option<String>,
    pub webhook_secret: Secret<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        // hard ceiling of 30s regardless of configuration
        Duration::from_millis(self.timeout_ms.min(30_000))
    }
}

#[derive(Deserialize, Clone)]
pub struct DispatcherSettings {
    /// Worker count; unset defaults to available cores x 4, capped.
    pub workers: Option<usize>,
    pub max_workers: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub lease_seconds: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub poll_interval_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub drain_timeout_seconds: u64,
}

impl DispatcherSettings {
    pub fn worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.workers.unwrap_or(cores * 4).clamp(1, self.max_workers)
    }
}

#[derive(Deserialize, Clone, Copy)]
pub struct RateLimitSettings {
    /// Tokens per second refilled into each bucket level.
    pub recipient_rate_per_sec: f64,
    pub recipient_burst: f64,
    pub principal_rate_per_sec: f64,
    pub principal_burst: f64,
    pub tenant_rate_per_sec: f64,
    pub tenant_burst: f64,
    /// Client-IP bucket charged at the HTTP accept path.
    pub ip_rate_per_sec: f64,
    pub ip_burst: f64,
}

#[derive(Deserialize, Clone)]
pub struct RecipientDirectorySettings {
    /// Upstream contact-lookup service; unset disables enrichment.
    pub base_url: Option<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub connect_timeout_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub total_timeout_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub cache_ttl_seconds: u64,
}

#[derive(Deserialize, Clone)]
pub struct IdempotencySettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub ttl_hours: u32,
}

/// The runtime environment. Controls which overlay file is loaded and which
/// startup validations are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "production" => Ok(Environment::Production),
            other => Err(format!(
                "{other} is not a supported environment; use `local` or `production`"
            )),
        }
    }
}

/// Load `configuration/base.yaml`, the environment overlay, and `APP__`
/// environment-variable overrides, then run the fatal startup checks.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir().expect("failed to determine current directory");
    let configuration_dir = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;
    let environment_file = format!("{}.yaml", environment.as_str());

    let settings = config::Config::builder()
        .add_source(config::File::from(configuration_dir.join("base.yaml")))
        .add_source(config::File::from(configuration_dir.join(environment_file)))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let settings: Settings = settings.try_deserialize()?;
    settings
        .validate(environment)
        .map_err(ConfigError::Message)?;
    Ok(settings)
}

impl Settings {
    /// Misconfiguration that would silently weaken the service is fatal at
    /// startup, not discovered at send time.
    pub fn validate(&self, environment: Environment) -> Result<(), String> {
        if self.application.signing_key.expose_secret().len() < 32 {
            return Err("application.signing_key must be at least 32 characters".into());
        }

        if environment == Environment::Production {
            let url = self.queue.url.expose_secret();
            if !url.starts_with("amqps://") {
                return Err("queue.url must use amqps:// in production".into());
            }
            if !self.database.require_ssl {
                return Err("database.require_ssl must be true in production".into());
            }
        }

        for (label, channel) in [
            ("email", &self.providers.email),
            ("sms", &self.providers.sms),
            ("push", &self.providers.push),
        ] {
            if !channel.enabled {
                continue;
            }
            if channel.primary.is_none() {
                return Err(format!(
                    "providers.{label} is enabled but has no primary provider"
                ));
            }
            for provider in channel.configured() {
                if provider.api_key.expose_secret().is_empty() {
                    return Err(format!(
                        "provider {} has an empty api_key; unset credentials with an enabled \
                         channel are a startup error",
                        provider.name
                    ));
                }
                if provider.webhook_secret.expose_secret().is_empty() {
                    return Err(format!(
                        "provider {} has an empty webhook_secret",
                        provider.name
                    ));
                }
            }
        }

        Ok(())
    }
}
