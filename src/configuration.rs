use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

use crate::domain::SubscriberEmail;

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub admin: AdminSettings,
    pub relay: RelaySettings,
    pub dispatch: DispatchSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub username: String,
    pub password: Secret<String>,
    pub database: String,
    #[serde(default)]
    pub require_ssl: bool,
    /// Keep everything in process memory instead of Postgres.
    #[serde(default)]
    pub in_memory: bool,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> Secret<String> {
        let ssl_mode = if self.require_ssl { "require" } else { "prefer" };
        Secret::new(format!(
            "{}/{}?sslmode={}",
            self.connection_string_without_database().expose_secret(),
            self.database,
            ssl_mode,
        ))
    }

    /// Server-level connection, used to create databases.
    pub fn connection_string_without_database(&self) -> Secret<String> {
        Secret::new(format!(
            "postgres://{}:{}@{}:{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
        ))
    }
}

#[derive(Deserialize, Clone)]
pub struct AdminSettings {
    pub username: String,
    /// Argon2 hash in PHC string format.
    pub password_hash: Secret<String>,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    Smtp,
    Http,
}

#[derive(Deserialize, Clone)]
pub struct RelaySettings {
    pub kind: RelayKind,
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// SMTP password, or the server token of the HTTP email API.
    pub password: Secret<String>,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_milliseconds: u64,
}

impl RelaySettings {
    pub fn sender(&self) -> Result<SubscriberEmail, String> {
        SubscriberEmail::parse(self.sender.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_milliseconds)
    }
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// One message, every recipient blind-copied.
    #[default]
    Batched,
    /// One message per recipient with its own unsubscribe link.
    Personalized,
}

#[derive(Deserialize, Clone)]
pub struct DispatchSettings {
    /// Absolute URL prefix used for the logo and unsubscribe links.
    pub public_url: String,
    #[serde(default = "default_logo_path")]
    pub logo_path: String,
    #[serde(default)]
    pub operator_bcc: Option<String>,
    #[serde(default)]
    pub strategy: DeliveryStrategy,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_logo_path() -> String {
    "/static/logo.png".to_string()
}

#[derive(Deserialize, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_attempts: i32,
    pub backoff_seconds: i64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            backoff_seconds: 300,
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let settings = Config::builder()
        .add_source(File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
