use common::domain::PayloadFormat;
use common::http::UserApiConfig;
use common::nats::{NatsConnectConfig, RedeliveryPolicy, SubscriptionConfig};
use common::postgres::PostgresConfig;
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_worker::{TopicError, TopicSet};

/// Which collections the worker reconciles into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// `metausers` / `old_metausers`
    #[default]
    Versioned,
    /// `users` / `old_users`
    Flat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    // NATS configuration
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default)]
    pub nats_user: Option<String>,

    #[serde(default, skip_serializing)]
    pub nats_password: Option<String>,

    /// JetStream stream holding every user topic
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    /// Topics are published as `<prefix>.<topic>`
    #[serde(default = "default_nats_subject_prefix")]
    pub nats_subject_prefix: String,

    /// Durable consumers are named `<prefix>-<topic>`
    #[serde(default = "default_nats_consumer_prefix")]
    pub nats_consumer_prefix: String,

    /// Comma-separated topic names to subscribe to
    #[serde(default = "default_topics")]
    pub topics: String,

    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for batches in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    /// Deliveries buffered per topic between listener and dispatcher
    #[serde(default = "default_nats_channel_capacity")]
    pub nats_channel_capacity: usize,

    /// Highest attempt number that is still resent
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password", skip_serializing)]
    pub postgres_password: String,

    #[serde(default = "default_postgres_pool_size")]
    pub postgres_pool_size: usize,

    /// Deadline for every document store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    // User API configuration
    #[serde(default = "default_user_api_url")]
    pub user_api_url: String,

    #[serde(default = "default_user_api_version")]
    pub user_api_version: u32,

    #[serde(default = "default_user_api_timeout_ms")]
    pub user_api_timeout_ms: u64,

    // Worker behaviour
    #[serde(default)]
    pub payload_format: PayloadFormat,

    #[serde(default)]
    pub store_mode: StoreMode,

    // Health endpoint
    #[serde(default = "default_health_host")]
    pub health_host: String,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Time allowed for closers at shutdown, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "user-sync".to_string()
}

// NATS defaults
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "USERS".to_string()
}

fn default_nats_subject_prefix() -> String {
    "VirtualTopic".to_string()
}

fn default_nats_consumer_prefix() -> String {
    "user-sync".to_string()
}

fn default_topics() -> String {
    "user-create,user-update,user-remove".to_string()
}

fn default_nats_batch_size() -> usize {
    10
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_nats_channel_capacity() -> usize {
    16
}

fn default_max_redeliveries() -> u32 {
    10
}

fn default_redelivery_delay_ms() -> u64 {
    1000
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "users".to_string()
}

fn default_postgres_username() -> String {
    "user_sync".to_string()
}

fn default_postgres_password() -> String {
    "user_sync".to_string()
}

fn default_postgres_pool_size() -> usize {
    5
}

fn default_store_timeout_ms() -> u64 {
    1000
}

// User API defaults
fn default_user_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_user_api_version() -> u32 {
    2
}

fn default_user_api_timeout_ms() -> u64 {
    1000
}

fn default_health_host() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    9090
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("USER_SYNC"))
            .build()?
            .try_deserialize()
    }

    pub fn topic_set(&self) -> Result<TopicSet, TopicError> {
        TopicSet::parse(&self.topics)
    }

    pub fn nats_connect_config(&self) -> NatsConnectConfig {
        NatsConnectConfig {
            url: self.nats_url.clone(),
            user: self.nats_user.clone().filter(|u| !u.is_empty()),
            password: self.nats_password.clone().filter(|p| !p.is_empty()),
            connection_timeout: Duration::from_secs(self.startup_timeout_secs),
        }
    }

    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_redeliveries: self.max_redeliveries,
            delay: Duration::from_millis(self.redelivery_delay_ms),
        }
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            stream: self.nats_stream.clone(),
            consumer_prefix: self.nats_consumer_prefix.clone(),
            batch_size: self.nats_batch_size,
            batch_wait: Duration::from_secs(self.nats_batch_wait_secs),
            channel_capacity: self.nats_channel_capacity,
        }
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_pool_size,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn user_api_config(&self) -> UserApiConfig {
        UserApiConfig {
            base_url: self.user_api_url.clone(),
            api_version: self.user_api_version,
            timeout: Duration::from_millis(self.user_api_timeout_ms),
        }
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.health_host, self.health_port)
    }
}
