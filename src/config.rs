use crate::store::models::{OperationKind, WebhookMethod};
use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Standalone-relay deployment mode (see `standalone` table in config.toml).
    #[serde(default)]
    pub standalone: StandaloneConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }
}

/// Basic (core) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// HTTP server listen address (e.g., "0.0.0.0", "127.0.0.1").
    /// TOML: `basic.listen_addr`. Default: `0.0.0.0`.
    #[serde(default = "default_listen_ip")]
    pub listen_addr: IpAddr,

    /// HTTP server listen port.
    /// TOML: `basic.listen_port`. Default: `3330`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Database URL for the SQLite configuration store.
    /// TOML: `basic.database_url`. Default: `sqlite://watchpost.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Log level for tracing subscriber initialization.
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Upper bound on a single webhook delivery attempt, in seconds.
    /// TOML: `basic.webhook_timeout_secs`. Default: `30`.
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Upper bound on establishing a source connection, in seconds.
    /// TOML: `basic.connect_timeout_secs`. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_ip(),
            listen_port: default_listen_port(),
            database_url: default_database_url(),
            loglevel: default_loglevel(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Standalone-relay mode: watch a fixed set of collections from config,
/// with no configuration store and no administration API.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StandaloneConfig {
    /// Enables standalone mode. TOML: `standalone.enabled`. Default: `false`.
    #[serde(default)]
    pub enabled: bool,

    /// MongoDB connection string.
    /// TOML: `standalone.mongo_url`. Default: `mongodb://localhost:27017`.
    #[serde(default = "default_mongo_url")]
    pub mongo_url: String,

    /// Logical database to watch. When unset, the namespace is parsed from
    /// `mongo_url` or guessed from the first non-system database.
    #[serde(default)]
    pub database: Option<String>,

    /// Fixed delay before a full rebuild after a feed fault, in milliseconds.
    /// TOML: `standalone.reconnect_interval_ms`. Default: `5000`.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Collections to watch, one feed each.
    #[serde(default)]
    pub collections: Vec<CollectionEntry>,
}

/// One watched collection in standalone mode.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionEntry {
    pub name: String,

    /// Webhook target URL. Required for enabled entries.
    #[serde(default)]
    pub webhook_url: String,

    /// HTTP verb for the webhook call. Default: POST.
    #[serde(default)]
    pub method: Option<WebhookMethod>,

    /// Operation kinds forwarded for this collection.
    #[serde(default = "default_operations")]
    pub operations: Vec<OperationKind>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_listen_ip() -> IpAddr {
    Ipv4Addr::new(0, 0, 0, 0).into()
}

fn default_listen_port() -> u16 {
    3330
}

fn default_database_url() -> String {
    "sqlite://watchpost.db".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_mongo_url() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_operations() -> Vec<OperationKind> {
    vec![OperationKind::Insert]
}

fn default_true() -> bool {
    true
}
