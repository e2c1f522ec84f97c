use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::postgres::{ReplicationMode, ReplicationOptions};
use crate::slot::SlotOffset;
use crate::{Error, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5432;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Slots to subscribe, as `name` or `name@offset`.
    #[serde(default)]
    pub slots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Zero disables the timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Read deadline of each polling iteration; negative values count as zero.
    #[serde(default = "default_polling_timeout_ms")]
    pub polling_timeout_ms: i64,
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
    #[serde(default)]
    pub plugin_args: Vec<String>,
    #[serde(default)]
    pub mode: ReplicationMode,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    #[serde(default)]
    pub auto_create_slot: bool,
    #[serde(default = "default_true")]
    pub reply_on_keepalive_request: bool,
    #[serde(default)]
    pub slot_definitions_file: Option<PathBuf>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_STREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("slots")
                    .with_list_parse_key("replication.plugin_args")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Fills values left empty by a programmatic or partial configuration.
    pub fn normalize(&mut self) {
        if self.postgres.host.is_empty() {
            self.postgres.host = DEFAULT_HOST.to_string();
        }
        if self.postgres.port == 0 {
            self.postgres.port = DEFAULT_PORT;
        }
        if self.replication.polling_timeout_ms < 0 {
            self.replication.polling_timeout_ms = 0;
        }
        if self.replication.output_plugin.is_empty() {
            self.replication.output_plugin = default_output_plugin();
        }
    }

    pub fn slot_offsets(&self) -> Result<Vec<SlotOffset>> {
        self.slots.iter().map(|s| s.parse()).collect()
    }
}

impl PostgresConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl ReplicationConfig {
    pub fn polling_timeout(&self) -> Duration {
        Duration::from_millis(self.polling_timeout_ms.max(0) as u64)
    }

    pub fn replication_options(&self) -> ReplicationOptions {
        ReplicationOptions::new()
            .with_plugin_args(self.plugin_args.iter().cloned())
            .with_mode(self.mode)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            application_name: default_application_name(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            polling_timeout_ms: default_polling_timeout_ms(),
            output_plugin: default_output_plugin(),
            plugin_args: Vec::new(),
            mode: ReplicationMode::default(),
            auto_ack: true,
            auto_create_slot: false,
            reply_on_keepalive_request: true,
            slot_definitions_file: None,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "pg-stream".to_string()
}

fn default_polling_timeout_ms() -> i64 {
    1000
}

pub(crate) fn default_output_plugin() -> String {
    "wal2json".to_string()
}

fn default_true() -> bool {
    true
}
