//! Replication slot metadata: what exists on the server, and what may be created.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, Config as PgConfig, NoTls, Row};
use tracing::{debug, error, info};

use super::types::{Lsn, ReplicationMode};
use crate::config::{default_output_plugin, PostgresConfig};
use crate::{Error, Result};

/// A row of `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub slot_type: ReplicationMode,
    pub database: Option<String>,
    pub temporary: bool,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

impl ReplicationSlot {
    fn from_row(row: &Row) -> Result<Self> {
        let slot_type: String = row.try_get("slot_type")?;
        Ok(Self {
            slot_name: row.try_get("slot_name")?,
            plugin: row.try_get("plugin")?,
            slot_type: slot_type.parse()?,
            database: row.try_get("database")?,
            temporary: row.try_get("temporary")?,
            active: row.try_get("active")?,
            restart_lsn: row.try_get::<_, Option<PgLsn>>("restart_lsn")?,
            confirmed_flush_lsn: row.try_get::<_, Option<PgLsn>>("confirmed_flush_lsn")?,
        })
    }
}

/// Read access to the server's slot catalog.
#[async_trait]
pub trait SlotCatalog: Send + Sync {
    /// Returns the existing slots among `names`, in catalog order.
    async fn select_replication_slots(&self, names: &[String]) -> Result<Vec<ReplicationSlot>>;

    /// Returns the slot's confirmed flush position, or zero if it has none.
    async fn peek_confirmed_flush_lsn(&self, slot_name: &str) -> Result<Lsn>;
}

/// Catalog queries over a regular (non-replication) connection.
pub struct PgSlotCatalog {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgSlotCatalog {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        debug!(host = %config.host, "Opening catalog connection");

        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username)
            .application_name(&config.application_name);
        if !config.password.is_empty() {
            pg_config.password(&config.password);
        }
        if let Some(timeout) = config.connect_timeout() {
            pg_config.connect_timeout(timeout);
        }

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Catalog connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
        })
    }
}

impl Drop for PgSlotCatalog {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl SlotCatalog for PgSlotCatalog {
    async fn select_replication_slots(&self, names: &[String]) -> Result<Vec<ReplicationSlot>> {
        let rows = self
            .client
            .query(
                "SELECT slot_name::text, plugin::text, slot_type, database::text, temporary, \
                 active, restart_lsn, confirmed_flush_lsn \
                 FROM pg_catalog.pg_replication_slots WHERE slot_name = ANY($1)",
                &[&names],
            )
            .await?;

        rows.iter().map(ReplicationSlot::from_row).collect()
    }

    async fn peek_confirmed_flush_lsn(&self, slot_name: &str) -> Result<Lsn> {
        let row = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn FROM pg_catalog.pg_replication_slots \
                 WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?
            .ok_or_else(|| Error::SlotNotFound(slot_name.to_string()))?;

        let lsn: Option<PgLsn> = row.try_get(0)?;
        Ok(lsn.unwrap_or_else(|| Lsn::from(0)))
    }
}

/// How to create a slot that does not exist yet.
///
/// Definitions are read from JSON using the keys `SlotName`, `Plugin`,
/// `Temporary`, `SlotType` and `SnapshotAction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotDefinition {
    pub slot_name: String,
    #[serde(default = "default_output_plugin")]
    pub plugin: String,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub slot_type: ReplicationMode,
    /// `EXPORT_SNAPSHOT`, `NOEXPORT_SNAPSHOT` or `USE_SNAPSHOT`; empty means no export.
    #[serde(default)]
    pub snapshot_action: String,
}

impl SlotDefinition {
    pub fn new(slot_name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            plugin: plugin.into(),
            temporary: false,
            slot_type: ReplicationMode::Logical,
            snapshot_action: String::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionDocument {
    Many(Vec<SlotDefinition>),
    One(SlotDefinition),
}

/// An accumulating set of slot definitions.
///
/// Not `Clone`: definitions move between sets with [`SlotDefinitions::append`].
#[derive(Debug, Default)]
pub struct SlotDefinitions {
    sources: Vec<SlotDefinition>,
}

impl SlotDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every definition of `other` into this set.
    pub fn append(&mut self, mut other: SlotDefinitions) {
        self.sources.append(&mut other.sources);
    }

    pub fn push(&mut self, definition: SlotDefinition) {
        self.sources.push(definition);
    }

    /// Parses a JSON object or array of objects and appends the result.
    pub fn scan(&mut self, json: &[u8]) -> Result<()> {
        match serde_json::from_slice::<DefinitionDocument>(json)? {
            DefinitionDocument::Many(definitions) => self.sources.extend(definitions),
            DefinitionDocument::One(definition) => self.sources.push(definition),
        }
        Ok(())
    }

    pub fn scan_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = std::fs::read(path)?;
        self.scan(&json)?;
        info!("Loaded slot definitions from {}", path.display());
        Ok(())
    }

    pub fn sources(&self) -> &[SlotDefinition] {
        &self.sources
    }

    /// The last definition registered for `slot_name`.
    pub fn get(&self, slot_name: &str) -> Option<&SlotDefinition> {
        self.sources.iter().rev().find(|d| d.slot_name == slot_name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
