//! Scripted stand-ins for the server, used by the consumer and worker tests.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::catalog::{ReplicationSlot, SlotCatalog, SlotDefinition};
use super::connection::{Connector, ReplicationConnection};
use super::types::{Lsn, ReplicationMode, ReplicationOptions, SystemInfo};
use crate::config::PostgresConfig;
use crate::{Error, Result};

pub const SYSTEM_ID: &str = "7290853413512384522";
pub const XLOGPOS: u64 = 0x1_0000;

/// Builds a keepalive CopyData payload.
pub fn keepalive(wal_end: u64, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'k');
    buf.put_u64(wal_end);
    buf.put_i64(0);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// Builds an XLogData CopyData payload.
pub fn xlog_data(wal_start: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(wal_start);
    buf.put_u64(wal_start);
    buf.put_i64(0);
    buf.put_slice(payload);
    buf.freeze()
}

/// A wal2json payload with one insert into `public.t`.
pub fn insert_payload(id: i64) -> String {
    format!(
        r#"{{"change":[{{"kind":"insert","schema":"public","table":"t","columnnames":["id"],"columntypes":["integer"],"columnvalues":[{}]}}]}}"#,
        id
    )
}

enum Step {
    Frame(Bytes),
    Fail(String),
}

#[derive(Default)]
struct ServerState {
    slots: HashMap<String, ReplicationSlot>,
    confirmed: HashMap<String, Lsn>,
    streams: HashMap<String, mpsc::UnboundedSender<Step>>,
    pending: HashMap<String, mpsc::UnboundedReceiver<Step>>,
    status_updates: Vec<(String, Lsn)>,
    started: Vec<(String, Lsn)>,
    created: Vec<SlotDefinition>,
    failing_starts: HashSet<String>,
    failing_acks: bool,
    failing_reads: HashSet<String>,
    opened: usize,
    closed: usize,
}

/// A fake server shared by every connection a [`MockConnector`] opens.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing logical slot with an optional confirmed flush LSN.
    pub fn with_slot(self, name: &str, confirmed_flush: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.slots.insert(name.to_string(), slot_row(name, "wal2json", false));
            state.confirmed.insert(name.to_string(), Lsn::from(confirmed_flush));
        }
        self.stream(name);
        self
    }

    pub fn failing_start(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_starts.insert(name.to_string());
        self
    }

    pub fn failing_acks(self) -> Self {
        self.state.lock().unwrap().failing_acks = true;
        self
    }

    /// Every read on the slot fails at once, as on a dead socket.
    pub fn failing_reads(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_reads.insert(name.to_string());
        self
    }

    fn stream(&self, name: &str) -> mpsc::UnboundedSender<Step> {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.streams.get(name) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.insert(name.to_string(), tx.clone());
        state.pending.insert(name.to_string(), rx);
        tx
    }

    /// Queues a CopyData payload on the slot's stream.
    pub fn push(&self, slot: &str, payload: Bytes) {
        let _ = self.stream(slot).send(Step::Frame(payload));
    }

    /// Queues a read failure on the slot's stream.
    pub fn push_error(&self, slot: &str, message: &str) {
        let _ = self.stream(slot).send(Step::Fail(message.to_string()));
    }

    pub fn status_updates(&self, slot: &str) -> Vec<Lsn> {
        self.state
            .lock()
            .unwrap()
            .status_updates
            .iter()
            .filter(|(name, _)| name == slot)
            .map(|(_, lsn)| *lsn)
            .collect()
    }

    pub fn started(&self) -> Vec<(String, Lsn)> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn created(&self) -> Vec<SlotDefinition> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn opened_connections(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed_connections(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: self.clone(),
        })
    }
}

fn slot_row(name: &str, plugin: &str, temporary: bool) -> ReplicationSlot {
    ReplicationSlot {
        slot_name: name.to_string(),
        plugin: Some(plugin.to_string()),
        slot_type: ReplicationMode::Logical,
        database: Some("test".to_string()),
        temporary,
        active: false,
        restart_lsn: None,
        confirmed_flush_lsn: None,
    }
}

pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect_replication(
        &self,
        _config: &PostgresConfig,
    ) -> Result<Box<dyn ReplicationConnection>> {
        self.server.state.lock().unwrap().opened += 1;
        Ok(Box::new(MockConnection {
            server: self.server.clone(),
            slot: None,
            stream: None,
        }))
    }

    async fn connect_catalog(&self, _config: &PostgresConfig) -> Result<Box<dyn SlotCatalog>> {
        Ok(Box::new(MockCatalog {
            server: self.server.clone(),
        }))
    }
}

pub struct MockConnection {
    server: MockServer,
    slot: Option<String>,
    stream: Option<mpsc::UnboundedReceiver<Step>>,
}

#[async_trait]
impl ReplicationConnection for MockConnection {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            system_id: SYSTEM_ID.to_string(),
            timeline: 1,
            xlogpos: Lsn::from(XLOGPOS),
            dbname: Some("test".to_string()),
        })
    }

    async fn create_replication_slot(&mut self, definition: &SlotDefinition) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        if state.slots.contains_key(&definition.slot_name) {
            return Err(Error::SlotAlreadyExists(definition.slot_name.clone()));
        }
        state.slots.insert(
            definition.slot_name.clone(),
            slot_row(&definition.slot_name, &definition.plugin, definition.temporary),
        );
        state.created.push(definition.clone());
        Ok(())
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        _options: &ReplicationOptions,
    ) -> Result<()> {
        self.server.stream(slot_name);
        let mut state = self.server.state.lock().unwrap();
        if state.failing_starts.contains(slot_name) {
            return Err(Error::Replication {
                message: format!("cannot start slot {}", slot_name),
            });
        }
        self.stream = state.pending.remove(slot_name);
        self.slot = Some(slot_name.to_string());
        state.started.push((slot_name.to_string(), start_lsn));
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>> {
        if let Some(slot) = &self.slot {
            if self.server.state.lock().unwrap().failing_reads.contains(slot) {
                return Err(Error::Connection("connection reset by peer".to_string()));
            }
        }
        let stream = self.stream.as_mut().ok_or_else(|| Error::Replication {
            message: "not streaming".to_string(),
        })?;

        match tokio::time::timeout_at(deadline, stream.recv()).await {
            Ok(Some(Step::Frame(payload))) => Ok(Some(payload)),
            Ok(Some(Step::Fail(message))) => Err(Error::Connection(message)),
            Ok(None) => Err(Error::Connection("stream closed".to_string())),
            Err(_) => Err(Error::Timeout {
                message: "mock deadline".to_string(),
            }),
        }
    }

    async fn send_standby_status_update(&mut self, lsn: Lsn) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        if state.failing_acks {
            return Err(Error::Connection("ack rejected".to_string()));
        }
        let slot = self.slot.clone().unwrap_or_default();
        state.status_updates.push((slot, lsn));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.server.state.lock().unwrap().closed += 1;
        self.stream = None;
        Ok(())
    }
}

pub struct MockCatalog {
    server: MockServer,
}

#[async_trait]
impl SlotCatalog for MockCatalog {
    async fn select_replication_slots(&self, names: &[String]) -> Result<Vec<ReplicationSlot>> {
        let state = self.server.state.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|name| state.slots.get(name).cloned())
            .collect())
    }

    async fn peek_confirmed_flush_lsn(&self, slot_name: &str) -> Result<Lsn> {
        let state = self.server.state.lock().unwrap();
        if !state.slots.contains_key(slot_name) {
            return Err(Error::SlotNotFound(slot_name.to_string()));
        }
        Ok(state
            .confirmed
            .get(slot_name)
            .copied()
            .unwrap_or_else(|| Lsn::from(0)))
    }
}
