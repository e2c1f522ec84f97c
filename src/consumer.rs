//! Subscription lifecycle: connect, resolve, stream, acknowledge, close.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::handler::{ErrorHandler, EventHandler, Handlers, MessageHandler};
use crate::message::AckDelegate;
use crate::postgres::{
    Connector, Lsn, PgConnector, ReplicationConnection, ReplicationSlot, SlotCatalog,
    SlotDefinition, SlotDefinitions, SystemInfo,
};
use crate::slot::{OffsetResolver, SlotCursor, SlotOffset};
use crate::worker::{PollingWorker, WorkerSettings};
use crate::{Error, Result};

/// Subscribes to replication slots and delivers their streams to handlers.
///
/// A consumer runs at most once: after [`Consumer::close`], or after a
/// failed [`Consumer::subscribe`], it is disposed and cannot be restarted.
/// Clones share the same state.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct SlotSession {
    pub name: String,
    pub descriptor: ReplicationSlot,
    pub start_lsn: Lsn,
    pub system: SystemInfo,
    pub cursor: SlotCursor,
    pub connection: Mutex<Box<dyn ReplicationConnection>>,
}

struct Lifecycle {
    config: Config,
    definitions: SlotDefinitions,
    initialized: bool,
}

impl Lifecycle {
    fn initialize(&mut self) -> Result<()> {
        self.config.normalize();
        if let Some(path) = self.config.replication.slot_definitions_file.clone() {
            self.definitions.scan_file(path)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn worker_settings(&self) -> WorkerSettings {
        let replication = &self.config.replication;
        WorkerSettings {
            polling_timeout: replication.polling_timeout(),
            auto_ack: replication.auto_ack,
            reply_on_keepalive_request: replication.reply_on_keepalive_request,
        }
    }

    /// How to create `slot_name` when it does not exist.
    fn definition_for(&self, slot_name: &str) -> Option<SlotDefinition> {
        if let Some(definition) = self.definitions.get(slot_name) {
            return Some(definition.clone());
        }
        if self.config.replication.auto_create_slot {
            let mut definition =
                SlotDefinition::new(slot_name, self.config.replication.output_plugin.clone());
            definition.slot_type = self.config.replication.mode;
            return Some(definition);
        }
        None
    }
}

struct Prepared {
    system: SystemInfo,
    descriptors: Vec<ReplicationSlot>,
    start_lsns: Vec<Lsn>,
}

pub(crate) struct ConsumerInner {
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    disposed: AtomicBool,
    slots: RwLock<HashMap<String, Arc<SlotSession>>>,
    pub(crate) handlers: Handlers,
    connector: Arc<dyn Connector>,
    workers: Mutex<JoinSet<()>>,
}

impl ConsumerInner {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_idle(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    async fn prepare(
        &self,
        lifecycle: &Lifecycle,
        slots: &[SlotOffset],
        opened: &mut Vec<Box<dyn ReplicationConnection>>,
    ) -> Result<Prepared> {
        let config = &lifecycle.config;
        let catalog = self.connector.connect_catalog(&config.postgres).await?;

        for slot in slots {
            debug!(slot = %slot.slot, "Opening replication connection");
            opened.push(self.connector.connect_replication(&config.postgres).await?);
        }

        let system = opened[0].identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Identified system"
        );

        let names: Vec<String> = slots.iter().map(|s| s.slot.clone()).collect();
        let descriptors = self
            .ensure_slots(lifecycle, catalog.as_ref(), &names, opened)
            .await?;

        let resolver = OffsetResolver::new(catalog.as_ref(), &system);
        let mut start_lsns = Vec::with_capacity(slots.len());
        for slot in slots {
            start_lsns.push(resolver.resolve(slot).await?);
        }

        for ((connection, descriptor), lsn) in opened.iter_mut().zip(&descriptors).zip(&start_lsns)
        {
            let options = config
                .replication
                .replication_options()
                .with_mode(descriptor.slot_type);
            connection
                .start_replication(&descriptor.slot_name, *lsn, &options)
                .await?;
        }

        Ok(Prepared {
            system,
            descriptors,
            start_lsns,
        })
    }

    /// Returns a descriptor for every name, creating missing slots where allowed.
    async fn ensure_slots(
        &self,
        lifecycle: &Lifecycle,
        catalog: &dyn SlotCatalog,
        names: &[String],
        opened: &mut [Box<dyn ReplicationConnection>],
    ) -> Result<Vec<ReplicationSlot>> {
        let mut existing = catalog.select_replication_slots(names).await?;
        let found: HashSet<&str> = existing.iter().map(|s| s.slot_name.as_str()).collect();

        let mut created = false;
        for (name, connection) in names.iter().zip(opened.iter_mut()) {
            if found.contains(name.as_str()) {
                continue;
            }
            let definition = lifecycle
                .definition_for(name)
                .ok_or_else(|| Error::SlotNotFound(name.clone()))?;

            match connection.create_replication_slot(&definition).await {
                Ok(()) => created = true,
                Err(Error::SlotAlreadyExists(_)) => {
                    debug!(slot = %name, "Slot appeared concurrently");
                    created = true;
                }
                Err(e) => return Err(e),
            }
        }

        if created {
            existing = catalog.select_replication_slots(names).await?;
        }

        let mut by_name: HashMap<String, ReplicationSlot> = existing
            .into_iter()
            .map(|s| (s.slot_name.clone(), s))
            .collect();
        names
            .iter()
            .map(|name| {
                by_name
                    .remove(name)
                    .ok_or_else(|| Error::SlotNotFound(name.clone()))
            })
            .collect()
    }

    async fn send_ack(&self, session: &SlotSession, lsn: Lsn) -> Result<()> {
        let mut connection = session.connection.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        connection.send_standby_status_update(lsn).await?;
        session.cursor.mark_acked(lsn);
        debug!(slot = %session.name, %lsn, "Acknowledged");
        Ok(())
    }

    pub async fn do_ack(&self, slot: &str, lsn: Lsn) -> Result<()> {
        if self.is_disposed() || !self.is_running() {
            return Ok(());
        }
        let session = self
            .slots
            .read()
            .await
            .get(slot)
            .cloned()
            .ok_or_else(|| Error::SlotNotFound(slot.to_string()))?;
        self.send_ack(&session, lsn).await
    }

    /// Acknowledges on behalf of the polling loop; failures never stop it.
    pub async fn ack_or_report(&self, session: &SlotSession, lsn: Lsn) {
        if let Err(err) = self.send_ack(session, lsn).await {
            self.report_ack_failure(&session.name, lsn, &err);
        }
    }

    fn report_ack_failure(&self, slot: &str, lsn: Lsn, err: &Error) {
        if !self.handlers.handle_error(err) {
            warn!(slot, %lsn, error = %err, "Standby status update failed");
        }
    }

    async fn close_connections(connections: &mut [Box<dyn ReplicationConnection>]) {
        join_all(connections.iter_mut().map(|connection| async move {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close replication connection");
            }
        }))
        .await;
    }
}

#[async_trait]
impl AckDelegate for ConsumerInner {
    async fn on_ack(&self, slot: &str, lsn: Lsn) -> Result<()> {
        let result = self.do_ack(slot, lsn).await;
        if let Err(err) = &result {
            self.report_ack_failure(slot, lsn, err);
        }
        result
    }
}

impl Consumer {
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ConsumerBuilder {
        ConsumerBuilder::new(config)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Opens one replication connection per slot and starts a polling loop for each.
    ///
    /// Fails with [`Error::AlreadyRunning`] while running and [`Error::Disposed`]
    /// once closed. Any other failure disposes the consumer and closes every
    /// connection opened so far. An empty slot list only marks the consumer running.
    pub async fn subscribe<I, S>(&self, slots: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<SlotOffset>,
    {
        let inner = &self.inner;
        inner.check_idle()?;

        let mut lifecycle = inner.lifecycle.lock().await;
        inner.check_idle()?;

        let mut seen = HashSet::new();
        let slots: Vec<SlotOffset> = slots
            .into_iter()
            .map(Into::into)
            .filter(|s: &SlotOffset| {
                let first = seen.insert(s.slot.clone());
                if !first {
                    warn!(slot = %s.slot, "Ignoring duplicate slot subscription");
                }
                first
            })
            .collect();

        if !lifecycle.initialized {
            if let Err(e) = lifecycle.initialize() {
                inner.disposed.store(true, Ordering::Release);
                return Err(e);
            }
        }
        inner.running.store(true, Ordering::Release);

        if slots.is_empty() {
            info!("Consumer running with no slots");
            return Ok(());
        }

        info!(slots = ?slots.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "Subscribing");

        let mut opened = Vec::with_capacity(slots.len());
        let prepared = match inner.prepare(&lifecycle, &slots, &mut opened).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Subscribe failed, disposing consumer");
                inner.running.store(false, Ordering::Release);
                inner.disposed.store(true, Ordering::Release);
                ConsumerInner::close_connections(&mut opened).await;
                return Err(e);
            }
        };

        let settings = lifecycle.worker_settings();
        let mut sessions = inner.slots.write().await;
        let mut workers = inner.workers.lock().await;
        for ((connection, descriptor), start_lsn) in opened
            .into_iter()
            .zip(prepared.descriptors)
            .zip(prepared.start_lsns)
        {
            let session = Arc::new(SlotSession {
                name: descriptor.slot_name.clone(),
                descriptor,
                start_lsn,
                system: prepared.system.clone(),
                cursor: SlotCursor::new(start_lsn),
                connection: Mutex::new(connection),
            });
            sessions.insert(session.name.clone(), session.clone());

            let span = info_span!("slot", slot = %session.name);
            let worker = PollingWorker::new(inner.clone(), session, settings);
            workers.spawn(worker.run().instrument(span));
        }

        info!(count = sessions.len(), "Subscribed to replication slots");
        Ok(())
    }

    /// Stops every polling loop, waits for in-flight callbacks, and closes the connections.
    ///
    /// Idempotent. Must not be awaited from inside a handler, since it waits
    /// for the handler's own loop to finish; spawn it instead.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.is_disposed() {
            return;
        }

        let _lifecycle = inner.lifecycle.lock().await;
        if inner.is_disposed() {
            return;
        }

        info!("Closing consumer");
        inner.running.store(false, Ordering::Release);
        let mut workers = std::mem::take(&mut *inner.workers.lock().await);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Polling worker panicked");
            }
        }

        let sessions: Vec<Arc<SlotSession>> =
            inner.slots.write().await.drain().map(|(_, s)| s).collect();
        join_all(sessions.iter().map(|session| async move {
            let mut connection = session.connection.lock().await;
            if let Err(e) = connection.close().await {
                warn!(slot = %session.name, error = %e, "Failed to close replication connection");
            }
        }))
        .await;

        inner.disposed.store(true, Ordering::Release);
        info!("Consumer closed");
    }

    /// Reports `lsn` as flushed for `slot`. No-op unless running.
    pub async fn ack(&self, slot: &str, lsn: Lsn) -> Result<()> {
        self.inner.do_ack(slot, lsn).await
    }

    /// The highest position seen on `slot`'s stream.
    pub async fn slot_lsn(&self, slot: &str) -> Option<Lsn> {
        let sessions = self.inner.slots.read().await;
        sessions.get(slot).map(|s| s.cursor.position())
    }

    /// The highest position acknowledged to the server for `slot`.
    pub async fn acked_lsn(&self, slot: &str) -> Option<Lsn> {
        let sessions = self.inner.slots.read().await;
        sessions.get(slot).map(|s| s.cursor.acked())
    }

    /// Descriptors of the subscribed slots as read at subscribe time.
    pub async fn slots(&self) -> Vec<ReplicationSlot> {
        let sessions = self.inner.slots.read().await;
        let mut slots: Vec<_> = sessions.values().map(|s| s.descriptor.clone()).collect();
        slots.sort_by(|a, b| a.slot_name.cmp(&b.slot_name));
        slots
    }
}

pub struct ConsumerBuilder {
    config: Config,
    handlers: Handlers,
    definitions: SlotDefinitions,
    connector: Arc<dyn Connector>,
}

impl ConsumerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handlers: Handlers::default(),
            definitions: SlotDefinitions::new(),
            connector: Arc::new(PgConnector),
        }
    }

    pub fn message_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handlers.message = Some(Arc::new(handler));
        self
    }

    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.event = Some(Arc::new(handler));
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handlers.error = Some(Arc::new(handler));
        self
    }

    pub fn auto_ack(mut self, enabled: bool) -> Self {
        self.config.replication.auto_ack = enabled;
        self
    }

    pub fn auto_create_slot(mut self, enabled: bool) -> Self {
        self.config.replication.auto_create_slot = enabled;
        self
    }

    /// Definitions used to create missing slots, in addition to any definitions file.
    pub fn slot_definitions(mut self, definitions: SlotDefinitions) -> Self {
        self.definitions.append(definitions);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn build(self) -> Consumer {
        Consumer {
            inner: Arc::new(ConsumerInner {
                lifecycle: Mutex::new(Lifecycle {
                    config: self.config,
                    definitions: self.definitions,
                    initialized: false,
                }),
                running: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                slots: RwLock::new(HashMap::new()),
                handlers: self.handlers,
                connector: self.connector,
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }
}
