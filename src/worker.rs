//! The per-slot polling loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::consumer::{ConsumerInner, SlotSession};
use crate::message::{AckDelegate, Event, Message};
use crate::postgres::{PrimaryKeepalive, ReplicationFrame, XLogData};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub polling_timeout: Duration,
    pub auto_ack: bool,
    pub reply_on_keepalive_request: bool,
}

/// Reads one slot's stream until the consumer stops or an error goes unhandled.
pub(crate) struct PollingWorker {
    consumer: Arc<ConsumerInner>,
    session: Arc<SlotSession>,
    settings: WorkerSettings,
}

impl PollingWorker {
    pub fn new(
        consumer: Arc<ConsumerInner>,
        session: Arc<SlotSession>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            consumer,
            session,
            settings,
        }
    }

    pub async fn run(self) {
        info!(start_lsn = %self.session.start_lsn, "Polling worker started");

        while self.consumer.is_running() {
            match self.poll().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) if err.is_timeout() => {
                    trace!("No message before deadline");
                    tokio::task::yield_now().await;
                }
                Err(err) => {
                    if !self.consumer.is_running() {
                        break;
                    }
                    if !self.consumer.handlers.handle_error(&err) {
                        error!(error = %err, "Unhandled error, stopping polling worker");
                        break;
                    }
                    debug!(error = %err, "Error disposed of by handler");
                    tokio::task::yield_now().await;
                }
            }
        }

        info!(
            position = %self.session.cursor.position(),
            acked = %self.session.cursor.acked(),
            "Polling worker stopped"
        );
    }

    async fn poll(&self) -> Result<Flow> {
        let deadline = Instant::now() + self.settings.polling_timeout;
        let payload = {
            let mut connection = self.session.connection.lock().await;
            connection.receive(deadline).await?
        };

        let Some(payload) = payload else {
            return Ok(Flow::Continue);
        };

        match ReplicationFrame::parse(&payload)? {
            ReplicationFrame::Keepalive(keepalive) => self.on_keepalive(keepalive).await,
            ReplicationFrame::XLogData(data) => self.on_xlog_data(data).await,
            ReplicationFrame::Unknown(tag) => {
                trace!("Ignoring CopyData message '{}'", tag as char);
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_keepalive(&self, keepalive: PrimaryKeepalive) -> Result<Flow> {
        let cursor = &self.session.cursor;
        let position = cursor.advance(keepalive.server_wal_end);
        trace!(
            server_wal_end = %keepalive.server_wal_end,
            %position,
            reply_requested = keepalive.reply_requested,
            "Primary keepalive"
        );

        let reply_requested = keepalive.reply_requested;
        self.consumer
            .handlers
            .dispatch_event(&Event::Keepalive(keepalive));

        if self.settings.auto_ack {
            if let Some(lsn) = cursor.pending_ack() {
                self.consumer.ack_or_report(&self.session, lsn).await;
                return Ok(Flow::Continue);
            }
        }

        if reply_requested && self.settings.reply_on_keepalive_request {
            // nothing new to confirm, so repeat the last acknowledged position
            self.consumer
                .ack_or_report(&self.session, cursor.acked())
                .await;
        }
        Ok(Flow::Continue)
    }

    async fn on_xlog_data(&self, data: XLogData) -> Result<Flow> {
        let cursor = &self.session.cursor;
        let position = cursor.advance(data.wal_start);
        trace!(wal_start = %data.wal_start, %position, len = data.data.len(), "XLogData");

        self.consumer
            .handlers
            .dispatch_event(&Event::XLogData(data.clone()));

        let delegate: Arc<dyn AckDelegate> = self.consumer.clone();
        let message = Message::new(
            self.session.name.clone(),
            position,
            data,
            self.session.system.dbname.clone(),
            self.session.system.system_id.clone(),
            delegate,
        );

        if let Err(err) = self.consumer.handlers.handle_message(message).await {
            if !self.consumer.handlers.handle_error(&err) {
                error!(error = %err, lsn = %position, "Message handler failed, stopping polling worker");
                return Ok(Flow::Stop);
            }
        }

        if self.settings.auto_ack {
            if let Some(lsn) = cursor.pending_ack() {
                self.consumer.ack_or_report(&self.session, lsn).await;
            }
        }
        Ok(Flow::Continue)
    }
}
