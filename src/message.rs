//! Messages handed to the application and the acknowledgment capability they carry.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::postgres::replication::{PRIMARY_KEEPALIVE_BYTE_ID, XLOG_DATA_BYTE_ID};
use crate::postgres::{ChangeSet, Lsn, PrimaryKeepalive, XLogData};
use crate::Result;

/// Reports an acknowledged position back to whoever owns the slot's connection.
#[async_trait]
pub trait AckDelegate: Send + Sync {
    async fn on_ack(&self, slot: &str, lsn: Lsn) -> Result<()>;
}

/// A stream event observed by a slot's polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Keepalive(PrimaryKeepalive),
    XLogData(XLogData),
}

impl Event {
    /// The protocol discriminant, `b'k'` or `b'w'`.
    pub fn byte_id(&self) -> u8 {
        match self {
            Event::Keepalive(_) => PRIMARY_KEEPALIVE_BYTE_ID,
            Event::XLogData(_) => XLOG_DATA_BYTE_ID,
        }
    }
}

/// One XLogData message delivered to the message handler.
///
/// A message may be kept after the handler returns and acknowledged later.
/// Only the first [`Message::ack`] reaches the server.
pub struct Message {
    slot: String,
    lsn: Lsn,
    data: XLogData,
    database: Option<String>,
    system_id: String,
    acked: AtomicBool,
    delegate: Arc<dyn AckDelegate>,
}

impl Message {
    pub(crate) fn new(
        slot: impl Into<String>,
        lsn: Lsn,
        data: XLogData,
        database: Option<String>,
        system_id: impl Into<String>,
        delegate: Arc<dyn AckDelegate>,
    ) -> Self {
        Self {
            slot: slot.into(),
            lsn,
            data,
            database,
            system_id: system_id.into(),
            acked: AtomicBool::new(false),
            delegate,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// The slot's stream position when this message was received.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn wal_start(&self) -> Lsn {
        self.data.wal_start
    }

    pub fn server_wal_end(&self) -> Lsn {
        self.data.server_wal_end
    }

    pub fn server_time(&self) -> DateTime<Utc> {
        self.data.server_time
    }

    /// The raw output-plugin payload.
    pub fn data(&self) -> &Bytes {
        &self.data.data
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Decodes the payload as a wal2json change set.
    pub fn change_set(&self) -> Result<ChangeSet> {
        ChangeSet::from_slice(&self.data.data)
    }

    pub fn has_responded(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Acknowledges this message's position. Later calls do nothing.
    ///
    /// A failed status update is also reported to the consumer's
    /// [`ErrorHandler`](crate::ErrorHandler) on the calling task, so that
    /// report is not covered by [`Consumer::close`](crate::Consumer::close)
    /// waiting for the polling loops.
    pub async fn ack(&self) -> Result<()> {
        if self
            .acked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.delegate.on_ack(&self.slot, self.lsn).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("slot", &self.slot)
            .field("lsn", &self.lsn)
            .field("wal_start", &self.data.wal_start)
            .field("len", &self.data.data.len())
            .field("acked", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::replication::parse_xlog_data;
    use crate::postgres::test_utils::{insert_payload, xlog_data};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDelegate {
        acks: Mutex<Vec<(String, Lsn)>>,
    }

    #[async_trait]
    impl AckDelegate for RecordingDelegate {
        async fn on_ack(&self, slot: &str, lsn: Lsn) -> Result<()> {
            self.acks.lock().unwrap().push((slot.to_string(), lsn));
            Ok(())
        }
    }

    fn message(delegate: Arc<RecordingDelegate>, payload: &[u8]) -> Message {
        let frame = xlog_data(0x40, payload);
        let data = parse_xlog_data(&frame.slice(1..)).unwrap();
        Message::new("orders", Lsn::from(0x80), data, Some("shop".into()), "42", delegate)
    }

    #[tokio::test]
    async fn test_ack_is_single_use() {
        let delegate = Arc::new(RecordingDelegate::default());
        let message = message(delegate.clone(), b"{}");

        assert!(!message.has_responded());
        message.ack().await.unwrap();
        assert!(message.has_responded());
        message.ack().await.unwrap();

        let acks = delegate.acks.lock().unwrap().clone();
        assert_eq!(acks, vec![("orders".to_string(), Lsn::from(0x80))]);
    }

    #[tokio::test]
    async fn test_concurrent_acks_reach_delegate_once() {
        let delegate = Arc::new(RecordingDelegate::default());
        let message = Arc::new(message(delegate.clone(), b"{}"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let message = message.clone();
                tokio::spawn(async move { message.ack().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(delegate.acks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_message_accessors() {
        let payload = insert_payload(7);
        let message = message(Arc::new(RecordingDelegate::default()), payload.as_bytes());

        assert_eq!(message.slot(), "orders");
        assert_eq!(u64::from(message.lsn()), 0x80);
        assert_eq!(u64::from(message.wal_start()), 0x40);
        assert_eq!(message.database(), Some("shop"));
        assert_eq!(message.system_id(), "42");
        assert_eq!(message.data().as_ref(), payload.as_bytes());

        let set = message.change_set().unwrap();
        assert_eq!(set.changes[0].field("id").unwrap().value.to_string(), "7");
    }

    #[test]
    fn test_event_byte_id() {
        let frame = xlog_data(1, b"");
        let data = parse_xlog_data(&frame.slice(1..)).unwrap();
        assert_eq!(Event::XLogData(data).byte_id(), b'w');

        let keepalive = PrimaryKeepalive {
            server_wal_end: Lsn::from(1),
            server_time: Utc::now(),
            reply_requested: false,
        };
        assert_eq!(Event::Keepalive(keepalive).byte_id(), b'k');
    }
}
