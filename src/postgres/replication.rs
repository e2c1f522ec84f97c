//! CopyData payloads exchanged once a connection is streaming.
//!
//! The server sends primary keepalive (`k`) and XLogData (`w`) messages;
//! the client answers with standby status updates (`r`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::types::{pg_timestamp_to_utc, utc_to_pg_timestamp, Lsn};
use crate::{Error, Result};

pub const PRIMARY_KEEPALIVE_BYTE_ID: u8 = b'k';
pub const XLOG_DATA_BYTE_ID: u8 = b'w';
pub const STANDBY_STATUS_UPDATE_BYTE_ID: u8 = b'r';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub server_wal_end: Lsn,
    pub server_time: DateTime<Utc>,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub server_wal_end: Lsn,
    pub server_time: DateTime<Utc>,
    pub data: Bytes,
}

/// A CopyData payload classified by its leading byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    Keepalive(PrimaryKeepalive),
    XLogData(XLogData),
    Unknown(u8),
}

impl ReplicationFrame {
    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty message".to_string(),
            });
        }

        match payload[0] {
            PRIMARY_KEEPALIVE_BYTE_ID => parse_keepalive(&payload[1..]).map(ReplicationFrame::Keepalive),
            XLOG_DATA_BYTE_ID => parse_xlog_data(&payload.slice(1..)).map(ReplicationFrame::XLogData),
            tag => Ok(ReplicationFrame::Unknown(tag)),
        }
    }
}

/// Parses a primary keepalive body (the bytes after the `k`).
pub fn parse_keepalive(mut cursor: &[u8]) -> Result<PrimaryKeepalive> {
    if cursor.remaining() < 17 {
        return Err(Error::InvalidMessage {
            message: "Invalid keepalive message size".to_string(),
        });
    }

    let server_wal_end = Lsn::from(cursor.get_u64());
    let server_time = pg_timestamp_to_utc(cursor.get_i64());
    let reply_requested = cursor.get_u8() != 0;

    Ok(PrimaryKeepalive {
        server_wal_end,
        server_time,
        reply_requested,
    })
}

/// Parses an XLogData body (the bytes after the `w`).
pub fn parse_xlog_data(body: &Bytes) -> Result<XLogData> {
    let mut cursor = &body[..];
    if cursor.remaining() < 24 {
        return Err(Error::InvalidMessage {
            message: "Invalid XLogData header size".to_string(),
        });
    }

    let wal_start = Lsn::from(cursor.get_u64());
    let server_wal_end = Lsn::from(cursor.get_u64());
    let server_time = pg_timestamp_to_utc(cursor.get_i64());

    Ok(XLogData {
        wal_start,
        server_wal_end,
        server_time,
        data: body.slice(24..),
    })
}

/// Encodes a standby status update reporting `lsn` as written, flushed and applied.
pub fn encode_standby_status_update(lsn: Lsn, now: DateTime<Utc>, reply_requested: bool) -> Bytes {
    let position = u64::from(lsn);

    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STANDBY_STATUS_UPDATE_BYTE_ID);
    buf.put_u64(position); // write
    buf.put_u64(position); // flush
    buf.put_u64(position); // apply
    buf.put_i64(utc_to_pg_timestamp(now));
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
