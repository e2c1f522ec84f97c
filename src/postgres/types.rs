use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A position in the write-ahead log, printed as `X/Y`.
pub use tokio_postgres::types::PgLsn as Lsn;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01 UTC).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Parses an `X/Y` LSN.
pub fn parse_lsn(text: &str) -> Result<Lsn> {
    text.trim()
        .parse::<Lsn>()
        .map_err(|_| Error::InvalidLsn(text.to_string()))
}

pub(crate) fn lsn_is_zero(lsn: Lsn) -> bool {
    u64::from(lsn) == 0
}

pub(crate) fn pg_timestamp_to_utc(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros.saturating_add(PG_EPOCH_OFFSET_MICROS);
    DateTime::from_timestamp(
        unix_micros.div_euclid(1_000_000),
        (unix_micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .unwrap_or_default()
}

pub(crate) fn utc_to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// Kind of replication slot, and of the stream started on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationMode {
    #[default]
    Logical,
    Physical,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Logical => "LOGICAL",
            ReplicationMode::Physical => "PHYSICAL",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOGICAL" => Ok(ReplicationMode::Logical),
            "PHYSICAL" => Ok(ReplicationMode::Physical),
            _ => Err(Error::Config(format!("unsupported slot type '{}'", s))),
        }
    }
}

impl Serialize for ReplicationMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str().to_ascii_lowercase())
    }
}

impl<'de> Deserialize<'de> for ReplicationMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Options passed to `START_REPLICATION`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationOptions {
    /// Raw output-plugin arguments, e.g. `"pretty-print" 'true'`.
    pub plugin_args: Vec<String>,
    pub mode: ReplicationMode,
}

impl ReplicationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugin_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsn() {
        assert_eq!(u64::from(parse_lsn("16/B374D848").unwrap()), 0x16_B374_D848);
        assert_eq!(u64::from(parse_lsn("0/0").unwrap()), 0);
        assert!(matches!(parse_lsn("garbage"), Err(Error::InvalidLsn(_))));
        assert!(matches!(parse_lsn("1/"), Err(Error::InvalidLsn(_))));
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn::from(0x16_B374_D848).to_string(), "16/B374D848");
    }

    #[test]
    fn test_replication_mode_parse() {
        assert_eq!("logical".parse::<ReplicationMode>().unwrap(), ReplicationMode::Logical);
        assert_eq!("PHYSICAL".parse::<ReplicationMode>().unwrap(), ReplicationMode::Physical);
        assert!("snapshot".parse::<ReplicationMode>().is_err());
    }

    #[test]
    fn test_pg_timestamp_round_trip_epoch() {
        let epoch = pg_timestamp_to_utc(0);
        assert_eq!(epoch.to_rfc3339(), "2000-01-01T00:00:00+00:00");
        assert_eq!(utc_to_pg_timestamp(epoch), 0);
    }
}
