//! Slot names, start offsets, and the per-slot stream cursor.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::postgres::types::lsn_is_zero;
use crate::postgres::{parse_lsn, Lsn, SlotCatalog, SystemInfo};
use crate::{Error, Result};

/// Where a slot subscription starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Offset {
    /// The slot's confirmed flush position, or the current WAL position if it has none.
    #[default]
    Unspecified,
    /// LSN `0/0`; the server starts from the slot's own position.
    Zero,
    /// The current WAL position, skipping everything not yet delivered.
    NeverDelivered,
    /// An `X/Y` LSN.
    Explicit(String),
}

impl Offset {
    pub const ZERO: &'static str = "0";
    pub const NEVER_DELIVERED: &'static str = ">";

    /// `""` is unspecified, `"0"` zero, `">"` never delivered; anything else is explicit.
    pub fn parse(text: &str) -> Self {
        match text {
            "" => Offset::Unspecified,
            Self::ZERO => Offset::Zero,
            Self::NEVER_DELIVERED => Offset::NeverDelivered,
            other => Offset::Explicit(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Offset::Unspecified => "",
            Offset::Zero => Self::ZERO,
            Offset::NeverDelivered => Self::NEVER_DELIVERED,
            Offset::Explicit(lsn) => lsn,
        }
    }
}

impl From<Lsn> for Offset {
    fn from(lsn: Lsn) -> Self {
        Offset::Explicit(lsn.to_string())
    }
}

/// A slot to subscribe and the offset to start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOffset {
    pub slot: String,
    pub offset: Offset,
}

impl SlotOffset {
    pub fn new(slot: impl Into<String>, offset: Offset) -> Self {
        Self {
            slot: slot.into(),
            offset,
        }
    }
}

impl fmt::Display for SlotOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Offset::Unspecified => f.write_str(&self.slot),
            _ => write!(f, "{}@{}", self.slot, self.offset.as_str()),
        }
    }
}

/// Parses `name` or `name@offset`.
impl FromStr for SlotOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (slot, offset) = match s.split_once('@') {
            Some((slot, offset)) => (slot.trim(), Offset::parse(offset.trim())),
            None => (s.trim(), Offset::Unspecified),
        };
        if slot.is_empty() {
            return Err(Error::Config(format!("missing slot name in '{}'", s)));
        }
        Ok(SlotOffset::new(slot, offset))
    }
}

impl From<&str> for SlotOffset {
    fn from(slot: &str) -> Self {
        SlotOffset::new(slot, Offset::Unspecified)
    }
}

impl From<String> for SlotOffset {
    fn from(slot: String) -> Self {
        SlotOffset::new(slot, Offset::Unspecified)
    }
}

/// A slot name with shorthands for building a [`SlotOffset`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot(pub String);

impl Slot {
    pub fn new(name: impl Into<String>) -> Self {
        Slot(name.into())
    }

    pub fn offset(&self, lsn: impl Into<String>) -> SlotOffset {
        SlotOffset::new(self.0.clone(), Offset::Explicit(lsn.into()))
    }

    pub fn zero(&self) -> SlotOffset {
        SlotOffset::new(self.0.clone(), Offset::Zero)
    }

    pub fn never_delivered(&self) -> SlotOffset {
        SlotOffset::new(self.0.clone(), Offset::NeverDelivered)
    }

    pub fn unspecified(&self) -> SlotOffset {
        SlotOffset::new(self.0.clone(), Offset::Unspecified)
    }
}

impl From<Slot> for SlotOffset {
    fn from(slot: Slot) -> Self {
        SlotOffset::new(slot.0, Offset::Unspecified)
    }
}

/// Turns a requested offset into the LSN passed to `START_REPLICATION`.
pub struct OffsetResolver<'a> {
    catalog: &'a dyn SlotCatalog,
    system: &'a SystemInfo,
}

impl<'a> OffsetResolver<'a> {
    pub fn new(catalog: &'a dyn SlotCatalog, system: &'a SystemInfo) -> Self {
        Self { catalog, system }
    }

    pub async fn resolve(&self, slot: &SlotOffset) -> Result<Lsn> {
        let lsn = match &slot.offset {
            Offset::Unspecified => {
                let confirmed = self.catalog.peek_confirmed_flush_lsn(&slot.slot).await?;
                if lsn_is_zero(confirmed) {
                    self.system.xlogpos
                } else {
                    confirmed
                }
            }
            Offset::Zero => Lsn::from(0),
            Offset::NeverDelivered => self.system.xlogpos,
            Offset::Explicit(text) => parse_lsn(text)?,
        };

        debug!(slot = %slot.slot, offset = slot.offset.as_str(), %lsn, "Resolved start position");
        Ok(lsn)
    }
}

/// Stream position of one slot.
///
/// Both positions only move forward. `received` is the highest LSN seen on
/// the stream, `acked` the highest LSN reported back to the server.
#[derive(Debug)]
pub struct SlotCursor {
    received: AtomicU64,
    acked: AtomicU64,
}

impl SlotCursor {
    pub fn new(start: Lsn) -> Self {
        Self {
            received: AtomicU64::new(u64::from(start)),
            acked: AtomicU64::new(u64::from(start)),
        }
    }

    /// Moves the cursor to `lsn` if it is ahead, returning the resulting position.
    pub fn advance(&self, lsn: Lsn) -> Lsn {
        let lsn = u64::from(lsn);
        Lsn::from(self.received.fetch_max(lsn, Ordering::AcqRel).max(lsn))
    }

    pub fn position(&self) -> Lsn {
        Lsn::from(self.received.load(Ordering::Acquire))
    }

    pub fn acked(&self) -> Lsn {
        Lsn::from(self.acked.load(Ordering::Acquire))
    }

    pub fn mark_acked(&self, lsn: Lsn) {
        self.acked.fetch_max(u64::from(lsn), Ordering::AcqRel);
    }

    /// The position to acknowledge, if it is ahead of the last acknowledgment.
    pub fn pending_ack(&self) -> Option<Lsn> {
        let position = self.position();
        (position > self.acked()).then_some(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostgresConfig;
    use crate::postgres::test_utils::{MockServer, XLOGPOS};

    fn system() -> SystemInfo {
        SystemInfo {
            system_id: "1".to_string(),
            timeline: 1,
            xlogpos: Lsn::from(XLOGPOS),
            dbname: None,
        }
    }

    #[test]
    fn test_offset_parse() {
        assert_eq!(Offset::parse(""), Offset::Unspecified);
        assert_eq!(Offset::parse("0"), Offset::Zero);
        assert_eq!(Offset::parse(">"), Offset::NeverDelivered);
        assert_eq!(Offset::parse("0/16B3748"), Offset::Explicit("0/16B3748".to_string()));
        assert_eq!(Offset::from(Lsn::from(0x10)).as_str(), "0/10");
    }

    #[test]
    fn test_slot_offset_from_str() {
        let plain: SlotOffset = "orders".parse().unwrap();
        assert_eq!(plain, SlotOffset::new("orders", Offset::Unspecified));
        assert_eq!(plain.to_string(), "orders");

        let zero: SlotOffset = "orders@0".parse().unwrap();
        assert_eq!(zero.offset, Offset::Zero);
        assert_eq!(zero.to_string(), "orders@0");

        let never: SlotOffset = "orders@>".parse().unwrap();
        assert_eq!(never.offset, Offset::NeverDelivered);

        assert!("@0".parse::<SlotOffset>().is_err());
    }

    #[test]
    fn test_slot_shorthands() {
        let slot = Slot::new("s");
        assert_eq!(slot.zero().offset, Offset::Zero);
        assert_eq!(slot.never_delivered().offset, Offset::NeverDelivered);
        assert_eq!(slot.offset("1/0").offset, Offset::Explicit("1/0".to_string()));
        assert_eq!(SlotOffset::from(slot).offset, Offset::Unspecified);
    }

    #[tokio::test]
    async fn test_resolver_policies() {
        let server = MockServer::new().with_slot("fresh", 0).with_slot("used", 0x500);
        let catalog = server
            .connector()
            .connect_catalog(&PostgresConfig::default())
            .await
            .unwrap();
        let system = system();
        let resolver = OffsetResolver::new(catalog.as_ref(), &system);

        let resolve = |slot: &str, offset: Offset| SlotOffset::new(slot, offset);

        // confirmed flush position when the slot has one, else the WAL head
        assert_eq!(
            u64::from(resolver.resolve(&resolve("used", Offset::Unspecified)).await.unwrap()),
            0x500
        );
        assert_eq!(
            u64::from(resolver.resolve(&resolve("fresh", Offset::Unspecified)).await.unwrap()),
            XLOGPOS
        );

        assert_eq!(
            u64::from(resolver.resolve(&resolve("used", Offset::Zero)).await.unwrap()),
            0
        );
        assert_eq!(
            u64::from(resolver.resolve(&resolve("used", Offset::NeverDelivered)).await.unwrap()),
            XLOGPOS
        );
        assert_eq!(
            u64::from(
                resolver
                    .resolve(&resolve("used", Offset::Explicit("0/2A".to_string())))
                    .await
                    .unwrap()
            ),
            0x2A
        );
        assert!(matches!(
            resolver
                .resolve(&resolve("used", Offset::Explicit("junk".to_string())))
                .await,
            Err(Error::InvalidLsn(_))
        ));
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let cursor = SlotCursor::new(Lsn::from(100));
        assert_eq!(cursor.pending_ack(), None);

        assert_eq!(u64::from(cursor.advance(Lsn::from(200))), 200);
        assert_eq!(u64::from(cursor.advance(Lsn::from(150))), 200);
        assert_eq!(u64::from(cursor.position()), 200);
        assert_eq!(cursor.pending_ack().map(u64::from), Some(200));

        cursor.mark_acked(Lsn::from(200));
        assert_eq!(cursor.pending_ack(), None);

        cursor.mark_acked(Lsn::from(50));
        assert_eq!(u64::from(cursor.acked()), 200);
    }
}
