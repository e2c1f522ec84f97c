pub mod binding;
pub mod catalog;
pub mod connection;
pub mod decoder;
pub mod replication;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use binding::{BindTarget, FieldBinding, FromFieldValue};
pub use catalog::{PgSlotCatalog, ReplicationSlot, SlotCatalog, SlotDefinition, SlotDefinitions};
pub use connection::{Connector, PgConnector, PgReplicationConnection, ReplicationConnection};
pub use decoder::{ChangeKind, ChangeRecord, ChangeSet, DataField};
pub use replication::{PrimaryKeepalive, ReplicationFrame, XLogData};
pub use types::*;
