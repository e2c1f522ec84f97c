//! PostgreSQL replication-slot consumer.
//!
//! A [`Consumer`] opens one replication connection per slot, streams
//! keepalive and XLogData messages, tracks each slot's position, and hands
//! every XLogData payload to a [`MessageHandler`] as a [`Message`] that can be
//! acknowledged when the application is done with it. Payloads produced by
//! wal2json decode into a [`postgres::ChangeSet`].

pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod postgres;
pub mod slot;
mod worker;

pub use config::Config;
pub use consumer::{Consumer, ConsumerBuilder};
pub use error::{Error, Result};
pub use handler::{ErrorHandler, EventHandler, MessageHandler};
pub use message::{AckDelegate, Event, Message};
pub use postgres::Lsn;
pub use slot::{Offset, OffsetResolver, Slot, SlotCursor, SlotOffset};
