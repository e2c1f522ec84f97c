//! Application callbacks.
//!
//! Closures implement the traits directly:
//!
//! ```rust,no_run
//! use pg_stream::{Consumer, Error, Event, Message};
//!
//! let consumer = Consumer::builder(Default::default())
//!     .message_handler(|message: Message| async move {
//!         println!("{} bytes at {}", message.data().len(), message.lsn());
//!         message.ack().await
//!     })
//!     .event_handler(|event: &Event| println!("event {}", event.byte_id() as char))
//!     .error_handler(|err: &Error| err.is_timeout())
//!     .build();
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

use crate::message::{Event, Message};
use crate::{Error, Result};

/// Receives every XLogData message of every subscribed slot.
///
/// Returning an error hands it to the [`ErrorHandler`]; if that does not
/// dispose of it, the slot's polling loop stops.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self)(message).await
    }
}

/// Observes keepalive and XLogData events before any message is built.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self)(event)
    }
}

/// Decides whether a polling loop survives an error.
///
/// Returns `true` when the error has been disposed of and the loop may go on.
/// Usually called from a polling loop; failures of [`Message::ack`](crate::Message::ack)
/// are reported from whichever task called it.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, err: &Error) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    fn on_error(&self, err: &Error) -> bool {
        (self)(err)
    }
}

#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub message: Option<Arc<dyn MessageHandler>>,
    pub event: Option<Arc<dyn EventHandler>>,
    pub error: Option<Arc<dyn ErrorHandler>>,
}

impl Handlers {
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        match &self.message {
            Some(handler) => handler.handle(message).await,
            None => {
                trace!(lsn = %message.lsn(), "No message handler installed");
                Ok(())
            }
        }
    }

    pub fn dispatch_event(&self, event: &Event) {
        if let Some(handler) = &self.event {
            handler.on_event(event);
        }
    }

    /// `true` if an error handler disposed of `err`.
    pub fn handle_error(&self, err: &Error) -> bool {
        match &self.error {
            Some(handler) => handler.on_error(err),
            None => false,
        }
    }
}
