//! Filtered replication between registries.
//!
//! A source registry streams itself to a sink with [`Registry::begin_replication`]; a
//! mirror registry feeds what it gets into [`Registry::receive`]. The stream begins with
//! the schema and a snapshot, then carries one message per visible event.
//!
//! [`Registry::begin_replication`]: crate::Registry::begin_replication
//! [`Registry::receive`]: crate::Registry::receive

mod message;
mod receive;
mod session;

pub use message::ReplicationMessage;

/// Destination of a replication stream.
pub trait ReplicationSink {
    fn deliver(&mut self, message: ReplicationMessage);
}

impl<F> ReplicationSink for F
where
    F: FnMut(ReplicationMessage),
{
    fn deliver(&mut self, message: ReplicationMessage) {
        self(message)
    }
}
