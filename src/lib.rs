//! # tablemq: Transactional Message Transport over Relational Tables
//!
//! tablemq turns ordinary relational-database tables into message queues with
//! the delivery guarantees normally associated with dedicated brokers:
//! exactly-once-effective processing under retry, poison-message quarantine,
//! and configurable atomicity between receiving a message and dispatching the
//! outgoing messages its processing produced.
//!
//! The core is the dispatch and receive engine: for every inbound message it
//! decides which transactional context dequeues it, and for every batch of
//! outgoing messages which transactional context commits them - including the
//! cases where send and receive must be atomic, must be isolated from each
//! other, or must run with no transaction at all. Four [`TransactionMode`]s,
//! ordered by guarantee strength, drive every one of those decisions:
//!
//! - `None` - no transaction; best-effort, cheapest.
//! - `ReceiveOnly` - the dequeue is transactional, sends are not tied to it.
//! - `SendsAtomicWithReceive` - sends share the receive's connection and
//!   transaction, committing or rolling back as one unit of work.
//! - `TransactionScope` - an ambient scope coordinates receive and sends
//!   across separate connections.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tablemq::prelude::*;
//!
//! struct Forwarder;
//!
//! #[async_trait::async_trait]
//! impl ProcessingPipeline<MemoryStore> for Forwarder {
//!     async fn handle(
//!         &self,
//!         message: &Message,
//!         _transaction: &mut TransportTransaction<MemoryStore>,
//!     ) -> Result<OperationSet, HandlerError> {
//!         // Forward every payload to an audit queue, atomically with the
//!         // receive when the mode permits it
//!         let mut outgoing = OperationSet::new();
//!         outgoing.insert(QueuedOperation::new(
//!             QueueAddress::from("audit"),
//!             Message::new(message.body.clone()),
//!         ));
//!         Ok(outgoing)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TransportError> {
//! let store = Arc::new(MemoryStore::new());
//! store.create_queue(&QueueAddress::from("input")).await?;
//! store.create_queue(&QueueAddress::from("error")).await?;
//! store.create_queue(&QueueAddress::from("audit")).await?;
//!
//! let receiver = MessageReceiver::new(
//!     store.clone(),
//!     TableQueue::new(QueueAddress::from("input")),
//!     TableQueue::new(QueueAddress::from("error")),
//!     Arc::new(Forwarder),
//!     TransactionMode::SendsAtomicWithReceive,
//! );
//!
//! let signal = ReceiveSignal::new();
//! receiver.receive_message(&signal).await?;
//! assert!(signal.is_cancelled()); // queue was empty
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod pump;
pub mod queue;
pub mod receive;
pub mod retry;
pub mod store;
pub mod types;

// Core API exports
pub use context::TransportTransaction;
pub use dispatch::{ConnectionResolution, QueueDispatcher};
pub use error::{HandlerError, TransportError, TransportResult};
pub use pipeline::{DelayedDelivery, ProcessingPipeline};
pub use pump::{MessagePump, PumpHandle, TransportConfig};
pub use queue::{
    DequeueResult, PoisonMessage, PoisonPolicy, PoisonReason, ReceivedMessage, TableQueue,
};
pub use receive::{MessageReceiver, ReceiveSignal, ReceiveStrategy};
pub use retry::{
    DelayedRetryPolicy, ImmediateRetryPolicy, NoRetryPolicy, RetryDecision, RetryPolicy,
};
pub use store::memory::MemoryStore;
pub use store::{QueueRow, QueueStore};
pub use types::{Message, MessageId, OperationSet, QueueAddress, QueuedOperation, TransactionMode};

// Storage backends
#[cfg(feature = "sqlite")]
pub use store::sqlite::SqliteStore;

/// Everything needed to wire a transport endpoint
pub mod prelude {
    pub use crate::{
        ConnectionResolution, DelayedDelivery, DequeueResult, HandlerError, Message, MessageId,
        MessagePump, MessageReceiver, OperationSet, PoisonPolicy, ProcessingPipeline,
        QueueAddress, QueueDispatcher, QueueStore, QueuedOperation, ReceiveSignal, RetryDecision,
        RetryPolicy, TableQueue, TransactionMode, TransportConfig, TransportError,
        TransportResult, TransportTransaction,
    };

    pub use crate::MemoryStore;

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;

    pub use async_trait::async_trait;
}
