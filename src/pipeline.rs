use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::TransportTransaction;
use crate::error::{HandlerError, TransportResult};
use crate::store::QueueStore;
use crate::types::{Message, OperationSet, QueuedOperation};

/// The surrounding message-processing pipeline, invoked once per
/// successfully dequeued, non-poison message.
///
/// Runs synchronously inside the live unit of work, so its dispatch calls can
/// see and optionally join the receive's transaction through the supplied
/// context. Returns the outgoing operations produced while handling the
/// message; failures propagate as a typed outcome, never silently.
#[async_trait]
pub trait ProcessingPipeline<S: QueueStore>: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        transaction: &mut TransportTransaction<S>,
    ) -> Result<OperationSet, HandlerError>;
}

/// External scheduler for positive-delay retries: accepts a message and a
/// due time. Execution of the delayed delivery is outside this transport.
#[async_trait]
pub trait DelayedDelivery: Send + Sync {
    async fn schedule(
        &self,
        operation: QueuedOperation,
        due: DateTime<Utc>,
    ) -> TransportResult<()>;
}
