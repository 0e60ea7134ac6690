use std::sync::Arc;
use tracing::{debug, instrument};

use crate::context::TransportTransaction;
use crate::error::{TransportError, TransportResult};
use crate::queue::TableQueue;
use crate::store::QueueStore;
use crate::types::{OperationSet, TransactionMode};

/// How the dispatcher resolves connections for outgoing sends.
///
/// `Shared` issues every send of a batch over one connection. The legacy
/// multi-instance scheme (`PerQueueAddress`) opens one connection per
/// destination address and relies on an ambient scope for batch atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionResolution {
    #[default]
    Shared,
    PerQueueAddress,
}

/// Commits a set of outgoing send operations, choosing isolation from, or
/// participation in, the ambient transaction described by the transport
/// transaction context.
pub struct QueueDispatcher<S: QueueStore> {
    store: Arc<S>,
    resolution: ConnectionResolution,
}

impl<S: QueueStore> Clone for QueueDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            resolution: self.resolution,
        }
    }
}

impl<S: QueueStore> QueueDispatcher<S> {
    /// Create a dispatcher with shared-connection resolution
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            resolution: ConnectionResolution::Shared,
        }
    }

    /// Create a dispatcher with an explicit connection-resolution strategy
    pub fn with_resolution(store: Arc<S>, resolution: ConnectionResolution) -> Self {
        Self { store, resolution }
    }

    /// The configured resolution strategy
    pub fn resolution(&self) -> ConnectionResolution {
        self.resolution
    }

    /// Commit the operations independently of the triggering receive: a
    /// dispatch failure never rolls back the receive, and for modes at or
    /// above `SendsAtomicWithReceive` the sends are durable even if the main
    /// unit of work is rolled back.
    #[instrument(skip_all, fields(count = operations.len(), mode = %context.mode()))]
    pub async fn dispatch_isolated(
        &self,
        operations: &OperationSet,
        context: &TransportTransaction<S>,
    ) -> TransportResult<()> {
        if operations.is_empty() {
            return Ok(());
        }

        // Below SendsAtomicWithReceive there is nothing to be independent
        // from: plain autocommitted sends, any ambient coordination
        // suppressed. At or above, the batch gets its own independently
        // committed scope.
        let independent_scope = context.mode() >= TransactionMode::SendsAtomicWithReceive;
        debug!(independent_scope, "Dispatching isolated batch");

        match self.resolution {
            ConnectionResolution::Shared => {
                let mut conn = self.store.open_connection().await?;
                if independent_scope {
                    let tx = self.store.begin(&mut conn).await?;
                    match self.send_all(operations, &mut conn, Some(&tx)).await {
                        Ok(()) => self.store.commit(&mut conn, tx).await,
                        Err(err) => {
                            let _ = self.store.rollback(&mut conn, tx).await;
                            Err(err)
                        }
                    }
                } else {
                    self.send_all(operations, &mut conn, None).await
                }
            }
            ConnectionResolution::PerQueueAddress => {
                if independent_scope {
                    let scope = self.store.begin_ambient().await?;
                    match self.send_per_address(operations, Some(&scope)).await {
                        Ok(()) => self.store.complete_ambient(scope).await,
                        Err(err) => {
                            let _ = self.store.abort_ambient(scope).await;
                            Err(err)
                        }
                    }
                } else {
                    self.send_per_address(operations, None).await
                }
            }
        }
    }

    /// Commit the operations with the atomicity the negotiated mode calls
    /// for: below `SendsAtomicWithReceive` on their own connection and
    /// transaction, at or above it either through the ambient scope or on
    /// the exact connection and transaction captured at receive time.
    #[instrument(skip_all, fields(count = operations.len(), mode = %context.mode()))]
    pub async fn dispatch_non_isolated(
        &self,
        operations: &OperationSet,
        context: &mut TransportTransaction<S>,
    ) -> TransportResult<()> {
        if operations.is_empty() {
            return Ok(());
        }

        if self.resolution == ConnectionResolution::PerQueueAddress {
            return self.dispatch_non_isolated_per_address(operations, context).await;
        }

        if !context.mode().sends_join_receive() {
            // No shared context to join. Single operation skips the
            // transaction overhead; a larger batch commits all-or-nothing.
            let mut conn = self.store.open_connection().await?;
            if operations.len() == 1 {
                return self.send_all(operations, &mut conn, None).await;
            }
            let tx = self.store.begin(&mut conn).await?;
            return match self.send_all(operations, &mut conn, Some(&tx)).await {
                Ok(()) => self.store.commit(&mut conn, tx).await,
                Err(err) => {
                    let _ = self.store.rollback(&mut conn, tx).await;
                    Err(err)
                }
            };
        }

        if let Some(scope) = context.ambient_scope().cloned() {
            // The ambient scope is the coordination mechanism; the receive's
            // native connection cannot be reused under it.
            debug!("Dispatching through the ambient scope");
            let mut conn = self.store.open_connection().await?;
            self.store.enlist(&mut conn, &scope).await?;
            return self.send_all(operations, &mut conn, None).await;
        }

        // Sends commit or roll back together with the dequeue
        debug!("Dispatching on the receive transaction");
        let (conn, tx) = context.native_parts_mut().ok_or(
            TransportError::InvalidTransactionState(
                "sends-atomic dispatch requires the connection and transaction captured at receive",
            ),
        )?;
        self.send_all(operations, conn, Some(tx)).await
    }

    /// Legacy non-isolated dispatch: always inside an ambient scope, joining
    /// the receive's when present
    async fn dispatch_non_isolated_per_address(
        &self,
        operations: &OperationSet,
        context: &TransportTransaction<S>,
    ) -> TransportResult<()> {
        if let Some(scope) = context.ambient_scope() {
            return self.send_per_address(operations, Some(scope)).await;
        }
        let scope = self.store.begin_ambient().await?;
        match self.send_per_address(operations, Some(&scope)).await {
            Ok(()) => self.store.complete_ambient(scope).await,
            Err(err) => {
                let _ = self.store.abort_ambient(scope).await;
                Err(err)
            }
        }
    }

    /// Issue every operation of the batch over one connection; any failure
    /// aborts the caller's transactional context rather than partially
    /// dispatching
    async fn send_all(
        &self,
        operations: &OperationSet,
        conn: &mut S::Connection,
        tx: Option<&S::Transaction>,
    ) -> TransportResult<()> {
        for operation in operations {
            let queue = TableQueue::new(operation.address.clone());
            queue
                .send(&*self.store, &operation.message, conn, tx)
                .await?;
        }
        Ok(())
    }

    /// One connection per destination address, each enlisted in the scope
    /// when one is given
    async fn send_per_address(
        &self,
        operations: &OperationSet,
        scope: Option<&S::AmbientScope>,
    ) -> TransportResult<()> {
        for operation in operations {
            let mut conn = self.store.open_connection_for(&operation.address).await?;
            if let Some(scope) = scope {
                self.store.enlist(&mut conn, scope).await?;
            }
            let queue = TableQueue::new(operation.address.clone());
            queue
                .send(&*self.store, &operation.message, &mut conn, None)
                .await?;
        }
        Ok(())
    }
}
