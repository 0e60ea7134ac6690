use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::context::TransportTransaction;
use crate::dispatch::QueueDispatcher;
use crate::error::{HandlerError, TransportError, TransportResult};
use crate::pipeline::{DelayedDelivery, ProcessingPipeline};
use crate::queue::{DequeueResult, ReceivedMessage, TableQueue};
use crate::retry::{ImmediateRetryPolicy, RetryDecision, RetryPolicy};
use crate::store::QueueStore;
use crate::types::{Message, QueuedOperation, TransactionMode};

/// Header recording why an exhausted message was dead-lettered
pub const HEADER_FAILURE_REASON: &str = "tablemq.failure-reason";

/// Header recording how many processing attempts the message had consumed
pub const HEADER_FAILURE_ATTEMPTS: &str = "tablemq.failure-attempts";

/// Cooperative cancellation flag for one receive attempt. The empty-queue
/// path sets it so the driving loop can back off instead of busy-spinning.
#[derive(Debug, Default)]
pub struct ReceiveSignal {
    cancelled: AtomicBool,
}

impl ReceiveSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the driving loop to stop the current receive cycle
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The transactional discipline a receive runs under. The mode set is closed
/// and known at configuration time, so the variants are a plain enum picked
/// by one decision function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStrategy {
    /// No transaction at all; best-effort
    NoTransaction,

    /// A native database transaction spans the dequeue (and, at
    /// `SendsAtomicWithReceive`, the sends)
    NativeTransaction,

    /// An ambient scope coordinates the dequeue and sends across connections
    AmbientScope,
}

impl ReceiveStrategy {
    /// Select the strategy for a configured transaction mode
    pub fn for_mode(mode: TransactionMode) -> Self {
        match mode {
            TransactionMode::None => Self::NoTransaction,
            TransactionMode::ReceiveOnly | TransactionMode::SendsAtomicWithReceive => {
                Self::NativeTransaction
            }
            TransactionMode::TransactionScope => Self::AmbientScope,
        }
    }
}

/// Dequeues one message per attempt under the configured transactional
/// discipline, classifies it, and drives the processing pipeline and failure
/// recovery for normal messages.
pub struct MessageReceiver<S: QueueStore, P> {
    store: Arc<S>,
    input_queue: TableQueue,
    error_queue: TableQueue,
    dispatcher: QueueDispatcher<S>,
    pipeline: Arc<P>,
    retry_policy: Arc<dyn RetryPolicy>,
    delayed_delivery: Option<Arc<dyn DelayedDelivery>>,
    mode: TransactionMode,
}

impl<S: QueueStore, P> Clone for MessageReceiver<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            input_queue: self.input_queue.clone(),
            error_queue: self.error_queue.clone(),
            dispatcher: self.dispatcher.clone(),
            pipeline: self.pipeline.clone(),
            retry_policy: self.retry_policy.clone(),
            delayed_delivery: self.delayed_delivery.clone(),
            mode: self.mode,
        }
    }
}

impl<S, P> MessageReceiver<S, P>
where
    S: QueueStore,
    P: ProcessingPipeline<S>,
{
    /// Create a receiver with the default dispatcher and an in-place retry
    /// policy
    pub fn new(
        store: Arc<S>,
        input_queue: TableQueue,
        error_queue: TableQueue,
        pipeline: Arc<P>,
        mode: TransactionMode,
    ) -> Self {
        let dispatcher = QueueDispatcher::new(store.clone());
        Self {
            store,
            input_queue,
            error_queue,
            dispatcher,
            pipeline,
            retry_policy: Arc::new(ImmediateRetryPolicy::default()),
            delayed_delivery: None,
            mode,
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Configure the delayed-delivery scheduler used for positive-delay
    /// retries
    pub fn with_delayed_delivery(mut self, scheduler: Arc<dyn DelayedDelivery>) -> Self {
        self.delayed_delivery = Some(scheduler);
        self
    }

    /// Replace the dispatcher (e.g. for legacy per-address resolution)
    pub fn with_dispatcher(mut self, dispatcher: QueueDispatcher<S>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// The dispatcher used for outgoing operations
    pub fn dispatcher(&self) -> &QueueDispatcher<S> {
        &self.dispatcher
    }

    /// The configured transaction mode
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Run one full receive attempt under the discipline the configured mode
    /// calls for
    #[instrument(skip_all, fields(queue = %self.input_queue.address(), mode = %self.mode))]
    pub async fn receive_message(&self, signal: &ReceiveSignal) -> TransportResult<()> {
        match ReceiveStrategy::for_mode(self.mode) {
            ReceiveStrategy::NoTransaction => self.receive_no_transaction(signal).await,
            ReceiveStrategy::NativeTransaction => self.receive_native(signal).await,
            ReceiveStrategy::AmbientScope => self.receive_ambient(signal).await,
        }
    }

    /// Best-effort receive: no transactional guarantee of any kind. A crash
    /// between dequeue and processing completion can lose the message or
    /// process it twice.
    async fn receive_no_transaction(&self, signal: &ReceiveSignal) -> TransportResult<()> {
        let mut conn = self.store.open_connection().await?;

        match self.input_queue.try_receive(&*self.store, &mut conn, None).await? {
            DequeueResult::Empty => {
                signal.cancel();
                Ok(())
            }
            DequeueResult::Poison(poison) => {
                warn!(id = %poison.row.id, reason = ?poison.reason, "Dead-lettering poison message");
                self.error_queue
                    .dead_letter(&*self.store, &poison, &mut conn, None)
                    .await
            }
            DequeueResult::Received(received) => {
                let mut context =
                    TransportTransaction::<S>::with_connection(self.mode, conn);
                self.process(received, &mut context).await
            }
        }
    }

    /// Receive under a native transaction; the dequeue, any dead-letter move
    /// and (at `SendsAtomicWithReceive`) the sends commit as one
    async fn receive_native(&self, signal: &ReceiveSignal) -> TransportResult<()> {
        let mut conn = self.store.open_connection().await?;
        let tx = self.store.begin(&mut conn).await?;

        let result = match self
            .input_queue
            .try_receive(&*self.store, &mut conn, Some(&tx))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let _ = self.store.rollback(&mut conn, tx).await;
                return Err(err);
            }
        };

        match result {
            DequeueResult::Empty => {
                self.store.rollback(&mut conn, tx).await?;
                signal.cancel();
                Ok(())
            }
            DequeueResult::Poison(poison) => {
                warn!(id = %poison.row.id, reason = ?poison.reason, "Dead-lettering poison message");
                if let Err(err) = self
                    .error_queue
                    .dead_letter(&*self.store, &poison, &mut conn, Some(&tx))
                    .await
                {
                    let _ = self.store.rollback(&mut conn, tx).await;
                    return Err(err);
                }
                self.store.commit(&mut conn, tx).await
            }
            DequeueResult::Received(received) => {
                let mut context = TransportTransaction::<S>::native(self.mode, conn, tx);
                let outcome = self.process(received, &mut context).await;
                let (mut conn, tx) = context.into_native_parts().ok_or(
                    TransportError::InvalidTransactionState(
                        "receive transaction was consumed during processing",
                    ),
                )?;
                match outcome {
                    Ok(()) => self.store.commit(&mut conn, tx).await,
                    Err(err) => {
                        let _ = self.store.rollback(&mut conn, tx).await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Receive inside an ambient scope; every enlisted connection commits or
    /// aborts with the scope
    async fn receive_ambient(&self, signal: &ReceiveSignal) -> TransportResult<()> {
        let scope = self.store.begin_ambient().await?;
        let mut conn = match self.store.open_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                let _ = self.store.abort_ambient(scope).await;
                return Err(err);
            }
        };
        if let Err(err) = self.store.enlist(&mut conn, &scope).await {
            let _ = self.store.abort_ambient(scope).await;
            return Err(err);
        }

        let result = match self
            .input_queue
            .try_receive(&*self.store, &mut conn, None)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let _ = self.store.abort_ambient(scope).await;
                return Err(err);
            }
        };

        match result {
            DequeueResult::Empty => {
                self.store.abort_ambient(scope).await?;
                signal.cancel();
                Ok(())
            }
            DequeueResult::Poison(poison) => {
                warn!(id = %poison.row.id, reason = ?poison.reason, "Dead-lettering poison message");
                if let Err(err) = self
                    .error_queue
                    .dead_letter(&*self.store, &poison, &mut conn, None)
                    .await
                {
                    let _ = self.store.abort_ambient(scope).await;
                    return Err(err);
                }
                self.store.complete_ambient(scope).await
            }
            DequeueResult::Received(received) => {
                let mut context =
                    TransportTransaction::<S>::ambient(self.mode, scope.clone(), conn);
                let outcome = self.process(received, &mut context).await;
                drop(context);
                match outcome {
                    Ok(()) => self.store.complete_ambient(scope).await,
                    Err(err) => {
                        let _ = self.store.abort_ambient(scope).await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Invoke the pipeline inside the live unit of work and execute the
    /// retry policy's decisions on failure. Each failed attempt increments
    /// the attempt counter by exactly one, regardless of mode.
    async fn process(
        &self,
        received: ReceivedMessage,
        context: &mut TransportTransaction<S>,
    ) -> TransportResult<()> {
        let message = received.message;
        let mut failures = 0u32;

        loop {
            match self.pipeline.handle(&message, context).await {
                Ok(outgoing) => {
                    self.dispatcher.dispatch_non_isolated(&outgoing, context).await?;
                    return Ok(());
                }
                Err(handler_err) => {
                    failures += 1;
                    // Redeliveries already consumed (delivery_attempts - 1)
                    // attempts before this one
                    let attempts = received.delivery_attempts.saturating_sub(1) + failures;
                    match self
                        .retry_policy
                        .on_failure(&message, attempts, &handler_err)
                    {
                        RetryDecision::RetryNow => {
                            debug!(id = %message.id, attempts, "Retrying message in place");
                        }
                        RetryDecision::Delay(delay) => {
                            let scheduler = self
                                .delayed_delivery
                                .as_ref()
                                .ok_or(TransportError::DelayedDeliveryUnavailable)?;
                            let delay = chrono::Duration::from_std(delay)
                                .map_err(|e| TransportError::Internal(e.to_string()))?;
                            let due = Utc::now() + delay;
                            scheduler
                                .schedule(
                                    QueuedOperation::new(
                                        self.input_queue.address().clone(),
                                        message.clone(),
                                    ),
                                    due,
                                )
                                .await?;
                            warn!(id = %message.id, attempts, %due, "Scheduled delayed redelivery");
                            return Ok(());
                        }
                        RetryDecision::Discontinue => {
                            warn!(id = %message.id, attempts, error = %handler_err, "Message exhausted, dead-lettering");
                            return self
                                .dead_letter_exhausted(&message, attempts, &handler_err, context)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Move an exhausted message to the error queue under the live unit of
    /// work, annotated with the failure reason
    async fn dead_letter_exhausted(
        &self,
        message: &Message,
        attempts: u32,
        error: &HandlerError,
        context: &mut TransportTransaction<S>,
    ) -> TransportResult<()> {
        let annotated = message
            .clone()
            .with_header(HEADER_FAILURE_REASON, error.to_string())
            .with_header(HEADER_FAILURE_ATTEMPTS, attempts.to_string());

        if let Some((conn, tx)) = context.native_parts_mut() {
            return self
                .error_queue
                .send(&*self.store, &annotated, conn, Some(tx))
                .await;
        }
        if let Some(conn) = context.connection_mut() {
            return self
                .error_queue
                .send(&*self.store, &annotated, conn, None)
                .await;
        }
        let mut conn = self.store.open_connection().await?;
        self.error_queue
            .send(&*self.store, &annotated, &mut conn, None)
            .await
    }
}
