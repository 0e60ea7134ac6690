use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{TransportError, TransportResult};
use crate::pipeline::ProcessingPipeline;
use crate::receive::{MessageReceiver, ReceiveSignal};
use crate::store::QueueStore;
use crate::types::TransactionMode;

/// Configuration for the message pump
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Transaction mode negotiated at endpoint-configuration time
    pub transaction_mode: TransactionMode,

    /// Concurrent receive loops per queue
    pub worker_count: usize,

    /// Sleep after an empty-queue receive cycle
    pub idle_backoff: Duration,

    /// Sleep after a failed receive attempt
    pub error_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transaction_mode: TransactionMode::default(),
            worker_count: 1,
            idle_backoff: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Handle for shutting the pump's workers down
pub struct PumpHandle {
    shutdown_txs: Vec<oneshot::Sender<()>>,
    join_handles: Vec<JoinHandle<()>>,
}

impl PumpHandle {
    /// Signal every worker and wait for them to finish their in-flight unit
    /// of work
    pub async fn shutdown(self) -> TransportResult<()> {
        for tx in self.shutdown_txs {
            let _ = tx.send(());
        }
        for handle in self.join_handles {
            handle
                .await
                .map_err(|e| TransportError::Internal(format!("Worker join error: {}", e)))?;
        }
        Ok(())
    }
}

/// Drives concurrent receive loops over one input queue. Each worker owns
/// its receiver clone and one unit of work at a time; all coordination
/// between workers is delegated to the store's transactional isolation.
pub struct MessagePump;

impl MessagePump {
    /// Spawn the configured number of workers
    pub fn start<S, P>(receiver: MessageReceiver<S, P>, config: &TransportConfig) -> PumpHandle
    where
        S: QueueStore,
        S::Connection: Sync,
        P: ProcessingPipeline<S> + 'static,
    {
        let mut shutdown_txs = Vec::with_capacity(config.worker_count);
        let mut join_handles = Vec::with_capacity(config.worker_count);

        for worker_id in 0..config.worker_count {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let worker = Worker {
                receiver: receiver.clone(),
                idle_backoff: config.idle_backoff,
                error_backoff: config.error_backoff,
                worker_id,
            };
            shutdown_txs.push(shutdown_tx);
            join_handles.push(tokio::spawn(worker.run(shutdown_rx)));
        }

        info!(workers = config.worker_count, "Started message pump");
        PumpHandle {
            shutdown_txs,
            join_handles,
        }
    }
}

struct Worker<S: QueueStore, P> {
    receiver: MessageReceiver<S, P>,
    idle_backoff: Duration,
    error_backoff: Duration,
    worker_id: usize,
}

impl<S, P> Worker<S, P>
where
    S: QueueStore,
    P: ProcessingPipeline<S> + 'static,
{
    /// Receive loop. Shutdown is checked between units of work; a mid-flight
    /// receive always completes or rolls back, never abandoned
    /// mid-transaction.
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(worker = self.worker_id, "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => break,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            let signal = ReceiveSignal::new();
            match self.receiver.receive_message(&signal).await {
                Ok(()) => {
                    if signal.is_cancelled() {
                        // Queue empty; idle until re-poll or shutdown
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            _ = tokio::time::sleep(self.idle_backoff) => {}
                        }
                    }
                }
                Err(err) => {
                    error!(worker = self.worker_id, error = %err, "Receive attempt failed");
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = self.worker_id, "Worker stopped");
    }
}
