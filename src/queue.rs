use tracing::debug;

use crate::error::TransportResult;
use crate::store::{QueueRow, QueueStore};
use crate::types::{Message, QueueAddress};

/// Why a row was classified as poison
#[derive(Debug, Clone, PartialEq)]
pub enum PoisonReason {
    /// The header text could not be parsed
    MalformedHeaders(String),

    /// The row's delivery-attempt count exceeded the configured budget
    AttemptsExhausted(u32),
}

/// A row that cannot be processed, carried raw so its original payload
/// survives the move to the error queue intact
#[derive(Debug, Clone)]
pub struct PoisonMessage {
    /// The raw row as it came off the queue
    pub row: QueueRow,

    /// Why it was quarantined
    pub reason: PoisonReason,
}

/// A well-formed message handed to the processing pipeline
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The parsed message
    pub message: Message,

    /// Delivery-attempt count including this dequeue
    pub delivery_attempts: u32,
}

/// Outcome of one dequeue attempt
#[derive(Debug)]
pub enum DequeueResult {
    /// No row available; the sole termination signal for a polling receive
    /// loop
    Empty,

    /// Row cannot be processed and must be dead-lettered
    Poison(PoisonMessage),

    /// Well-formed message ready for processing
    Received(ReceivedMessage),
}

/// Explicit poison predicate over a dequeued row.
///
/// A row is poison when its headers fail to parse, or when
/// `max_delivery_attempts` is set and the row's attempt count exceeds it.
/// `None` means the attempt count never poisons on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoisonPolicy {
    /// Delivery-attempt budget; `None` disables attempt-based quarantine
    pub max_delivery_attempts: Option<u32>,
}

impl PoisonPolicy {
    /// Quarantine rows delivered more than `max` times
    pub fn with_max_delivery_attempts(max: u32) -> Self {
        Self {
            max_delivery_attempts: Some(max),
        }
    }
}

/// One named queue backed by a table, exposing atomic
/// dequeue-with-poison-check and enqueue against a supplied
/// connection/transaction.
#[derive(Debug, Clone)]
pub struct TableQueue {
    address: QueueAddress,
    poison: PoisonPolicy,
}

impl TableQueue {
    /// Create a queue over the given address
    pub fn new(address: QueueAddress) -> Self {
        Self {
            address,
            poison: PoisonPolicy::default(),
        }
    }

    /// Set the poison policy
    pub fn with_poison_policy(mut self, poison: PoisonPolicy) -> Self {
        self.poison = poison;
        self
    }

    /// The queue's address
    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    /// Atomically remove the next available row under the given transactional
    /// context and classify it.
    pub async fn try_receive<S: QueueStore>(
        &self,
        store: &S,
        conn: &mut S::Connection,
        tx: Option<&S::Transaction>,
    ) -> TransportResult<DequeueResult> {
        let Some(row) = store.pop_row(&self.address, conn, tx).await? else {
            return Ok(DequeueResult::Empty);
        };

        if let Some(max) = self.poison.max_delivery_attempts {
            if row.delivery_attempts > max {
                debug!(
                    queue = %self.address,
                    id = %row.id,
                    attempts = row.delivery_attempts,
                    "Row exceeded delivery-attempt budget"
                );
                return Ok(DequeueResult::Poison(PoisonMessage {
                    reason: PoisonReason::AttemptsExhausted(row.delivery_attempts),
                    row,
                }));
            }
        }

        match row.to_message() {
            Ok(message) => Ok(DequeueResult::Received(ReceivedMessage {
                delivery_attempts: row.delivery_attempts,
                message,
            })),
            Err(err) => {
                debug!(queue = %self.address, id = %row.id, error = %err, "Malformed row");
                Ok(DequeueResult::Poison(PoisonMessage {
                    reason: PoisonReason::MalformedHeaders(err.to_string()),
                    row,
                }))
            }
        }
    }

    /// Append a message. Works with `tx = None`: the connection's ambient
    /// scope applies if enlisted, otherwise the write autocommits.
    pub async fn send<S: QueueStore>(
        &self,
        store: &S,
        message: &Message,
        conn: &mut S::Connection,
        tx: Option<&S::Transaction>,
    ) -> TransportResult<()> {
        debug!(queue = %self.address, id = %message.id, size = message.body_size(), "Enqueueing");
        let row = QueueRow::from_message(message)?;
        store.push_row(&self.address, row, conn, tx).await
    }

    /// Move a poison row here (the error queue), preserving its raw payload.
    /// Must run under the same transactional context that removed the row so
    /// the move is atomic.
    pub async fn dead_letter<S: QueueStore>(
        &self,
        store: &S,
        poison: &PoisonMessage,
        conn: &mut S::Connection,
        tx: Option<&S::Transaction>,
    ) -> TransportResult<()> {
        store
            .push_row(&self.address, poison.row.clone(), conn, tx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn setup() -> (MemoryStore, TableQueue) {
        let store = MemoryStore::new();
        let queue = TableQueue::new(QueueAddress::from("input"));
        store.create_queue(queue.address()).await.unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let (store, queue) = setup().await;
        let mut conn = store.open_connection().await.unwrap();

        let message = Message::new(b"hello".to_vec()).with_header("kind", "greeting");
        queue.send(&store, &message, &mut conn, None).await.unwrap();

        match queue.try_receive(&store, &mut conn, None).await.unwrap() {
            DequeueResult::Received(received) => {
                assert_eq!(received.message.id, message.id);
                assert_eq!(received.message.body, b"hello");
                assert_eq!(received.message.header("kind"), Some("greeting"));
                assert_eq!(received.delivery_attempts, 1);
            }
            other => panic!("expected Received, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (store, queue) = setup().await;
        let mut conn = store.open_connection().await.unwrap();

        assert!(matches!(
            queue.try_receive(&store, &mut conn, None).await.unwrap(),
            DequeueResult::Empty
        ));
    }

    #[tokio::test]
    async fn test_malformed_headers_are_poison() {
        let (store, queue) = setup().await;
        let mut conn = store.open_connection().await.unwrap();

        let row = QueueRow {
            id: "bad".to_string(),
            headers: "{not json".to_string(),
            body: b"payload".to_vec(),
            delivery_attempts: 0,
        };
        store
            .push_row(queue.address(), row, &mut conn, None)
            .await
            .unwrap();

        match queue.try_receive(&store, &mut conn, None).await.unwrap() {
            DequeueResult::Poison(poison) => {
                assert!(matches!(poison.reason, PoisonReason::MalformedHeaders(_)));
                assert_eq!(poison.row.body, b"payload");
            }
            other => panic!("expected Poison, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_budget_poisons() {
        let (store, _) = setup().await;
        let queue = TableQueue::new(QueueAddress::from("input"))
            .with_poison_policy(PoisonPolicy::with_max_delivery_attempts(2));
        let mut conn = store.open_connection().await.unwrap();

        let mut row = QueueRow::from_message(&Message::new(b"x".to_vec())).unwrap();
        row.delivery_attempts = 2;
        store
            .push_row(queue.address(), row, &mut conn, None)
            .await
            .unwrap();

        // This dequeue makes it attempt 3, over the budget of 2
        match queue.try_receive(&store, &mut conn, None).await.unwrap() {
            DequeueResult::Poison(poison) => {
                assert_eq!(poison.reason, PoisonReason::AttemptsExhausted(3));
            }
            other => panic!("expected Poison, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_letter_preserves_payload() {
        let (store, queue) = setup().await;
        let error_queue = TableQueue::new(QueueAddress::from("error"));
        store.create_queue(error_queue.address()).await.unwrap();
        let mut conn = store.open_connection().await.unwrap();

        let row = QueueRow {
            id: "bad".to_string(),
            headers: "not json at all".to_string(),
            body: b"original".to_vec(),
            delivery_attempts: 4,
        };
        store
            .push_row(queue.address(), row, &mut conn, None)
            .await
            .unwrap();

        let DequeueResult::Poison(poison) =
            queue.try_receive(&store, &mut conn, None).await.unwrap()
        else {
            panic!("expected Poison");
        };
        error_queue
            .dead_letter(&store, &poison, &mut conn, None)
            .await
            .unwrap();

        let moved = store
            .pop_row(error_queue.address(), &mut conn, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.body, b"original");
        assert_eq!(moved.headers, "not json at all");
    }
}
