pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TransportResult;
use crate::types::{Message, MessageId, QueueAddress};

/// Raw persisted shape of one queue row. Structural validation happens in
/// the table queue, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    /// Message identifier
    pub id: String,

    /// Header map as JSON text
    pub headers: String,

    /// Opaque payload bytes
    pub body: Vec<u8>,

    /// How many times this row has been handed to a receiver
    pub delivery_attempts: u32,
}

impl QueueRow {
    /// Build a row from a message, serializing the header map
    pub fn from_message(message: &Message) -> TransportResult<Self> {
        Ok(Self {
            id: message.id.to_string(),
            headers: serde_json::to_string(&message.headers)?,
            body: message.body.clone(),
            delivery_attempts: 0,
        })
    }

    /// Parse the row back into a message. Fails on malformed header text;
    /// the caller classifies that failure as poison.
    pub fn to_message(&self) -> TransportResult<Message> {
        let headers: HashMap<String, String> = serde_json::from_str(&self.headers)?;
        Ok(Message {
            id: MessageId::from(self.id.as_str()),
            headers,
            body: self.body.clone(),
        })
    }
}

/// Storage seam for the transport: connection acquisition, native and ambient
/// transaction control, and the two row primitives every queue operation is
/// built from.
///
/// Transactional state rides on the connection; the `Transaction` associated
/// type is an opaque token pairing a begin with its commit or rollback. An
/// `AmbientScope` coordinates work across any number of enlisted connections
/// and commits or aborts them as one. Stores that cannot coordinate a
/// distributed scope must fail `begin_ambient` with
/// [`crate::TransportError::UnsupportedMode`] rather than downgrade.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    type Connection: Send;
    type Transaction: Send + Sync;
    type AmbientScope: Send + Sync + Clone;

    /// Open a new connection
    async fn open_connection(&self) -> TransportResult<Self::Connection>;

    /// Open a connection scoped to a queue address (multi-instance
    /// deployments); single-instance stores resolve every address to the
    /// same place
    async fn open_connection_for(
        &self,
        address: &QueueAddress,
    ) -> TransportResult<Self::Connection> {
        let _ = address;
        self.open_connection().await
    }

    /// Begin a native transaction on the connection
    async fn begin(&self, conn: &mut Self::Connection) -> TransportResult<Self::Transaction>;

    /// Commit a native transaction
    async fn commit(
        &self,
        conn: &mut Self::Connection,
        tx: Self::Transaction,
    ) -> TransportResult<()>;

    /// Roll back a native transaction, restoring any rows it removed
    async fn rollback(
        &self,
        conn: &mut Self::Connection,
        tx: Self::Transaction,
    ) -> TransportResult<()>;

    /// Begin an ambient scope coordinating multiple connections
    async fn begin_ambient(&self) -> TransportResult<Self::AmbientScope>;

    /// Enlist a connection in an ambient scope; its row operations then
    /// commit or abort with the scope
    async fn enlist(
        &self,
        conn: &mut Self::Connection,
        scope: &Self::AmbientScope,
    ) -> TransportResult<()>;

    /// Atomically apply all work buffered in the scope
    async fn complete_ambient(&self, scope: Self::AmbientScope) -> TransportResult<()>;

    /// Discard the scope's buffered work and restore removed rows
    async fn abort_ambient(&self, scope: Self::AmbientScope) -> TransportResult<()>;

    /// Concurrency-safe select-and-remove of the next visible row. Two
    /// connections can never pop the same row. The returned row carries its
    /// delivery-attempt counter already incremented for this removal.
    async fn pop_row(
        &self,
        address: &QueueAddress,
        conn: &mut Self::Connection,
        tx: Option<&Self::Transaction>,
    ) -> TransportResult<Option<QueueRow>>;

    /// Append a row. Usable with `tx = None`: the connection's ambient scope
    /// applies if enlisted, otherwise the write autocommits.
    async fn push_row(
        &self,
        address: &QueueAddress,
        row: QueueRow,
        conn: &mut Self::Connection,
        tx: Option<&Self::Transaction>,
    ) -> TransportResult<()>;

    /// Idempotent queue provisioning
    async fn create_queue(&self, address: &QueueAddress) -> TransportResult<()>;

    /// Number of visible rows in a queue
    async fn queue_len(&self, address: &QueueAddress) -> TransportResult<usize>;
}
