use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Row, SqliteConnection};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{TransportError, TransportResult};
use crate::store::{QueueRow, QueueStore};
use crate::types::{QueueAddress, TransactionMode};

/// SQLite-backed store. Each queue is one table; `pop_row` is a single
/// atomic `DELETE ... RETURNING` so two connections can never remove the
/// same row.
///
/// Native transactions are issued as explicit `BEGIN IMMEDIATE` / `COMMIT` /
/// `ROLLBACK` statements keyed by the transaction token. SQLite has no
/// distributed-transaction coordinator, so ambient scopes are unsupported:
/// `begin_ambient` fails with `UnsupportedMode` instead of downgrading,
/// which rules out the `TransactionScope` mode on this store.
///
/// The delivery-attempt counter is computed inside the removal statement, so
/// a rollback restores the row with its original count. Unlike
/// [`MemoryStore`](crate::MemoryStore), a message whose unit of work keeps
/// rolling back never accumulates attempts here;
/// [`PoisonPolicy::max_delivery_attempts`](crate::PoisonPolicy) will not trip
/// for such messages, and exhaustion must come from the retry policy instead.
/// Attempt-based quarantine still applies to structurally redelivered rows.
pub struct SqliteStore {
    options: SqliteConnectOptions,
    next_tx_id: AtomicU64,
}

/// Connection into a [`SqliteStore`]
pub struct SqliteQueueConnection {
    conn: SqliteConnection,
    tx: Option<u64>,
}

/// Token pairing a `begin` with its commit or rollback
pub struct SqliteTransaction {
    id: u64,
}

/// Never constructed; SQLite cannot coordinate an ambient scope
#[derive(Debug, Clone)]
pub enum SqliteAmbientScope {}

impl SqliteStore {
    /// Create a store over a database file, creating it if missing
    pub fn new(path: impl AsRef<Path>) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Self {
            options,
            next_tx_id: AtomicU64::new(1),
        }
    }

    /// Quote the address as a SQL identifier, rejecting anything that is not
    /// a plain table name
    fn table(address: &QueueAddress) -> TransportResult<String> {
        if !address.is_valid_identifier() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        Ok(format!("\"{}\"", address.as_str()))
    }

    fn map_err(address: &QueueAddress, err: sqlx::Error) -> TransportError {
        let text = err.to_string();
        if text.contains("no such table") {
            TransportError::QueueNotFound(address.to_string())
        } else {
            TransportError::Storage(text)
        }
    }

    fn check_tx(
        conn: &SqliteQueueConnection,
        tx: Option<&SqliteTransaction>,
    ) -> TransportResult<()> {
        match (tx, conn.tx) {
            (None, None) => Ok(()),
            (Some(token), Some(open)) if token.id == open => Ok(()),
            (Some(_), _) => Err(TransportError::InvalidTransactionState(
                "transaction token does not match this connection",
            )),
            (None, Some(_)) => Err(TransportError::InvalidTransactionState(
                "connection has an open transaction; operations must pass its token",
            )),
        }
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    type Connection = SqliteQueueConnection;
    type Transaction = SqliteTransaction;
    type AmbientScope = SqliteAmbientScope;

    async fn open_connection(&self) -> TransportResult<SqliteQueueConnection> {
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        Ok(SqliteQueueConnection { conn, tx: None })
    }

    async fn begin(&self, conn: &mut SqliteQueueConnection) -> TransportResult<SqliteTransaction> {
        if conn.tx.is_some() {
            return Err(TransportError::InvalidTransactionState(
                "a transaction is already open on this connection",
            ));
        }
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut conn.conn)
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        conn.tx = Some(id);
        Ok(SqliteTransaction { id })
    }

    async fn commit(
        &self,
        conn: &mut SqliteQueueConnection,
        tx: SqliteTransaction,
    ) -> TransportResult<()> {
        match conn.tx {
            Some(open) if open == tx.id => {}
            _ => {
                return Err(TransportError::InvalidTransactionState(
                    "transaction token does not match this connection",
                ))
            }
        }
        sqlx::query("COMMIT")
            .execute(&mut conn.conn)
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        conn.tx = None;
        Ok(())
    }

    async fn rollback(
        &self,
        conn: &mut SqliteQueueConnection,
        tx: SqliteTransaction,
    ) -> TransportResult<()> {
        match conn.tx {
            Some(open) if open == tx.id => {}
            _ => {
                return Err(TransportError::InvalidTransactionState(
                    "transaction token does not match this connection",
                ))
            }
        }
        sqlx::query("ROLLBACK")
            .execute(&mut conn.conn)
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        conn.tx = None;
        Ok(())
    }

    async fn begin_ambient(&self) -> TransportResult<SqliteAmbientScope> {
        Err(TransportError::UnsupportedMode(
            TransactionMode::TransactionScope,
        ))
    }

    async fn enlist(
        &self,
        _conn: &mut SqliteQueueConnection,
        scope: &SqliteAmbientScope,
    ) -> TransportResult<()> {
        match *scope {}
    }

    async fn complete_ambient(&self, scope: SqliteAmbientScope) -> TransportResult<()> {
        match scope {}
    }

    async fn abort_ambient(&self, scope: SqliteAmbientScope) -> TransportResult<()> {
        match scope {}
    }

    async fn pop_row(
        &self,
        address: &QueueAddress,
        conn: &mut SqliteQueueConnection,
        tx: Option<&SqliteTransaction>,
    ) -> TransportResult<Option<QueueRow>> {
        Self::check_tx(conn, tx)?;
        let table = Self::table(address)?;
        let sql = format!(
            "DELETE FROM {table} WHERE seq = (SELECT seq FROM {table} ORDER BY seq LIMIT 1) \
             RETURNING id, headers, body, delivery_attempts + 1 AS delivery_attempts"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&mut conn.conn)
            .await
            .map_err(|e| Self::map_err(address, e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| TransportError::Storage(e.to_string()))?;
                let headers: String = row
                    .try_get("headers")
                    .map_err(|e| TransportError::Storage(e.to_string()))?;
                let body: Vec<u8> = row
                    .try_get("body")
                    .map_err(|e| TransportError::Storage(e.to_string()))?;
                let delivery_attempts: i64 = row
                    .try_get("delivery_attempts")
                    .map_err(|e| TransportError::Storage(e.to_string()))?;
                Ok(Some(QueueRow {
                    id,
                    headers,
                    body,
                    delivery_attempts: delivery_attempts.max(0) as u32,
                }))
            }
        }
    }

    async fn push_row(
        &self,
        address: &QueueAddress,
        row: QueueRow,
        conn: &mut SqliteQueueConnection,
        tx: Option<&SqliteTransaction>,
    ) -> TransportResult<()> {
        Self::check_tx(conn, tx)?;
        let table = Self::table(address)?;
        let sql =
            format!("INSERT INTO {table} (id, headers, body, delivery_attempts) VALUES (?, ?, ?, ?)");
        sqlx::query(&sql)
            .bind(row.id)
            .bind(row.headers)
            .bind(row.body)
            .bind(row.delivery_attempts as i64)
            .execute(&mut conn.conn)
            .await
            .map_err(|e| Self::map_err(address, e))?;
        Ok(())
    }

    async fn create_queue(&self, address: &QueueAddress) -> TransportResult<()> {
        let table = Self::table(address)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             seq INTEGER PRIMARY KEY AUTOINCREMENT, \
             id TEXT NOT NULL, \
             headers TEXT NOT NULL, \
             body BLOB NOT NULL, \
             delivery_attempts INTEGER NOT NULL DEFAULT 0)"
        );
        let mut conn = self.open_connection().await?;
        sqlx::query(&sql)
            .execute(&mut conn.conn)
            .await
            .map_err(|e| Self::map_err(address, e))?;
        Ok(())
    }

    async fn queue_len(&self, address: &QueueAddress) -> TransportResult<usize> {
        let table = Self::table(address)?;
        let sql = format!("SELECT COUNT(*) AS n FROM {table}");
        let mut conn = self.open_connection().await?;
        let row = sqlx::query(&sql)
            .fetch_one(&mut conn.conn)
            .await
            .map_err(|e| Self::map_err(address, e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn test_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::new(dir.path().join("queues.db"))
    }

    #[tokio::test]
    async fn test_push_pop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let address = QueueAddress::from("input");
        store.create_queue(&address).await.unwrap();

        let mut conn = store.open_connection().await.unwrap();
        let message = Message::new(b"payload".to_vec()).with_header("k", "v");
        let row = QueueRow::from_message(&message).unwrap();
        store.push_row(&address, row, &mut conn, None).await.unwrap();
        assert_eq!(store.queue_len(&address).await.unwrap(), 1);

        let popped = store
            .pop_row(&address, &mut conn, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id, message.id.to_string());
        assert_eq!(popped.body, b"payload");
        assert_eq!(popped.delivery_attempts, 1);
        assert_eq!(store.queue_len(&address).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let address = QueueAddress::from("input");
        store.create_queue(&address).await.unwrap();

        let mut conn = store.open_connection().await.unwrap();
        let row = QueueRow::from_message(&Message::new(b"x".to_vec())).unwrap();
        store.push_row(&address, row, &mut conn, None).await.unwrap();

        let tx = store.begin(&mut conn).await.unwrap();
        let popped = store
            .pop_row(&address, &mut conn, Some(&tx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.delivery_attempts, 1);
        store.rollback(&mut conn, tx).await.unwrap();

        assert_eq!(store.queue_len(&address).await.unwrap(), 1);

        // The increment was part of the rolled-back work: the restored row
        // pops with its original count, not an accumulated one
        let again = store
            .pop_row(&address, &mut conn, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_attempts, 1);
    }

    #[tokio::test]
    async fn test_transactional_send_not_visible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let address = QueueAddress::from("outbox");
        store.create_queue(&address).await.unwrap();

        let mut conn = store.open_connection().await.unwrap();
        let tx = store.begin(&mut conn).await.unwrap();
        let row = QueueRow::from_message(&Message::new(b"x".to_vec())).unwrap();
        store
            .push_row(&address, row, &mut conn, Some(&tx))
            .await
            .unwrap();

        store.commit(&mut conn, tx).await.unwrap();
        assert_eq!(store.queue_len(&address).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ambient_scope_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let result = store.begin_ambient().await;
        assert!(matches!(result, Err(TransportError::UnsupportedMode(_))));
    }

    #[tokio::test]
    async fn test_missing_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let mut conn = store.open_connection().await.unwrap();
        let result = store
            .pop_row(&QueueAddress::from("missing"), &mut conn, None)
            .await;
        assert!(matches!(result, Err(TransportError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let result = store
            .create_queue(&QueueAddress::from("input; DROP TABLE x"))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }
}
