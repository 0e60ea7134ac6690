use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::store::{QueueRow, QueueStore};
use crate::types::QueueAddress;

/// Work buffered by an uncommitted transaction or ambient scope
#[derive(Default)]
struct Staged {
    sends: Vec<(QueueAddress, QueueRow)>,
    popped: Vec<(QueueAddress, QueueRow)>,
}

struct Inner {
    /// Queue tables: address -> visible rows in order
    tables: Mutex<HashMap<QueueAddress, VecDeque<QueueRow>>>,

    /// Live ambient scopes and their buffered work
    ambients: Mutex<HashMap<u64, Staged>>,

    /// Transaction and scope id source
    next_id: AtomicU64,
}

/// In-memory store with full transactional semantics, used for tests,
/// development and as the reference behavior for SQL-backed stores.
///
/// Rows popped inside an uncommitted transaction are invisible to every
/// other connection. Rolling back restores them with their incremented
/// delivery-attempt count (companion-counter bookkeeping), so a message that
/// keeps failing mid-flight eventually trips the poison budget.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

/// Connection into a [`MemoryStore`]. Owned exclusively by one unit of work.
pub struct MemoryConnection {
    inner: Arc<Inner>,
    tx: Option<TxState>,
    ambient: Option<u64>,
}

struct TxState {
    id: u64,
    staged: Staged,
}

/// Token pairing a `begin` with its commit or rollback
pub struct MemoryTransaction {
    id: u64,
}

/// Handle to a live ambient scope
#[derive(Debug, Clone, Copy)]
pub struct MemoryAmbientScope {
    id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(HashMap::new()),
                ambients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Verify that the caller-supplied token matches the connection's
    /// transactional state
    fn check_tx(
        conn: &MemoryConnection,
        tx: Option<&MemoryTransaction>,
    ) -> TransportResult<()> {
        match (tx, conn.tx.as_ref()) {
            (None, None) => Ok(()),
            (Some(token), Some(state)) if token.id == state.id => Ok(()),
            (Some(_), _) => Err(TransportError::InvalidTransactionState(
                "transaction token does not match this connection",
            )),
            (None, Some(_)) => Err(TransportError::InvalidTransactionState(
                "connection has an open transaction; operations must pass its token",
            )),
        }
    }

    /// Apply buffered sends to the shared tables
    fn apply_staged(&self, staged: Staged) -> TransportResult<()> {
        let mut tables = self.inner.tables.lock();
        for (address, row) in staged.sends {
            let queue = tables
                .get_mut(&address)
                .ok_or_else(|| TransportError::QueueNotFound(address.to_string()))?;
            queue.push_back(row);
        }
        // Popped rows are gone for good once the work commits
        Ok(())
    }

    /// Restore popped rows to the front of their queues, discarding buffered
    /// sends
    fn restore_staged(&self, staged: Staged) -> TransportResult<()> {
        let mut tables = self.inner.tables.lock();
        for (address, row) in staged.popped.into_iter().rev() {
            let queue = tables
                .get_mut(&address)
                .ok_or_else(|| TransportError::QueueNotFound(address.to_string()))?;
            queue.push_front(row);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    type Connection = MemoryConnection;
    type Transaction = MemoryTransaction;
    type AmbientScope = MemoryAmbientScope;

    async fn open_connection(&self) -> TransportResult<MemoryConnection> {
        Ok(MemoryConnection {
            inner: self.inner.clone(),
            tx: None,
            ambient: None,
        })
    }

    async fn begin(&self, conn: &mut MemoryConnection) -> TransportResult<MemoryTransaction> {
        if conn.tx.is_some() {
            return Err(TransportError::InvalidTransactionState(
                "a transaction is already open on this connection",
            ));
        }
        if conn.ambient.is_some() {
            return Err(TransportError::InvalidTransactionState(
                "connection is enlisted in an ambient scope",
            ));
        }
        let id = self.next_id();
        conn.tx = Some(TxState {
            id,
            staged: Staged::default(),
        });
        Ok(MemoryTransaction { id })
    }

    async fn commit(
        &self,
        conn: &mut MemoryConnection,
        tx: MemoryTransaction,
    ) -> TransportResult<()> {
        let state = conn.tx.take().ok_or(TransportError::InvalidTransactionState(
            "no open transaction to commit",
        ))?;
        if state.id != tx.id {
            conn.tx = Some(state);
            return Err(TransportError::InvalidTransactionState(
                "transaction token does not match this connection",
            ));
        }
        self.apply_staged(state.staged)
    }

    async fn rollback(
        &self,
        conn: &mut MemoryConnection,
        tx: MemoryTransaction,
    ) -> TransportResult<()> {
        let state = conn.tx.take().ok_or(TransportError::InvalidTransactionState(
            "no open transaction to roll back",
        ))?;
        if state.id != tx.id {
            conn.tx = Some(state);
            return Err(TransportError::InvalidTransactionState(
                "transaction token does not match this connection",
            ));
        }
        self.restore_staged(state.staged)
    }

    async fn begin_ambient(&self) -> TransportResult<MemoryAmbientScope> {
        let id = self.next_id();
        self.inner.ambients.lock().insert(id, Staged::default());
        debug!(scope = id, "Opened ambient scope");
        Ok(MemoryAmbientScope { id })
    }

    async fn enlist(
        &self,
        conn: &mut MemoryConnection,
        scope: &MemoryAmbientScope,
    ) -> TransportResult<()> {
        if conn.tx.is_some() {
            return Err(TransportError::InvalidTransactionState(
                "connection with an open transaction cannot enlist in an ambient scope",
            ));
        }
        if !self.inner.ambients.lock().contains_key(&scope.id) {
            return Err(TransportError::InvalidTransactionState(
                "ambient scope is no longer active",
            ));
        }
        conn.ambient = Some(scope.id);
        Ok(())
    }

    async fn complete_ambient(&self, scope: MemoryAmbientScope) -> TransportResult<()> {
        let staged = self
            .inner
            .ambients
            .lock()
            .remove(&scope.id)
            .ok_or(TransportError::InvalidTransactionState(
                "ambient scope is no longer active",
            ))?;
        debug!(scope = scope.id, "Completing ambient scope");
        self.apply_staged(staged)
    }

    async fn abort_ambient(&self, scope: MemoryAmbientScope) -> TransportResult<()> {
        let staged = self
            .inner
            .ambients
            .lock()
            .remove(&scope.id)
            .ok_or(TransportError::InvalidTransactionState(
                "ambient scope is no longer active",
            ))?;
        debug!(scope = scope.id, "Aborting ambient scope");
        self.restore_staged(staged)
    }

    async fn pop_row(
        &self,
        address: &QueueAddress,
        conn: &mut MemoryConnection,
        tx: Option<&MemoryTransaction>,
    ) -> TransportResult<Option<QueueRow>> {
        Self::check_tx(conn, tx)?;

        let row = {
            let mut tables = self.inner.tables.lock();
            let queue = tables
                .get_mut(address)
                .ok_or_else(|| TransportError::QueueNotFound(address.to_string()))?;
            match queue.pop_front() {
                Some(mut row) => {
                    row.delivery_attempts += 1;
                    row
                }
                None => return Ok(None),
            }
        };

        if let Some(state) = conn.tx.as_mut() {
            state.staged.popped.push((address.clone(), row.clone()));
        } else if let Some(scope_id) = conn.ambient {
            let mut ambients = self.inner.ambients.lock();
            let staged = ambients
                .get_mut(&scope_id)
                .ok_or(TransportError::InvalidTransactionState(
                    "ambient scope is no longer active",
                ))?;
            staged.popped.push((address.clone(), row.clone()));
        }

        Ok(Some(row))
    }

    async fn push_row(
        &self,
        address: &QueueAddress,
        row: QueueRow,
        conn: &mut MemoryConnection,
        tx: Option<&MemoryTransaction>,
    ) -> TransportResult<()> {
        Self::check_tx(conn, tx)?;

        if !self.inner.tables.lock().contains_key(address) {
            return Err(TransportError::QueueNotFound(address.to_string()));
        }

        if let Some(state) = conn.tx.as_mut() {
            state.staged.sends.push((address.clone(), row));
            return Ok(());
        }
        if let Some(scope_id) = conn.ambient {
            let mut ambients = self.inner.ambients.lock();
            let staged = ambients
                .get_mut(&scope_id)
                .ok_or(TransportError::InvalidTransactionState(
                    "ambient scope is no longer active",
                ))?;
            staged.sends.push((address.clone(), row));
            return Ok(());
        }

        let mut tables = self.inner.tables.lock();
        let queue = tables
            .get_mut(address)
            .ok_or_else(|| TransportError::QueueNotFound(address.to_string()))?;
        queue.push_back(row);
        Ok(())
    }

    async fn create_queue(&self, address: &QueueAddress) -> TransportResult<()> {
        self.inner.tables.lock().entry(address.clone()).or_default();
        Ok(())
    }

    async fn queue_len(&self, address: &QueueAddress) -> TransportResult<usize> {
        self.inner
            .tables
            .lock()
            .get(address)
            .map(|q| q.len())
            .ok_or_else(|| TransportError::QueueNotFound(address.to_string()))
    }
}
