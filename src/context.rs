use std::fmt;

use crate::store::QueueStore;
use crate::types::TransactionMode;

/// The ambient transactional handles shared between the receive path and the
/// dispatch path for a single unit of work.
///
/// Holds at most one of {native connection + native transaction} or
/// {ambient scope handle + the receive connection}; never a native
/// transaction and an ambient scope at once. Created fresh per receive
/// attempt, read by the dispatcher during the same unit of work, and
/// discarded when the unit of work ends. Owned exclusively by one in-flight
/// unit of work; deliberately not `Clone`.
pub struct TransportTransaction<S: QueueStore> {
    mode: TransactionMode,
    connection: Option<S::Connection>,
    transaction: Option<S::Transaction>,
    ambient: Option<S::AmbientScope>,
}

impl<S: QueueStore> TransportTransaction<S> {
    /// No active transaction and no handles (mode `None`, outside any
    /// receive)
    pub fn none() -> Self {
        Self {
            mode: TransactionMode::None,
            connection: None,
            transaction: None,
            ambient: None,
        }
    }

    /// A connection with no transaction of any kind (the no-transaction
    /// receive variant)
    pub fn with_connection(mode: TransactionMode, connection: S::Connection) -> Self {
        Self {
            mode,
            connection: Some(connection),
            transaction: None,
            ambient: None,
        }
    }

    /// A native connection and transaction captured at receive time
    pub fn native(
        mode: TransactionMode,
        connection: S::Connection,
        transaction: S::Transaction,
    ) -> Self {
        Self {
            mode,
            connection: Some(connection),
            transaction: Some(transaction),
            ambient: None,
        }
    }

    /// An ambient scope plus the receive connection enlisted in it
    pub fn ambient(
        mode: TransactionMode,
        scope: S::AmbientScope,
        connection: S::Connection,
    ) -> Self {
        Self {
            mode,
            connection: Some(connection),
            transaction: None,
            ambient: Some(scope),
        }
    }

    /// The negotiated transaction mode for this unit of work
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Whether an ambient scope is coordinating this unit of work
    pub fn has_ambient(&self) -> bool {
        self.ambient.is_some()
    }

    /// The ambient scope handle, if present
    pub fn ambient_scope(&self) -> Option<&S::AmbientScope> {
        self.ambient.as_ref()
    }

    /// The native connection and transaction, if both are present
    pub fn native_parts_mut(&mut self) -> Option<(&mut S::Connection, &S::Transaction)> {
        match (self.connection.as_mut(), self.transaction.as_ref()) {
            (Some(conn), Some(tx)) => Some((conn, tx)),
            _ => None,
        }
    }

    /// The held connection, regardless of transaction kind
    pub fn connection_mut(&mut self) -> Option<&mut S::Connection> {
        self.connection.as_mut()
    }

    /// Reclaim ownership of the native connection and transaction so the
    /// receive strategy can commit or roll back
    pub fn into_native_parts(self) -> Option<(S::Connection, S::Transaction)> {
        match (self.connection, self.transaction) {
            (Some(conn), Some(tx)) => Some((conn, tx)),
            _ => None,
        }
    }
}

impl<S: QueueStore> fmt::Debug for TransportTransaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportTransaction")
            .field("mode", &self.mode)
            .field("connection", &self.connection.is_some())
            .field("transaction", &self.transaction.is_some())
            .field("ambient", &self.ambient.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::QueueStore;

    #[tokio::test]
    async fn test_native_context_holds_no_ambient() {
        let store = MemoryStore::new();
        let mut conn = store.open_connection().await.unwrap();
        let tx = store.begin(&mut conn).await.unwrap();

        let mut context = TransportTransaction::<MemoryStore>::native(
            TransactionMode::SendsAtomicWithReceive,
            conn,
            tx,
        );
        assert!(!context.has_ambient());
        assert!(context.native_parts_mut().is_some());

        let (mut conn, tx) = context.into_native_parts().unwrap();
        store.rollback(&mut conn, tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_ambient_context_holds_no_native_transaction() {
        let store = MemoryStore::new();
        let scope = store.begin_ambient().await.unwrap();
        let mut conn = store.open_connection().await.unwrap();
        store.enlist(&mut conn, &scope).await.unwrap();

        let mut context = TransportTransaction::<MemoryStore>::ambient(
            TransactionMode::TransactionScope,
            scope,
            conn,
        );
        assert!(context.has_ambient());
        assert!(context.native_parts_mut().is_none());
        assert!(context.connection_mut().is_some());
    }

    #[test]
    fn test_empty_context() {
        let mut context = TransportTransaction::<MemoryStore>::none();
        assert_eq!(context.mode(), TransactionMode::None);
        assert!(!context.has_ambient());
        assert!(context.native_parts_mut().is_none());
        assert!(context.connection_mut().is_none());
    }
}
