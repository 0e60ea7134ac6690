use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction mode negotiated for a unit of work, ordered by guarantee
/// strength. The ordering drives every isolation decision in the dispatcher
/// and the receive strategies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum TransactionMode {
    /// No transactional guarantee at all. Message loss or duplicate
    /// processing is possible on crash between dequeue and processing
    /// completion. Cheapest mode, best-effort only.
    None,

    /// The receive runs under a native transaction; sends issued while
    /// processing commit independently of it.
    ReceiveOnly,

    /// Sends issued while processing share the receive's native connection
    /// and transaction, committing or rolling back as one unit of work.
    #[default]
    SendsAtomicWithReceive,

    /// An ambient transaction scope coordinates the receive and any sends
    /// across separate connections.
    TransactionScope,
}

impl TransactionMode {
    /// Get the mode name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ReceiveOnly => "receive_only",
            Self::SendsAtomicWithReceive => "sends_atomic_with_receive",
            Self::TransactionScope => "transaction_scope",
        }
    }

    /// Check whether sends at this mode may join the receive's transaction
    pub fn sends_join_receive(&self) -> bool {
        *self >= Self::SendsAtomicWithReceive
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
