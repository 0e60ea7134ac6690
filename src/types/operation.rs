use std::collections::hash_set;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use super::{Message, QueueAddress};

/// A destination queue address paired with a message to be sent there.
///
/// Identity is the (address, message id) pair: two operations carrying the
/// same message to the same destination are the same operation.
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    /// Destination queue
    pub address: QueueAddress,

    /// Message to send
    pub message: Message,
}

impl QueuedOperation {
    /// Create a new queued operation
    pub fn new(address: QueueAddress, message: Message) -> Self {
        Self { address, message }
    }
}

impl PartialEq for QueuedOperation {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.message.id == other.message.id
    }
}

impl Eq for QueuedOperation {}

impl Hash for QueuedOperation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.message.id.hash(state);
    }
}

/// The set of outgoing operations produced by one unit of work.
///
/// Duplicate (address, message id) pairs coalesce; uniqueness of the pairs is
/// an invariant of the outgoing batch.
#[derive(Debug, Clone, Default)]
pub struct OperationSet {
    ops: HashSet<QueuedOperation>,
}

impl OperationSet {
    /// Create an empty operation set
    pub fn new() -> Self {
        Self {
            ops: HashSet::new(),
        }
    }

    /// Insert an operation; returns false if an identical operation was
    /// already present
    pub fn insert(&mut self, operation: QueuedOperation) -> bool {
        self.ops.insert(operation)
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of distinct operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Iterate over the operations
    pub fn iter(&self) -> hash_set::Iter<'_, QueuedOperation> {
        self.ops.iter()
    }
}

impl FromIterator<QueuedOperation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = QueuedOperation>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a OperationSet {
    type Item = &'a QueuedOperation;
    type IntoIter = hash_set::Iter<'a, QueuedOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
