pub mod address;
pub mod ids;
pub mod message;
pub mod mode;
pub mod operation;

pub use address::QueueAddress;
pub use ids::MessageId;
pub use message::Message;
pub use mode::TransactionMode;
pub use operation::{OperationSet, QueuedOperation};
