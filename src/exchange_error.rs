//! ExchangeError: unified error type for meshcomm public APIs
//!
//! Every detected violation ends the transfer that detected it. Partition and
//! planning errors are raised locally before anything is posted to the
//! communicator; communication errors are raised only after every outstanding
//! handle has been drained.

use thiserror::Error;

/// Unified error type for partition indexing, planning and data exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// A global index was assigned to a process outside `[0, nb_partitions)`.
    #[error("invalid partition: global index {global} assigned to rank {rank}, but only {nb_partitions} partitions exist")]
    InvalidPartition {
        global: usize,
        rank: usize,
        nb_partitions: usize,
    },
    /// The per-process counts declared by a distribution disagree with its assignment.
    #[error("invalid partition: rank {rank} declares {expected} points but is assigned {found}")]
    PartitionCountMismatch {
        rank: usize,
        expected: usize,
        found: usize,
    },
    /// The communicator group does not match the partition index.
    #[error("communicator has {comm_size} ranks, partition index has {nb_partitions}")]
    CommunicatorMismatch {
        comm_size: usize,
        nb_partitions: usize,
    },
    /// Local and global field lists differ in length.
    #[error("field count mismatch: {local} local fields vs {global} global fields")]
    FieldCountMismatch { local: usize, global: usize },
    /// A field's element count or element byte size is inconsistent with the transfer.
    #[error("size mismatch in field {field}: {what} expected {expected}, found {found}")]
    SizeMismatch {
        field: usize,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    /// A field names an owner rank outside the communicator.
    #[error("field {field} names owner rank {owner}, but only {nb_partitions} ranks exist")]
    InvalidOwner {
        field: usize,
        owner: usize,
        nb_partitions: usize,
    },
    /// Attempted to write through a shared (read-only) field view.
    #[error("field view {field} is read-only")]
    ReadOnlyView { field: usize },
    /// An array shape cannot be erased into `[element, byte]` views.
    #[error("invalid array shape: {0}")]
    InvalidShape(String),
    /// Halo connectivity lists are inconsistent.
    #[error("invalid halo connectivity: {0}")]
    InvalidHalo(String),
    /// Element or entry index outside a view.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    /// A peer message was missing or did not have the planned length.
    #[error("communication with rank {peer} failed: {reason}")]
    CommunicationFailure { peer: usize, reason: String },
}
