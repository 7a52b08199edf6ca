use thiserror::Error;

use crate::metadata::{Pointer, Version};

/// Errors returned by [`State`](crate::State) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The resource doesn't exist.
    #[error("resource {0} doesn't exist")]
    NotFound(Pointer),
    /// A resource with the same pointer already exists.
    #[error("resource {0} already exists")]
    AlreadyExists(Pointer),
    /// The caller's view of the resource is stale.
    #[error("resource {pointer} version conflict: expected {expected}, found {found}")]
    ConflictVersion {
        /// The resource which was being mutated.
        pointer: Pointer,
        /// Version the caller expected.
        expected: Version,
        /// Version currently committed.
        found: Version,
    },
    /// The resource still has finalizers, it was moved to tearing down instead.
    #[error("resource {0} has pending finalizers")]
    HasFinalizers(Pointer),
    /// The caller doesn't own the resource it tried to mutate.
    #[error("resource {pointer} is owned by {owner:?}, mutation requested by {requested:?}")]
    OwnerConflict {
        /// The resource which was being mutated.
        pointer: Pointer,
        /// Current owner.
        owner: String,
        /// Owner presented by the caller.
        requested: String,
    },
    /// A watch subscriber fell behind and missed events.
    #[error("watch subscriber fell behind by {0} events")]
    Overflow(u64),
    /// The stored spec couldn't be converted to or from its typed form.
    #[error("resource {pointer} spec conversion failed: {message}")]
    Serialization {
        /// The resource being converted.
        pointer: Pointer,
        /// The underlying serde error.
        message: String,
    },
}

impl Error {
    /// Returns true if this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if this is a [`Error::ConflictVersion`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConflictVersion { .. })
    }
}

/// Result type used by the store.
pub type Result<T> = std::result::Result<T, Error>;
