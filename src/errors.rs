use thiserror::Error;

/// Top-level error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The error kinds named by the storage core's contract (spec §7).
///
/// `DuplicateKey` is a normal control-flow signal for `BTree::insert`, not a
/// fatal condition; every other variant propagates to the caller untouched.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corrupt page {page_id}: {detail}")]
    CorruptPage { page_id: u32, detail: String },

    #[error("corrupt WAL: {0}")]
    CorruptWal(String),

    #[error("corrupt free list: {0}")]
    CorruptFreeList(String),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
