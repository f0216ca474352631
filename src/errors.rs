use thiserror::Error;

use crate::storage::PageId;

/// Errors raised by the sorted key-multivalue page format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("page full")]
    Full,

    #[error("key or value not found")]
    NotFound,

    #[error("invalid slot {0}")]
    InvalidSlot(i32),

    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("page corrupt: {0}")]
    Corrupt(String),
}

/// Errors raised by the paged store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store full")]
    Full,

    #[error("duplicate file entry: {0}")]
    DuplicateEntry(String),

    #[error("unknown file entry: {0}")]
    UnknownEntry(String),

    #[error("file entry name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("bad page id: {0}")]
    BadPage(PageId),

    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// Errors raised by the buffer manager.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("buffer pool exhausted: every frame is pinned")]
    PoolExhausted,

    #[error("page {0} is not resident")]
    NotResident(PageId),

    #[error("pin count underflow on page {0}")]
    PinUnderflow(PageId),

    #[error("page {0} is still pinned")]
    StillPinned(PageId),
}

/// Top-level error type of the index.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("scan has not returned an entry")]
    ScanNotStarted,
}

impl From<StoreError> for TreeError {
    fn from(e: StoreError) -> Self {
        TreeError::Buffer(BufferError::Store(e))
    }
}
