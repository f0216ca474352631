//! A disk-backed B+-tree index mapping variable-length string keys to
//! fixed-size record ids.
//!
//! Keys are NUL-free byte strings of up to 127 bytes, kept in order on
//! 1024-byte slotted pages; a key inserted several times keeps all of its
//! record ids, unordered, in one record. The tree supports point lookups
//! via degenerate range scans, forward range scans over a doubly-linked
//! leaf chain, scan-driven deletion, and destruction of the whole index.
//!
//! Pages live in a single store file with a free-page bitmap and a named
//! file directory, and every page access goes through a pin/unpin buffer
//! manager with clock replacement.

mod errors;
mod storage;
mod tree;

pub use errors::{BufferError, PageError, StoreError, TreeError};
pub use storage::buffer::{BufferManager, BufferStats, PinnedPage, DEFAULT_POOL_SIZE};
pub use storage::disk::{DiskManager, DEFAULT_NUM_PAGES, MAX_NAME};
pub use storage::{PageId, INVALID_PAGE, PAGE_SIZE};
pub use tree::cursor::PageCursor;
pub use tree::node::{
    FindResult, NodeValue, PageKind, RecordId, SortedPage, DATA_SIZE, MAX_KEY_LENGTH,
};
pub use tree::scan::TreeScan;
pub use tree::BTree;
