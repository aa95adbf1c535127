pub mod btree;
pub mod errors;
pub mod file_header;
pub mod index_key;
pub mod page;
pub mod pager;
pub mod slotted_page;
pub mod wal;

pub use crate::btree::{BTree, Node, BTREE_MIN_KEYS, BTREE_ORDER};
pub use crate::errors::{Error, Result, StorageError};
pub use crate::file_header::{FileHeader, MetaField, FILE_HEADER_SIZE, FILE_MAGIC, FILE_VERSION};
pub use crate::page::{Page, PageType, INVALID_PAGE_ID, MAX_PAGE_DATA, PAGE_HEADER_SIZE, PAGE_SIZE};
pub use crate::pager::{Pager, PagerOptions, DEFAULT_CACHE_SIZE};
pub use crate::slotted_page::{CompactMap, SlottedPage, SlottedPageError, SLOT_FLAG_DELETED};
pub use crate::wal::{Wal, WalRecord, WalRecordType};
