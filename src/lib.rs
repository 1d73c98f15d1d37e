//! Silo - the disk-oriented core of a storage engine
//!
//! This crate provides the two tightly coupled subsystems at the bottom of
//! a database: a buffer pool that caches fixed-size pages in memory, and
//! an on-disk B+ tree index built on top of it. The tree never touches
//! disk directly; every node access goes through page guards handed out by
//! the pool, and all concurrency is expressed as acquisition and release
//! of those guards.
//!
//! # Architecture
//!
//! - **Disk layer** (`storage::disk`): page-granular file I/O
//!   - `DiskManager`: reads and writes pages to/from the database file
//!   - `DiskScheduler`: background worker processing I/O requests in FIFO
//!     order per page
//!
//! - **Buffer pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: maps page ids to frames, loads and evicts
//!   - `ArcReplacer`: Adaptive Replacement Cache eviction policy
//!   - `FrameHeader`: per-frame metadata and page bytes
//!   - `ReadPageGuard`/`WritePageGuard`: RAII guards bundling the frame
//!     latch, a pin, and dirty tracking
//!
//! - **Index** (`index`): a concurrent B+ tree with bounded tombstone
//!   buffers in its leaves
//!   - `BPlusTree`: insert / remove / point lookup / ordered iteration
//!   - `TreeIterator`: forward iterator over live entries
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use silo::buffer::BufferPoolManager;
//! use silo::common::{PageId, RecordId, SlotId};
//! use silo::index::BPlusTree;
//! use silo::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//!
//! // A header page anchors the tree; 0 tombstones per leaf means eager
//! // deletion.
//! let header_pid = bpm.new_page().unwrap().unwrap();
//! let tree = BPlusTree::<u64, 2>::new(Arc::clone(&bpm), header_pid, 128, 128).unwrap();
//!
//! tree.insert(42, RecordId::new(PageId::new(1), SlotId::new(0))).unwrap();
//! assert_eq!(tree.get_value(&42).unwrap().len(), 1);
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SiloError, SlotId};
