pub mod btree;
pub mod header_page;
pub mod internal_page;
pub mod iterator;
pub mod key;
pub mod leaf_page;
mod tree_page;

pub use btree::BPlusTree;
pub use header_page::{HeaderPage, HeaderPageRef};
pub use internal_page::{InternalPage, InternalPageRef};
pub use iterator::TreeIterator;
pub use key::IndexKey;
pub use leaf_page::{LeafDelete, LeafInsert, LeafPage, LeafPageRef};
pub use tree_page::{page_type, PageType};
