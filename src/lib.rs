// Export public modules
pub mod common;
pub mod storage;
pub mod index;
pub mod transaction;

// Re-export key items for convenient access
pub use storage::buffer::{BufferPoolManager, BufferPoolError, ShardedBufferPool};
pub use storage::disk::DiskManager;
pub use index::btree::{BPlusTree, BTreeError};
pub use transaction::{
    IsolationLevel, LockManager, Transaction, TransactionError, TransactionManager,
};
