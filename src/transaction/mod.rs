pub mod concurrency;
pub mod transaction;
pub mod transaction_manager;

pub use concurrency::{LockManager, LockMode};
pub use transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
pub use transaction_manager::TransactionManager;
