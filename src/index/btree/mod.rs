pub mod codec;
pub mod error;
pub mod iterator;
pub mod node;
pub mod tree;

pub use codec::{deserialize_node, serialize_node, default_btree_order};
pub use error::BTreeError;
pub use iterator::TreeIterator;
pub use node::BTreeNode;
pub use tree::BPlusTree;
