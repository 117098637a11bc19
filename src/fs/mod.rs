//! FUSE filesystem implementation
//!
//! Implements the FUSE filesystem interface, translating inode-based
//! requests into logical-path operations on the union core.

mod filesystem;
mod inode;

pub use filesystem::UnionFs;
pub use inode::{HandleTable, InodeTable};
