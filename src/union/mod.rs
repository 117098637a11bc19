//! Union core for duofs
//!
//! Merges a read-only branch and a read-write branch into one logical
//! tree:
//! - Deletions of read-only entries become `.wh.` whiteout tombstones
//! - Attribute-only changes become `.me.` metadata-override records
//! - Content mutations trigger lazy copy-up into the writable branch
//! - Directory listings are the filtered union of both branches

mod access;
mod attr;
mod branch;
mod copyup;
mod dir;
mod elevate;
mod engine;
mod locks;
mod meta;
mod resolve;
mod whiteout;

pub use access::{AccessGate, Caller};
pub use attr::{AttrChanges, FileAttributes, FileKind, TimeChange, Timestamp};
pub use branch::{is_reserved_name, Branches, COPYUP_PREFIX, OVERRIDE_PREFIX, WHITEOUT_PREFIX};
pub use copyup::CopyUpEngine;
pub use dir::{MergeView, MergedEntry};
pub use elevate::ElevatedScope;
pub use engine::Union;
pub use locks::PathLocks;
pub use meta::{OverrideManager, OverrideRecord};
pub use resolve::{Origin, PathResolver, Resolution};
pub use whiteout::WhiteoutManager;
