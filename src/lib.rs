//! duofs - two-branch union filesystem
//!
//! This library merges a read-only branch and a read-write branch into a
//! single logical tree exposed over FUSE. Writes never touch the read-only
//! branch: deletions become whiteouts, attribute changes become override
//! records, and content changes copy the entry up into the writable branch.

pub mod config;
pub mod error;
pub mod fs;
pub mod union;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::union::{Caller, Origin, Union};
}
