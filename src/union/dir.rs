//! Merged directory listings
//!
//! Computes the union view of a directory: writable-branch entries plus
//! read-only entries, minus names masked by a whiteout, minus the marker
//! names themselves. Markers never escape to callers.

use crate::error::{Error, Result};
use crate::union::attr::FileKind;
use crate::union::branch::{is_reserved_name, Branches, WHITEOUT_PREFIX};
use crate::union::resolve::Origin;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// One visible entry in a merged listing
#[derive(Debug, Clone)]
pub struct MergedEntry {
    pub name: String,
    pub kind: FileKind,
    pub origin: Origin,
}

/// Computes merged listings and occupancy for removal checks
pub struct MergeView {
    branches: Arc<Branches>,
}

impl MergeView {
    pub fn new(branches: Arc<Branches>) -> Self {
        Self { branches }
    }

    /// Merged listing of a logical directory, sorted by name.
    ///
    /// The directory must exist on at least one branch; the caller is
    /// responsible for having resolved away whiteout-masked directories.
    pub fn read_dir(&self, logical: &Path) -> Result<Vec<MergedEntry>> {
        let logical = Branches::normalize(logical)?;
        let rw_dir = self.branches.rw_path(&logical)?;
        let ro_dir = self.branches.ro_path(&logical)?;

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut whiteouts = HashSet::new();
        let mut found_any = false;

        // Writable branch first: real entries win, markers feed the filter.
        if let Some(listing) = read_branch_dir(&rw_dir, &logical)? {
            found_any = true;
            let mut real = Vec::new();
            for (name, kind) in listing {
                if let Some(masked) = name.strip_prefix(WHITEOUT_PREFIX) {
                    whiteouts.insert(masked.to_string());
                } else if !is_reserved_name(&name) {
                    real.push((name, kind));
                }
            }
            for (name, kind) in real {
                seen.insert(name.clone());
                entries.push(MergedEntry {
                    name,
                    kind,
                    origin: Origin::Rw,
                });
            }
        }

        if let Some(listing) = read_branch_dir(&ro_dir, &logical)? {
            found_any = true;
            for (name, kind) in listing {
                // Reserved names never surface, even from a branch that
                // should not contain them.
                if is_reserved_name(&name) || whiteouts.contains(&name) || seen.contains(&name) {
                    continue;
                }
                entries.push(MergedEntry {
                    name,
                    kind,
                    origin: Origin::Ro,
                });
            }
        }

        if !found_any {
            return Err(Error::NotFound(logical));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Whether the merged view of a directory has zero visible entries.
    pub fn is_empty(&self, logical: &Path) -> Result<bool> {
        Ok(self.read_dir(logical)?.is_empty())
    }
}

/// Listing of one branch directory, `None` when absent there.
fn read_branch_dir(
    concrete: &Path,
    logical: &Path,
) -> Result<Option<Vec<(String, FileKind)>>> {
    let iter = match std::fs::read_dir(concrete) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::from_branch_io(e, logical)),
    };

    let mut listing = Vec::new();
    for entry in iter {
        let entry = entry.map_err(|e| Error::from_branch_io(e, logical))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            // Non-UTF-8 names cannot collide with markers; skip them from
            // the merged view rather than misreport them.
            Err(_) => continue,
        };
        let kind = entry
            .file_type()
            .map(FileKind::from_file_type)
            .map_err(|e| Error::from_branch_io(e, logical))?;
        listing.push((name, kind));
    }
    Ok(Some(listing))
}
