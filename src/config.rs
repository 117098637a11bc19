//! Configuration management for duofs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Branch roots
    pub branches: BranchSpec,

    /// Mount configuration
    pub mount: MountConfig,
}

/// The two branch roots of the union
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Read-write branch root
    pub rw: PathBuf,

    /// Read-only branch root
    pub ro: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/duofs"),
            allow_other: false,
            allow_root: false,
        }
    }
}

impl BranchSpec {
    /// Parse a branch argument of the form `<path>[=RO|=RW]:<path>[=RO|=RW]`.
    ///
    /// An untyped side takes whichever role is left; two untyped sides
    /// default to read-only first, read-write second.
    pub fn parse(arg: &str) -> Result<Self> {
        let (first, second) = arg.split_once(':').ok_or_else(|| {
            Error::Config(format!("expected two branches separated by ':': {}", arg))
        })?;

        let (first_path, first_role) = split_role(first)?;
        let (second_path, second_role) = split_role(second)?;

        let (rw, ro) = match (first_role, second_role) {
            (Some(Role::Rw), Some(Role::Rw)) | (Some(Role::Ro), Some(Role::Ro)) => {
                return Err(Error::Config(format!(
                    "need exactly one read-write and one read-only branch: {}",
                    arg
                )))
            }
            (Some(Role::Rw), _) | (None, Some(Role::Ro)) => (first_path, second_path),
            (Some(Role::Ro), _) | (None, Some(Role::Rw)) => (second_path, first_path),
            // Untyped defaults to RO:RW.
            (None, None) => (second_path, first_path),
        };

        Ok(BranchSpec { rw, ro })
    }
}

/// Branch role marker in the mount argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Rw,
    Ro,
}

fn split_role(part: &str) -> Result<(PathBuf, Option<Role>)> {
    let (raw, role) = match part.split_once('=') {
        Some((path, "RW")) => (path, Some(Role::Rw)),
        Some((path, "RO")) => (path, Some(Role::Ro)),
        Some((_, other)) => {
            return Err(Error::Config(format!("unknown branch type: {}", other)))
        }
        None => (part, None),
    };

    if !raw.starts_with('/') {
        return Err(Error::Config(format!(
            "branch path must be absolute: {}",
            raw
        )));
    }

    let trimmed = raw.trim_end_matches('/');
    let path = if trimmed.is_empty() { "/" } else { trimmed };
    Ok((PathBuf::from(path), role))
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.branches.rw == self.branches.ro {
            return Err(Error::Config(
                "read-write and read-only branches must differ".to_string(),
            ));
        }
        if self.branches.rw.starts_with(&self.branches.ro)
            || self.branches.ro.starts_with(&self.branches.rw)
        {
            return Err(Error::Config(
                "branches must not nest inside each other".to_string(),
            ));
        }
        Ok(())
    }
}
