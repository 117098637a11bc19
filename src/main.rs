//! duofs - two-branch union filesystem
//!
//! Usage:
//!   duofs mount <branches> <mount_point>  - Mount a union
//!   duofs check <branches>                - Validate a branch specification
//!
//! Branches are given as `<path>[=RO|=RW]:<path>[=RO|=RW]`, for example
//! `/srv/base=RO:/srv/changes=RW`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use duofs::{
    config::{BranchSpec, Config, MountConfig},
    fs::UnionFs,
    union::Union,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "duofs")]
#[command(author = "duofs Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Two-branch union filesystem over FUSE")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a union of two branches
    Mount {
        /// Branch specification: `<path>[=RO|=RW]:<path>[=RO|=RW]`
        branches: String,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Allow root to access the mount
        #[arg(long)]
        allow_root: bool,
    },

    /// Validate a branch specification without mounting
    Check {
        /// Branch specification: `<path>[=RO|=RW]:<path>[=RO|=RW]`
        branches: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to initialize logging")?;

    match cli.command {
        Commands::Mount {
            branches,
            mount_point,
            allow_other,
            allow_root,
        } => {
            let spec = BranchSpec::parse(&branches)?;
            let config = Config {
                branches: spec,
                mount: MountConfig {
                    mount_point: mount_point.clone(),
                    allow_other,
                    allow_root,
                },
            };
            config.validate()?;

            let union = Union::new(config.branches.rw.clone(), config.branches.ro.clone())?;
            info!(
                rw = %config.branches.rw.display(),
                ro = %config.branches.ro.display(),
                mount = %mount_point.display(),
                "mounting union"
            );

            let mut options = vec![
                fuser::MountOption::FSName("duofs".to_string()),
                fuser::MountOption::DefaultPermissions,
            ];
            if allow_other {
                options.push(fuser::MountOption::AllowOther);
            }
            if allow_root {
                options.push(fuser::MountOption::AllowRoot);
            }

            fuser::mount2(UnionFs::new(union), &mount_point, &options)
                .context("mount failed")?;
        }

        Commands::Check { branches } => {
            let spec = BranchSpec::parse(&branches)?;
            Union::new(spec.rw.clone(), spec.ro.clone())?;
            info!(
                rw = %spec.rw.display(),
                ro = %spec.ro.display(),
                "branch specification is valid"
            );
        }
    }

    Ok(())
}
