use anyhow::{Result, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::*;

use crate::config::Configuration;
use crate::diff::DiffOp;
use crate::hashing::NOT_CALCULATED;
use crate::mirror::{self, ValidateType};

use super::{build_filter, canonicalize_inputs};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Backup(BackupArgs),
    Cleanup(CleanupArgs),
    Validate(ValidateArgs),
}

/// Mirror local files and directories to a destination data store.
#[derive(Debug, Parser)]
#[command(after_help = super::DESTINATION_HELP)]
pub struct BackupArgs {
    /// Destination data store (a local path, or an ftp:// URL)
    destination: String,

    /// The files and directories to mirror
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    /// Sources are on an SSD; read them in parallel.
    #[arg(long)]
    ssd: bool,

    /// Ignore any committed snapshot and replace the destination
    /// wholesale.
    #[arg(long)]
    force: bool,

    /// Only mirror files matching at least one of these regexes
    /// (can be specified multiple times)
    #[arg(long = "include", name = "include-regex")]
    includes: Vec<String>,

    /// Skip files matching any of these regexes
    /// (can be specified multiple times)
    #[arg(long = "exclude", name = "exclude-regex")]
    excludes: Vec<String>,
}

/// Revert a destination left partially committed by an interrupted backup.
#[derive(Debug, Parser)]
pub struct CleanupArgs {
    destination: String,
}

/// Compare a destination's content against its committed snapshot.
#[derive(Debug, Parser)]
pub struct ValidateArgs {
    destination: String,

    /// Validate hashes too, not just names and sizes.
    #[arg(long)]
    complete: bool,

    /// The destination is on an SSD; scan it in parallel.
    #[arg(long)]
    ssd: bool,
}

pub fn run(config: &Configuration, command: Command) -> Result<()> {
    match command {
        Command::Backup(args) => backup(config, args),
        Command::Cleanup(args) => mirror::cleanup(&args.destination),
        Command::Validate(args) => validate(args),
    }
}

fn backup(config: &Configuration, args: BackupArgs) -> Result<()> {
    let inputs = canonicalize_inputs(&args.inputs)?;
    let filter = build_filter(&args.includes, &args.excludes)?;

    mirror::backup(
        &args.destination,
        &inputs,
        &mirror::BackupOptions {
            ssd: args.ssd || config.ssd,
            force: args.force,
            filter: filter.as_ref(),
        },
    )
}

fn validate(args: ValidateArgs) -> Result<()> {
    let validate_type = if args.complete {
        ValidateType::Complete
    } else {
        ValidateType::Standard
    };

    let discrepancies = mirror::validate(&args.destination, validate_type, args.ssd)?;
    if discrepancies.is_empty() {
        info!("No differences were found");
        return Ok(());
    }

    for diff in &discrepancies {
        match diff.op {
            DiffOp::Add => error!("{} has been added", diff.path),
            DiffOp::Remove => error!("{} has been removed", diff.path),
            DiffOp::Modify => {
                let this = diff.this.as_ref().unwrap();
                let other = diff.other.as_ref().unwrap();
                warn!(
                    "{} has been modified: expected {} bytes, found {}",
                    diff.path,
                    other.file_size().unwrap_or(0),
                    this.file_size().unwrap_or(0),
                );
                if this.file_hash() != Some(NOT_CALCULATED) {
                    warn!(
                        "  expected hash {}, found {}",
                        other.file_hash().unwrap_or("?"),
                        this.file_hash().unwrap_or("?"),
                    );
                }
            }
        }
    }
    bail!("{} differences found", discrepancies.len());
}
