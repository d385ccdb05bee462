use anyhow::{Result, ensure};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::archive;
use crate::config::Configuration;
use crate::offsite;

use super::{build_filter, canonicalize_inputs, restore};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Execute(ExecuteArgs),
    Commit(CommitArgs),
    Restore(restore::Args),
}

/// Prepare local changes for offsite backup and (optionally) deliver
/// them.
#[derive(Debug, Parser)]
#[command(after_help = super::DESTINATION_HELP)]
pub struct ExecuteArgs {
    /// Unique name of the backup; lets one machine keep several distinct
    /// chains.
    backup_name: String,

    /// Destination data store, or "None" to stage the run locally and
    /// ship it by hand (commit afterward!).
    destination: String,

    /// The files and directories to back up
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    /// Encrypt the archived run with this password before delivery.
    #[arg(long, name = "password")]
    encryption_password: Option<String>,

    /// Compress the run before delivery.
    #[arg(long)]
    compress: bool,

    /// Sources are on an SSD; read them in parallel.
    #[arg(long)]
    ssd: bool,

    /// Ignore the committed snapshot and reseed the chain with a new
    /// primary.
    #[arg(long)]
    force: bool,

    /// Local directory used to stage the run before delivery
    /// (default: a temp directory)
    #[arg(long)]
    working_dir: Option<Utf8PathBuf>,

    /// Split archives into volumes of this many bytes.
    #[arg(long, value_parser = parse_volume_size)]
    archive_volume_size: Option<u64>,

    /// Discard a pending snapshot instead of refusing to run.
    #[arg(long)]
    ignore_pending_snapshot: bool,

    /// Only back up files matching at least one of these regexes
    /// (can be specified multiple times)
    #[arg(long = "include", name = "include-regex")]
    includes: Vec<String>,

    /// Skip files matching any of these regexes
    /// (can be specified multiple times)
    #[arg(long = "exclude", name = "exclude-regex")]
    excludes: Vec<String>,
}

fn parse_volume_size(value: &str) -> Result<u64, String> {
    let parsed: u64 = value.parse().map_err(|e| format!("{e}"))?;
    if parsed < archive::MIN_ARCHIVE_VOLUME_SIZE {
        return Err(format!(
            "volume size must be at least {} bytes",
            archive::MIN_ARCHIVE_VOLUME_SIZE
        ));
    }
    Ok(parsed)
}

/// Mark a staged offsite run as delivered.
#[derive(Debug, Parser)]
pub struct CommitArgs {
    backup_name: String,
}

pub fn run(config: &Configuration, command: Command) -> Result<()> {
    match command {
        Command::Execute(args) => execute(config, args),
        Command::Commit(args) => offsite::commit(&args.backup_name, None),
        Command::Restore(args) => restore::run(config, args),
    }
}

fn execute(config: &Configuration, args: ExecuteArgs) -> Result<()> {
    let inputs = canonicalize_inputs(&args.inputs)?;
    let filter = build_filter(&args.includes, &args.excludes)?;

    // "None" (any casing) means stage locally, don't deliver.
    let destination = (!args.destination.eq_ignore_ascii_case("none"))
        .then_some(args.destination.as_str());

    // Held so a temp working dir outlives the run.
    let _temp_working_dir;
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => {
            ensure!(
                destination.is_some(),
                "Staging without a destination needs an explicit --working-dir \
                 (the content has to outlive this run)"
            );
            let temp = tempfile::tempdir()?;
            let path = Utf8PathBuf::from_path_buf(temp.path().to_owned())
                .map_err(|p| anyhow::anyhow!("Temp dir {} isn't UTF-8", p.display()))?;
            _temp_working_dir = temp;
            path
        }
    };

    offsite::backup(
        &args.backup_name,
        destination,
        &inputs,
        &working_dir,
        &offsite::BackupOptions {
            ssd: args.ssd || config.ssd,
            force: args.force,
            filter: filter.as_ref(),
            compress: args.compress,
            encryption_password: args.encryption_password.clone(),
            archive_volume_size: args
                .archive_volume_size
                .unwrap_or_else(|| config.archive_volume_size.as_u64()),
            ignore_pending_snapshot: args.ignore_pending_snapshot,
            state_dir: None,
        },
    )
}
