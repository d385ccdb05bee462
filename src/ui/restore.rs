use anyhow::{Result, anyhow};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::Configuration;
use crate::restore;

/// Rebuild a tree from an offsite chain (the latest primary plus its
/// deltas).
#[derive(Debug, Parser)]
#[command(after_help = super::DESTINATION_HELP)]
pub struct Args {
    /// Name of the backup to restore
    backup_name: String,

    /// Data store holding the chain (a local path, or an ftp:// URL)
    source: String,

    /// Password the chain's archives were encrypted with.
    #[arg(long, name = "password")]
    encryption_password: Option<String>,

    /// Local directory for transferred and decompressed content
    /// (default: a temp directory)
    #[arg(long)]
    working_dir: Option<Utf8PathBuf>,

    /// Rewrite restored paths: any instruction path containing the text
    /// before the '=' has it replaced with the text after
    /// (can be specified multiple times)
    #[arg(long = "substitute", name = "old=new")]
    substitutions: Vec<String>,

    /// Print the instruction tables and change nothing.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Replace files that already exist at the restored paths.
    #[arg(long)]
    overwrite: bool,

    /// Keep going past per-instruction errors.
    #[arg(long)]
    continue_on_errors: bool,

    /// The chain and target are on an SSD; stage entries in parallel.
    #[arg(long)]
    ssd: bool,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let substitutions = args
        .substitutions
        .iter()
        .map(|s| {
            s.split_once('=')
                .map(|(from, to)| (from.to_owned(), to.to_owned()))
                .ok_or_else(|| anyhow!("'{s}' is not of the form old=new"))
        })
        .collect::<Result<Vec<_>>>()?;

    // Held so a temp working dir outlives the run.
    let _temp_working_dir;
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => {
            let temp = tempfile::tempdir()?;
            let path = Utf8PathBuf::from_path_buf(temp.path().to_owned())
                .map_err(|p| anyhow!("Temp dir {} isn't UTF-8", p.display()))?;
            _temp_working_dir = temp;
            path
        }
    };

    restore::restore(
        &args.backup_name,
        &args.source,
        args.encryption_password.as_deref(),
        &working_dir,
        &substitutions,
        &restore::RestoreOptions {
            ssd: args.ssd || config.ssd,
            dry_run: args.dry_run,
            overwrite: args.overwrite,
            continue_on_errors: args.continue_on_errors,
        },
    )
}
