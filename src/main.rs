use anyhow::Result;
use clap::Parser;

use duffel::config;
use duffel::ui;

/// Incremental mirror and offsite backups with content-addressed
/// deduplication.
#[derive(Debug, Parser)]
#[command(name = "duffel", version, verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Continually reshape a destination to match local source trees
    #[command(subcommand)]
    Mirror(ui::mirror::Command),

    /// Emit and replay chains of primary+delta backup directories
    #[command(subcommand)]
    Offsite(ui::offsite::Command),
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = config::load()?;

    match args.subcommand {
        Subcommand::Mirror(command) => ui::mirror::run(&config, command),
        Subcommand::Offsite(command) => ui::offsite::run(&config, command),
    }
}

/// Set up tracing to spit messages to stderr.
fn init_logger(verbosity: u8) {
    use tracing::Level;

    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
