//! Argument structs and drivers for each subcommand.

pub mod mirror;
pub mod offsite;
pub mod restore;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::filter::PathFilter;

/// Shown below `--help` for every command that takes a destination.
pub const DESTINATION_HELP: &str = "\
Data store destinations:

  File system: any plain path
      /backups/mirrored_content

  SFTP server:
      ftp://<user>:<password or path to private key>@<host>[:<port>][/<dir>]
      ftp://me:hunter2@my_server.com/backups
      ftp://me:/home/me/.ssh/id_rsa@my_server.com

  Fast Glacier (https://fastglacier.com/), bulk upload only:
      fast_glacier://<account>@<aws_region>[/<dir>]

  S3 Browser (https://s3browser.com/), bulk upload only:
      s3_browser://<account>@<bucket>[/<dir>]";

/// Canonicalize source paths (and make sure they're real!) before any
/// machinery spins up.
pub fn canonicalize_inputs(paths: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    paths
        .iter()
        .map(|p| {
            p.canonicalize_utf8()
                .with_context(|| format!("Couldn't canonicalize {p}"))
        })
        .collect()
}

pub fn build_filter(includes: &[String], excludes: &[String]) -> Result<Option<PathFilter>> {
    PathFilter::new(includes, excludes)
}
