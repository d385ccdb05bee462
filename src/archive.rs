//! Driving 7-Zip to package offsite directories into split, optionally
//! encrypted volumes.
//!
//! The binary is discovered once per process (`7z`, then `7zz`) and the
//! result - or the failure - sticks.

use std::process::{Command, Stdio};
use std::sync::{LazyLock, OnceLock};

use anyhow::{Result, bail};
use camino::Utf8Path;
use regex::Regex;
use tracing::*;

pub const ARCHIVE_FILENAME: &str = "data.7z";

/// Volumes default to 250 MB for easier transmission.
pub const DEFAULT_ARCHIVE_VOLUME_SIZE: u64 = 250 * 1024 * 1024;

pub const MIN_ARCHIVE_VOLUME_SIZE: u64 = 1024;

static ZIP_BINARY: OnceLock<Result<&'static str, String>> = OnceLock::new();

/// The 7-Zip binary name, or a sticky error if none is on the path.
pub fn zip_binary() -> Result<&'static str> {
    let result = ZIP_BINARY.get_or_init(|| {
        for name in ["7z", "7zz"] {
            let probe = Command::new(name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if matches!(probe, Ok(status) if status.success()) {
                return Ok(name);
            }
        }
        Err("7zip is not available for compression and/or encryption; \
             please add it to the path"
            .to_owned())
    });
    match result {
        Ok(name) => Ok(*name),
        Err(e) => bail!(e.clone()),
    }
}

static PASSWORD_ARG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"-p\S+"#).unwrap());

/// Redacts `-p<password>` arguments for anything headed to a log.
pub fn scrub_password(command_line: &str) -> String {
    PASSWORD_ARG.replace_all(command_line, "-p*****").into_owned()
}

fn render(command: &Command) -> String {
    let mut line = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

fn run(mut command: Command, what: &str) -> Result<()> {
    debug!("Running: {}", scrub_password(&render(&command)));
    let output = command.output()?;
    if !output.status.success() {
        bail!(
            "{what} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Packs everything under `dir` into `data.7z.NNN` volumes inside it:
/// solid mode, UTF-8 names, AES-encrypted header when a password is given.
pub fn create(
    dir: &Utf8Path,
    compress: bool,
    password: Option<&str>,
    volume_size: u64,
) -> Result<()> {
    let level = if compress { 9 } else { 0 };

    let mut command = Command::new(zip_binary()?);
    command
        .arg("a")
        .arg("-t7z")
        .arg(format!("-mx{level}"))
        .arg("-ms=on")
        .arg("-mhe=on")
        .arg("-sccUTF-8")
        .arg("-scsUTF-8")
        .arg("-ssw")
        .arg(format!("-v{volume_size}"))
        .arg(ARCHIVE_FILENAME);
    if let Some(password) = password {
        command.arg(format!("-p{password}"));
    }
    command.current_dir(dir);

    run(command, "Archive creation")
}

/// Runs the tool's integrity check over a volume set.
pub fn verify(first_volume: &Utf8Path, password: Option<&str>) -> Result<()> {
    let mut command = Command::new(zip_binary()?);
    command.arg("t").arg(first_volume);
    if let Some(password) = password {
        command.arg(format!("-p{password}"));
    }
    run(command, "Archive validation")
}

/// Extracts a volume set into `dest`.
pub fn extract(first_volume: &Utf8Path, dest: &Utf8Path, password: Option<&str>) -> Result<()> {
    let mut command = Command::new(zip_binary()?);
    command.arg("x").arg(first_volume);
    if let Some(password) = password {
        command.arg(format!("-p{password}"));
    }
    command.current_dir(dest);

    run(command, "Archive extraction")
}
