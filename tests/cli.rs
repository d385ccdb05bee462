use std::fs;

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

mod common;
use common::*;

fn cli() -> Command {
    Command::cargo_bin(env!("CARGO_PKG_NAME")).expect("binary builds")
}

#[test]
fn help_lists_both_modes() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mirror").and(predicate::str::contains("offsite")));
}

#[test]
fn mirror_round_trip() -> Result<()> {
    let source_dir = tempdir()?;
    let dest_dir = tempdir()?;
    let source = utf8(source_dir.path()).join("source");
    let dest = utf8(dest_dir.path()).join("dest");
    build_source_tree(&source)?;

    cli()
        .args(["-v", "mirror", "backup"])
        .arg(dest.as_str())
        .arg(source.as_str())
        .assert()
        .success();

    cli()
        .args(["mirror", "validate"])
        .arg(dest.as_str())
        .arg("--complete")
        .assert()
        .success();

    // Tamper, then watch validation complain.
    let content = dest
        .join("Content")
        .join(duffel::store::flatten_path(&source));
    fs::write(content.join("one/A"), "sabotage!")?;

    cli()
        .args(["mirror", "validate"])
        .arg(dest.as_str())
        .arg("--complete")
        .assert()
        .failure();

    cli()
        .args(["mirror", "backup"])
        .arg(dest.as_str())
        .arg(source.as_str())
        .assert()
        .success();
    Ok(())
}

#[test]
fn validate_without_a_snapshot_fails() -> Result<()> {
    let dest_dir = tempdir()?;
    cli()
        .args(["mirror", "validate"])
        .arg(utf8(dest_dir.path()).as_str())
        .assert()
        .failure();
    Ok(())
}
