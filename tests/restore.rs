use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::tempdir;

use duffel::error::Error;
use duffel::offsite::{self, BackupOptions};
use duffel::restore::{self, RestoreOptions};

mod common;
use common::*;

const NAME: &str = "replay";

struct Chain {
    _dirs: Vec<tempfile::TempDir>,
    source: Utf8PathBuf,
    dest: Utf8PathBuf,
    target: Utf8PathBuf,
}

impl Chain {
    fn subs(&self) -> Vec<(String, String)> {
        vec![(self.source.to_string(), self.target.to_string())]
    }
}

fn options(state: &Utf8Path) -> BackupOptions<'static> {
    BackupOptions {
        state_dir: Some(state.to_owned()),
        ..Default::default()
    }
}

fn restore_options() -> RestoreOptions {
    RestoreOptions {
        ssd: false,
        dry_run: false,
        overwrite: false,
        continue_on_errors: false,
    }
}

/// Builds a two-entry chain: a primary of `{a.txt, b.txt}`, then a delta
/// that modifies `a.txt`, removes `b.txt`, and adds `c/d.txt`.
fn build_chain() -> Result<Chain> {
    let source_dir = tempdir()?;
    let state_dir = tempdir()?;
    let work_dir = tempdir()?;
    let dest_dir = tempdir()?;
    let target_dir = tempdir()?;

    let source = utf8(source_dir.path()).join("source");
    let dest = utf8(dest_dir.path()).join("offsite");
    let target = utf8(target_dir.path()).join("restored");
    let state = utf8(state_dir.path());
    let work = utf8(work_dir.path());

    fs::create_dir_all(&source)?;
    fs::write(source.join("a.txt"), "alpha")?;
    fs::write(source.join("b.txt"), "beta")?;
    offsite::backup(
        NAME,
        Some(dest.as_str()),
        std::slice::from_ref(&source),
        &work,
        &options(&state),
    )?;

    fs::write(source.join("a.txt"), "alpha, version two")?;
    fs::remove_file(source.join("b.txt"))?;
    fs::create_dir_all(source.join("c"))?;
    fs::write(source.join("c/d.txt"), "delta")?;
    fs::create_dir_all(source.join("kept-empty"))?;
    offsite::backup(
        NAME,
        Some(dest.as_str()),
        std::slice::from_ref(&source),
        &work,
        &options(&state),
    )?;

    Ok(Chain {
        _dirs: vec![source_dir, state_dir, work_dir, dest_dir, target_dir],
        source,
        dest,
        target,
    })
}

#[test]
fn dry_run_changes_nothing() -> Result<()> {
    let chain = build_chain()?;
    let work = tempdir()?;

    restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &utf8(work.path()),
        &chain.subs(),
        &RestoreOptions {
            dry_run: true,
            ..restore_options()
        },
    )?;
    assert!(!chain.target.exists());
    Ok(())
}

#[test]
fn replay_applies_adds_modifies_and_removes() -> Result<()> {
    let chain = build_chain()?;
    let work = tempdir()?;

    restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &utf8(work.path()),
        &chain.subs(),
        &restore_options(),
    )?;

    // The primary's b.txt was added then removed by the delta.
    assert_eq!(fs::read(chain.target.join("a.txt"))?, b"alpha, version two");
    assert!(!chain.target.join("b.txt").exists());
    assert_eq!(fs::read(chain.target.join("c/d.txt"))?, b"delta");
    // Explicitly-added empty directories come back too.
    assert!(chain.target.join("kept-empty").is_dir());
    assert_eq!(read_tree(&chain.target), read_tree(&chain.source));
    Ok(())
}

#[test]
fn existing_targets_block_the_restore() -> Result<()> {
    let chain = build_chain()?;

    fs::create_dir_all(&chain.target)?;
    fs::write(chain.target.join("a.txt"), "precious local data")?;

    let work = tempdir()?;
    let err = restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &utf8(work.path()),
        &chain.subs(),
        &restore_options(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::OverwriteBlocked(_))
    ));
    assert_eq!(fs::read(chain.target.join("a.txt"))?, b"precious local data");

    // --overwrite waves it through.
    let work = tempdir()?;
    restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &utf8(work.path()),
        &chain.subs(),
        &RestoreOptions {
            overwrite: true,
            ..restore_options()
        },
    )?;
    assert_eq!(read_tree(&chain.target), read_tree(&chain.source));
    Ok(())
}

#[test]
fn continue_on_errors_restores_what_it_can() -> Result<()> {
    let chain = build_chain()?;

    fs::create_dir_all(&chain.target)?;
    fs::write(chain.target.join("a.txt"), "in the way")?;

    let work = tempdir()?;
    let err = restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &utf8(work.path()),
        &chain.subs(),
        &RestoreOptions {
            continue_on_errors: true,
            ..restore_options()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::OverwriteBlocked(_))
    ));

    // Everything that didn't collide still landed.
    assert_eq!(fs::read(chain.target.join("c/d.txt"))?, b"delta");
    assert!(!chain.target.join("b.txt").exists());
    Ok(())
}

#[test]
fn a_chain_without_a_primary_is_refused() -> Result<()> {
    let dest_dir = tempdir()?;
    let dest = utf8(dest_dir.path()).join("offsite");
    fs::create_dir_all(dest.join(NAME).join("2024.01.01.00.00.00-000000.delta"))?;

    let work = tempdir()?;
    let err = restore::restore(
        NAME,
        dest.as_str(),
        None,
        &utf8(work.path()),
        &[],
        &restore_options(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MissingSnapshot)
    ));
    Ok(())
}

#[test]
fn unrecognized_chain_entries_are_refused() -> Result<()> {
    let dest_dir = tempdir()?;
    let dest = utf8(dest_dir.path()).join("offsite");
    fs::create_dir_all(dest.join(NAME).join("definitely-not-a-run"))?;

    let work = tempdir()?;
    let err = restore::restore(
        NAME,
        dest.as_str(),
        None,
        &utf8(work.path()),
        &[],
        &restore_options(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("not a recognized directory name"));
    Ok(())
}

#[test]
fn nonlocal_sources_are_transferred_first() -> Result<()> {
    let chain = build_chain()?;
    let work = tempdir()?;
    let work_path = utf8(work.path());

    // Pretending the chain lives elsewhere forces the transfer step
    // instead of the local-filesystem passthrough.
    restore::restore(
        NAME,
        &format!("[nonlocal]{}", chain.dest),
        None,
        &work_path,
        &chain.subs(),
        &restore_options(),
    )?;
    assert_eq!(read_tree(&chain.target), read_tree(&chain.source));

    // The staged entries are real files, not links back to the source.
    let a_final = walkdir::WalkDir::new(work.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name() == "index.json")
        .expect("a staged index");
    assert!(!a_final.path_is_symlink());
    Ok(())
}

#[test]
fn staged_entries_are_reused_on_a_second_restore() -> Result<()> {
    let chain = build_chain()?;
    let work = tempdir()?;
    let work_path = utf8(work.path());

    restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &work_path,
        &chain.subs(),
        &restore_options(),
    )?;
    fs::remove_dir_all(&chain.target)?;

    // The per-entry final/ directories persist; a rerun rides on them.
    restore::restore(
        NAME,
        chain.dest.as_str(),
        None,
        &work_path,
        &chain.subs(),
        &RestoreOptions {
            overwrite: true,
            ..restore_options()
        },
    )?;
    assert_eq!(read_tree(&chain.target), read_tree(&chain.source));
    Ok(())
}
