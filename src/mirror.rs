//! Mirror mode: continually reshape a destination to match a set of local
//! source trees.
//!
//! The destination holds the committed snapshot next to a `Content/` tree:
//!
//! ```text
//! <destination-root>/
//!   BackupSnapshot.json
//!   Content/
//! ```
//!
//! Mutation runs as a two-phase commit over filename suffixes: outbound
//! entries are renamed to `.__pending_delete__`, inbound ones staged as
//! `.__pending_commit__`, and only once everything is staged do the
//! renames and deletes land. A crash at any point leaves a destination
//! that [`cleanup`] restores to the pre-backup state.

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::concurrently;
use crate::diff::{Diff, DiffGroups};
use crate::error::Error;
use crate::file_util;
use crate::filter::PathFilter;
use crate::scan::{self, ScanOptions};
use crate::snapshot::Snapshot;
use crate::store::{
    self, DataStore, FileStore, ItemType, flatten_path, with_name_suffix, without_name_suffix,
};

pub const CONTENT_DIR: &str = "Content";

pub const PENDING_COMMIT_SUFFIX: &str = ".__pending_commit__";
pub const PENDING_DELETE_SUFFIX: &str = ".__pending_delete__";

/// How hard should validation look?
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValidateType {
    /// File names and sizes
    Standard,
    /// File names, sizes, and hashes
    Complete,
}

pub struct BackupOptions<'a> {
    pub ssd: bool,
    pub force: bool,
    pub filter: Option<&'a PathFilter>,
}

fn resolve_file_store(destination: &str, ssd: bool) -> Result<Box<dyn FileStore>> {
    match store::open(destination, ssd)? {
        DataStore::File(file_store) => Ok(file_store),
        DataStore::Bulk(bulk) => bail!(
            "{} is not a file-based data store, which mirroring requires",
            bulk.describe()
        ),
    }
}

/// Drives the destination to match the given sources.
pub fn backup(
    destination: &str,
    inputs: &[Utf8PathBuf],
    options: &BackupOptions,
) -> Result<()> {
    let destination_store = resolve_file_store(destination, options.ssd)?;
    destination_store.validate_backup_inputs(inputs)?;

    let local_store = store::fs::LocalFileStore::here(options.ssd);
    info!("Creating the local snapshot");
    let local_snapshot = scan::calculate(
        &local_store,
        inputs,
        &ScanOptions {
            run_in_parallel: options.ssd,
            calculate_hashes: true,
            filter: options.filter,
        },
    )?;

    let destination_snapshot =
        if options.force || !Snapshot::is_persisted(&*destination_store, None)? {
            Snapshot::empty()
        } else {
            info!("Reading the destination snapshot");
            Snapshot::load(&*destination_store, None)?
        };

    let diffs = DiffGroups::new(local_snapshot.diff(&destination_snapshot, true));
    info!(
        "{} differences ({} added, {} modified, {} removed)",
        diffs.len(),
        diffs.add.len(),
        diffs.modify.len(),
        diffs.remove.len()
    );

    store::ensure_capacity(
        &local_store,
        &*destination_store,
        diffs.add.iter().chain(&diffs.modify).map(|d| d.path.clone()),
    )?;

    // Revert anything a previous run left half-done before we stage our own.
    cleanup_destination(&*destination_store)?;

    persist(
        &*destination_store,
        &local_snapshot,
        &diffs,
        options.ssd,
        options.force,
    )
}

fn persist(
    destination: &dyn FileStore,
    local_snapshot: &Snapshot,
    diffs: &DiffGroups,
    ssd: bool,
    force: bool,
) -> Result<()> {
    // Stage the new snapshot alongside the committed one.
    let pending_snapshot =
        Utf8PathBuf::from(format!("{}{}", Snapshot::PERSISTED_FILE_NAME, PENDING_COMMIT_SUFFIX));
    {
        let staging = tempfile::tempdir().context("Couldn't create a staging directory")?;
        let staging_root = Utf8PathBuf::from_path_buf(staging.path().to_owned())
            .map_err(|p| anyhow::anyhow!("Temp dir {} isn't UTF-8", p.display()))?;
        let staging_store = store::fs::LocalFileStore::new(staging_root.clone(), ssd, None);
        local_snapshot.persist(&staging_store, None)?;
        file_util::write_file_to_store(
            destination,
            &staging_root.join(Snapshot::PERSISTED_FILE_NAME),
            &pending_snapshot,
            |_| (),
        )?;
    }

    let prev_working_dir = destination.working_dir();
    destination.make_dirs(Utf8Path::new(CONTENT_DIR))?;
    destination.set_working_dir(&prev_working_dir.join(CONTENT_DIR))?;

    let result = persist_content(destination, diffs, ssd, force);
    destination.set_working_dir(&prev_working_dir)?;
    result?;

    debug!("Committing the staged snapshot");
    destination.rename(&pending_snapshot, Utf8Path::new(Snapshot::PERSISTED_FILE_NAME))
}

fn persist_content(
    destination: &dyn FileStore,
    diffs: &DiffGroups,
    ssd: bool,
    force: bool,
) -> Result<()> {
    let parallel = destination.execute_in_parallel();

    let mut pending_deletes: Vec<Utf8PathBuf> = Vec::new();

    // A forced run replaces everything: mark the existing content for
    // deletion wholesale.
    if force {
        if let Some(top) = destination.walk(Utf8Path::new(""))?.first() {
            for name in top.dirs.iter().chain(&top.files) {
                let marked = Utf8PathBuf::from(format!("{name}{PENDING_DELETE_SUFFIX}"));
                destination.rename(Utf8Path::new(name), &marked)?;
                pending_deletes.push(marked);
            }
        }
    }

    // Phase one, outbound: rename removed and modified entries out of the
    // way.
    let to_mark: Vec<&Diff> = diffs.modify.iter().chain(&diffs.remove).collect();
    pending_deletes.extend(
        concurrently::map(parallel, &to_mark, |diff| {
            let original = flatten_path(&diff.path);
            if destination.item_type(&original)?.is_none() {
                info!("{original} no longer exists at the destination");
                return Ok(None);
            }
            let marked = with_name_suffix(&original, PENDING_DELETE_SUFFIX);
            destination.rename(&original, &marked)?;
            Ok(Some(marked))
        })?
        .into_iter()
        .flatten(),
    );

    // Phase one, inbound: stage added and modified content under pending
    // names.
    let to_copy: Vec<(Utf8PathBuf, Utf8PathBuf)> = diffs
        .add
        .iter()
        .chain(&diffs.modify)
        .map(|diff| {
            (
                diff.path.clone(),
                with_name_suffix(&flatten_path(&diff.path), PENDING_COMMIT_SUFFIX),
            )
        })
        .collect();

    let pending_commits: Vec<Utf8PathBuf> =
        concurrently::map(ssd && parallel, &to_copy, |(source, dest)| {
            if source.is_dir() {
                destination.make_dirs(dest)?;
            } else if source.is_file() {
                file_util::write_file_to_store(destination, source, dest, |_| ())?;
            } else {
                // Vanished since the scan; nothing to stage.
                info!("{source} no longer exists locally");
                return Ok(None);
            }
            Ok(Some(dest.clone()))
        })?
        .into_iter()
        .flatten()
        .collect();

    // Phase two: land the staged content, then purge the outbound names.
    concurrently::for_each(parallel, &pending_commits, |pending| {
        if destination.item_type(pending)?.is_some() {
            let landed = without_name_suffix(pending, PENDING_COMMIT_SUFFIX)
                .expect("staged names carry the commit suffix");
            destination.rename(pending, &landed)?;
        }
        Ok(())
    })?;

    concurrently::for_each(parallel, &pending_deletes, |pending| {
        file_util::remove_item(destination, pending)
    })
}

/// Reverts partially-committed state: staged `.__pending_commit__` entries
/// are dropped, `.__pending_delete__` entries get their names back.
pub fn cleanup(destination: &str) -> Result<()> {
    let destination_store = resolve_file_store(destination, false)?;
    cleanup_destination(&*destination_store)
}

fn cleanup_destination(destination: &dyn FileStore) -> Result<()> {
    let content_dir = Utf8Path::new(CONTENT_DIR);
    match destination.item_type(content_dir)? {
        None => {
            debug!("No content at the destination; nothing to clean up");
            return Ok(());
        }
        Some(ItemType::Dir) => {}
        Some(_) => {
            info!("{CONTENT_DIR} is a file; removing it");
            return destination.remove_file(content_dir);
        }
    }

    let mut reverted = 0usize;
    // Fixing an entry can invalidate the paths of everything under it,
    // so rewalk after each change.
    'rewalk: loop {
        for entry in destination.walk(content_dir)? {
            for name in entry.dirs.iter().chain(&entry.files) {
                let full = entry.root.join(name);
                if name.ends_with(PENDING_COMMIT_SUFFIX) {
                    info!("Removing staged {full}");
                    file_util::remove_item(destination, &full)?;
                    reverted += 1;
                    continue 'rewalk;
                }
                if name.ends_with(PENDING_DELETE_SUFFIX) {
                    let original = without_name_suffix(&full, PENDING_DELETE_SUFFIX).unwrap();
                    info!("Restoring {original}");
                    destination.rename(&full, &original)?;
                    reverted += 1;
                    continue 'rewalk;
                }
            }
        }
        break;
    }
    debug!("{reverted} items reverted");
    Ok(())
}

/// Compares the committed snapshot against what's actually in `Content/`,
/// returning one diff per discrepancy (empty means the mirror is sound).
pub fn validate(
    destination: &str,
    validate_type: ValidateType,
    ssd: bool,
) -> Result<Vec<Diff>> {
    let destination_store = resolve_file_store(destination, ssd)?;

    ensure!(
        Snapshot::is_persisted(&*destination_store, None)?,
        Error::MissingSnapshot
    );
    let mirrored = Snapshot::load(&*destination_store, None)?;

    cleanup_destination(&*destination_store)?;

    let prev_working_dir = destination_store.working_dir();
    let content_dir = prev_working_dir.join(CONTENT_DIR);
    destination_store.set_working_dir(&content_dir)?;

    info!("Scanning the mirrored content");
    let scanned = scan::calculate(
        &*destination_store,
        &[content_dir.clone()],
        &ScanOptions {
            run_in_parallel: destination_store.execute_in_parallel(),
            calculate_hashes: validate_type == ValidateType::Complete,
            filter: None,
        },
    );
    destination_store.set_working_dir(&prev_working_dir)?;
    let scanned = scanned?;

    // The committed snapshot holds original source paths; rewrite them to
    // where they land under Content/ so the two trees line up.
    let mut expected = Snapshot::empty();
    for (path, node) in mirrored.root.enumerate() {
        let dest_path = content_dir.join(flatten_path(&path));
        if node.is_file() {
            expected.add_file(
                &dest_path,
                node.file_hash().unwrap().to_owned(),
                node.file_size().unwrap(),
                false,
            )?;
        } else if node.children.is_empty() {
            expected.add_dir(&dest_path, true)?;
        }
    }

    let mut discrepancies =
        scanned.diff(&expected, validate_type == ValidateType::Complete);
    discrepancies.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(discrepancies)
}
