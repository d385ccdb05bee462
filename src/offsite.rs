//! Offsite mode: emit a chronological chain of primary and delta
//! directories suitable for shipping to remote storage.
//!
//! Each run diffs the sources against the last *committed* snapshot and
//! writes a timestamped directory holding a content-addressed store
//! (`aa/bb/<sha512>`) plus an `index.json`/`index.hash` pair. Content
//! whose hash already appears anywhere in the committed chain is not
//! copied again, so each unique blob is stored at most once across the
//! chain.
//!
//! The snapshot that describes a run only becomes the committed snapshot
//! once the run is known to be delivered - immediately when we transfer
//! it ourselves, or via [`commit`] when the user ships the directory by
//! hand.

use std::fs;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashSet;
use tracing::*;

use crate::archive;
use crate::concurrently;
use crate::diff::{DiffGroups, EntryInfo};
use crate::error::Error;
use crate::file_util;
use crate::filter::PathFilter;
use crate::scan::{self, ScanOptions};
use crate::snapshot::Snapshot;
use crate::store::{self, DataStore, FileStore, fs::LocalFileStore, with_name_suffix,
                   without_name_suffix};

pub const INDEX_FILENAME: &str = "index.json";
pub const INDEX_HASH_FILENAME: &str = "index.hash";

pub const DELTA_SUFFIX: &str = ".delta";

/// Where a named backup keeps its committed and pending snapshots,
/// outside any destination.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub backup_name: String,
    pub committed: Utf8PathBuf,
    pub pending: Utf8PathBuf,
}

impl SnapshotPaths {
    /// The usual spot: the user's home directory.
    pub fn new(backup_name: &str) -> Result<Self> {
        let home = home::home_dir()
            .and_then(|h| Utf8PathBuf::from_path_buf(h).ok())
            .context("Can't find a home directory for snapshot state")?;
        Ok(Self::in_dir(&home, backup_name))
    }

    pub fn in_dir(dir: &Utf8Path, backup_name: &str) -> Self {
        let committed = dir.join(format!("OffsiteFileBackup.{backup_name}.json"));
        let pending = dir.join(format!("OffsiteFileBackup.{backup_name}.__pending__.json"));
        Self {
            backup_name: backup_name.to_owned(),
            committed,
            pending,
        }
    }
}

pub struct BackupOptions<'a> {
    pub ssd: bool,
    pub force: bool,
    pub filter: Option<&'a PathFilter>,
    pub compress: bool,
    pub encryption_password: Option<String>,
    pub archive_volume_size: u64,
    pub ignore_pending_snapshot: bool,
    /// Where snapshot state lives; `None` means the home directory.
    pub state_dir: Option<Utf8PathBuf>,
}

impl Default for BackupOptions<'_> {
    fn default() -> Self {
        Self {
            ssd: false,
            force: false,
            filter: None,
            compress: false,
            encryption_password: None,
            archive_volume_size: archive::DEFAULT_ARCHIVE_VOLUME_SIZE,
            ignore_pending_snapshot: false,
            state_dir: None,
        }
    }
}

fn snapshot_paths(backup_name: &str, options: &BackupOptions) -> Result<SnapshotPaths> {
    match &options.state_dir {
        Some(dir) => Ok(SnapshotPaths::in_dir(dir, backup_name)),
        None => SnapshotPaths::new(backup_name),
    }
}

/// `YYYY.MM.DD.HH.MM.SS-uuuuuu`, plus `.delta` for incrementals.
/// Lexicographic order is chronological order.
fn timestamp_dir_name(delta: bool) -> String {
    let now = jiff::Zoned::now();
    format!(
        "{}-{:06}{}",
        now.strftime("%Y.%m.%d.%H.%M.%S"),
        now.subsec_nanosecond() / 1_000,
        if delta { DELTA_SUFFIX } else { "" }
    )
}

/// Prepares local changes for offsite backup, optionally packaging and
/// delivering them.
///
/// With no `destination` the timestamped directory is left in
/// `working_dir` for the user to ship, and the run's snapshot is recorded
/// as pending until [`commit`].
pub fn backup(
    backup_name: &str,
    destination: Option<&str>,
    inputs: &[Utf8PathBuf],
    working_dir: &Utf8Path,
    options: &BackupOptions,
) -> Result<()> {
    // If we'll need the archive tool, find out now rather than after the
    // scan.
    if options.compress || options.encryption_password.is_some() {
        archive::zip_binary()?;
    }

    let paths = snapshot_paths(backup_name, options)?;
    if paths.pending.is_file() {
        ensure!(
            options.ignore_pending_snapshot,
            Error::PendingSnapshotConflict(backup_name.to_owned())
        );
        info!("Discarding the pending snapshot at {}", paths.pending);
        fs::remove_file(&paths.pending)?;
    } else if options.ignore_pending_snapshot {
        bail!(Error::MissingPendingSnapshot(backup_name.to_owned()));
    }

    let local_store = LocalFileStore::here(options.ssd);
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

    // No committed snapshot (or a forced reseed) makes this run a primary.
    let primary = options.force || !paths.committed.is_file();
    let offsite_snapshot = if primary {
        Snapshot::empty()
    } else {
        info!("Reading the last committed snapshot");
        Snapshot::load(&local_store, Some(&paths.committed))?
    };

    let diffs = DiffGroups::new(local_snapshot.diff(&offsite_snapshot, true));
    if diffs.is_empty() {
        info!("Nothing has changed; no backup directory produced");
        return Ok(());
    }
    info!(
        "{} differences ({} added, {} modified, {} removed)",
        diffs.len(),
        diffs.add.len(),
        diffs.modify.len(),
        diffs.remove.len()
    );

    let content_root = working_dir.join(timestamp_dir_name(!primary));
    fs::create_dir_all(&content_root)
        .with_context(|| format!("Couldn't create {content_root}"))?;

    let result = build_and_deliver(
        &paths,
        destination,
        &local_snapshot,
        &offsite_snapshot,
        diffs,
        &local_store,
        &content_root,
        options,
    );

    match &result {
        Ok(()) if destination.is_some() => {
            fs::remove_dir_all(&content_root)
                .with_context(|| format!("Couldn't remove {content_root}"))?;
        }
        Ok(()) => info!(
            "Content written to {content_root} but not committed; \
             after shipping it, run commit for '{backup_name}'"
        ),
        Err(_) => warn!("{content_root} preserved for inspection after errors"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn build_and_deliver(
    paths: &SnapshotPaths,
    destination: Option<&str>,
    local_snapshot: &Snapshot,
    offsite_snapshot: &Snapshot,
    diffs: DiffGroups,
    local_store: &LocalFileStore,
    content_root: &Utf8Path,
    options: &BackupOptions,
) -> Result<()> {
    let content_store = LocalFileStore::new(content_root.to_owned(), options.ssd, None);

    // Dedup: only content whose hash the chain hasn't seen gets copied.
    let mut chain_hashes: FxHashSet<String> = offsite_snapshot
        .root
        .enumerate()
        .filter_map(|(_, node)| node.file_hash().map(str::to_owned))
        .collect();

    let mut to_copy: Vec<(Utf8PathBuf, Utf8PathBuf)> = Vec::new();
    for diff in diffs.add.iter().chain(&diffs.modify) {
        let Some(EntryInfo::File { hash, .. }) = &diff.this else {
            continue;
        };
        // First copy wins; every later diff with the same content skips.
        if chain_hashes.insert(hash.clone()) {
            to_copy.push((diff.path.clone(), content_address(hash)));
        }
    }

    if !to_copy.is_empty() {
        store::ensure_capacity(
            local_store,
            &content_store,
            to_copy.iter().map(|(source, _)| source.clone()),
        )?;

        info!("Preserving {} content files", to_copy.len());
        concurrently::for_each(
            content_store.execute_in_parallel(),
            &to_copy,
            |(source, dest)| {
                ensure!(source.is_file(), "The file {source} was not found");
                file_util::write_file_to_store(&content_store, source, dest, |_| ())
            },
        )?;
    }

    // The index describes the whole run, dedup'd content included.
    write_index(&content_store, diffs)?;

    if options.compress || options.encryption_password.is_some() {
        package(content_root, options)?;
    }

    let Some(destination) = destination else {
        local_snapshot.persist(local_store, Some(&paths.pending))?;
        return Ok(());
    };

    match store::open(destination, options.ssd)? {
        // Upload the parent so the timestamped directory shows up at the
        // remote as a sibling of earlier runs.
        DataStore::Bulk(bulk) => {
            info!("Uploading via {}", bulk.describe());
            bulk.upload(content_root.parent().expect("content root has a parent"))?;
        }
        DataStore::File(remote) => {
            deliver_to_file_store(paths, &content_store, &*remote, options)?;
        }
    }

    info!("Committing the snapshot locally");
    local_snapshot.persist(local_store, Some(&paths.committed))
}

/// `aa/bb/<hash>` under the run directory.
fn content_address(hash: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(&hash[0..2]).join(&hash[2..4]).join(hash)
}

fn write_index(content_store: &LocalFileStore, diffs: DiffGroups) -> Result<()> {
    use std::io::Write;

    debug!("Writing {INDEX_FILENAME}");
    let index = crate::diff::to_index_json(diffs)?;
    let mut writer = content_store.write(Utf8Path::new(INDEX_FILENAME))?;
    writer.write_all(&index)?;
    writer.flush()?;
    drop(writer);

    let index_hash = crate::hashing::hash_file(content_store, Utf8Path::new(INDEX_FILENAME), |_| ())?;
    let mut writer = content_store.write(Utf8Path::new(INDEX_HASH_FILENAME))?;
    writer.write_all(index_hash.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Packages the run into split archive volumes and drops the loose
/// content, leaving only `data.7z.*`.
fn package(content_root: &Utf8Path, options: &BackupOptions) -> Result<()> {
    info!(
        "{} the run directory",
        match (options.compress, options.encryption_password.is_some()) {
            (true, true) => "Compressing and encrypting",
            (true, false) => "Compressing",
            _ => "Encrypting",
        }
    );

    archive::create(
        content_root,
        options.compress,
        options.encryption_password.as_deref(),
        options.archive_volume_size,
    )?;
    archive::verify(
        &content_root.join(format!("{}.001", archive::ARCHIVE_FILENAME)),
        options.encryption_password.as_deref(),
    )?;

    for entry in content_root.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_name().starts_with(archive::ARCHIVE_FILENAME) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Streams every file of the run into `<name>/<run-dir>/` at the remote
/// with the usual temp-suffix discipline, then renames everything into
/// place.
fn deliver_to_file_store(
    paths: &SnapshotPaths,
    content_store: &LocalFileStore,
    remote: &dyn FileStore,
    options: &BackupOptions,
) -> Result<()> {
    let backup_dir = Utf8PathBuf::from(&paths.backup_name);
    remote.make_dirs(&backup_dir)?;
    remote.set_working_dir(&remote.working_dir().join(&backup_dir))?;

    let content_root = content_store.working_dir();
    let run_name = content_root.file_name().expect("run directory has a name");

    let mut transfers: Vec<(Utf8PathBuf, Utf8PathBuf)> = Vec::new();
    for entry in content_store.walk(Utf8Path::new(""))? {
        for file in &entry.files {
            let source = entry.root.join(file);
            let relative = source
                .strip_prefix(&content_root)
                .expect("walked files sit under the run directory");
            transfers.push((
                source.clone(),
                with_name_suffix(&Utf8Path::new(run_name).join(relative),
                                 crate::mirror::PENDING_COMMIT_SUFFIX),
            ));
        }
    }
    ensure!(!transfers.is_empty(), "No content to transfer");

    store::ensure_capacity(
        content_store,
        remote,
        transfers.iter().map(|(source, _)| source.clone()),
    )?;

    info!("Transferring {} files to {}", transfers.len(), remote.describe());
    concurrently::for_each(
        options.ssd && remote.execute_in_parallel(),
        &transfers,
        |(source, dest)| file_util::write_file_to_store(remote, source, dest, |_| ()),
    )?;

    debug!("Committing the transferred content");
    concurrently::for_each(remote.execute_in_parallel(), &transfers, |(_, dest)| {
        let landed = without_name_suffix(dest, crate::mirror::PENDING_COMMIT_SUFFIX)
            .expect("transfers carry the commit suffix");
        remote.rename(dest, &landed)
    })
}

/// Promotes the pending snapshot to committed after the user delivered a
/// staged run by hand.
pub fn commit(backup_name: &str, state_dir: Option<&Utf8Path>) -> Result<()> {
    let paths = match state_dir {
        Some(dir) => SnapshotPaths::in_dir(dir, backup_name),
        None => SnapshotPaths::new(backup_name)?,
    };

    ensure!(
        paths.pending.is_file(),
        Error::MissingPendingSnapshot(backup_name.to_owned())
    );
    info!("Committing the pending snapshot for '{backup_name}'");
    fs::rename(&paths.pending, &paths.committed).with_context(|| {
        format!("Couldn't move {} over {}", paths.pending, paths.committed)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_addresses_shard_by_hash_prefix() {
        assert_eq!(
            content_address("deadbeef00"),
            Utf8PathBuf::from("de/ad/deadbeef00")
        );
    }

    #[test]
    fn run_names_sort_chronologically() {
        let primary = timestamp_dir_name(false);
        assert!(crate::restore::RUN_DIR_RE.is_match(&primary));
        let delta = timestamp_dir_name(true);
        assert!(delta.ends_with(DELTA_SUFFIX));
        assert!(crate::restore::RUN_DIR_RE.is_match(&delta));
    }

    #[test]
    fn commit_without_pending_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let err = commit("nope", Some(&state)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingPendingSnapshot(_))
        ));
    }
}
