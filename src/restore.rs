//! Restoring a tree by replaying an offsite chain: the latest primary
//! directory plus every delta after it, in order.
//!
//! Staging is parallel across chain entries (transfer, decompress,
//! verify); applying is strictly sequential - per entry, then per
//! instruction - and every mutation of the target is deferred into a
//! commit action so the caller sees either the old state or a fully
//! applied restore for each committed action.

use std::fs;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::*;
use walkdir::WalkDir;

use crate::archive;
use crate::concurrently;
use crate::diff::{Diff, DiffOp, EntryInfo};
use crate::error::Error;
use crate::file_util;
use crate::hashing;
use crate::offsite::{INDEX_FILENAME, INDEX_HASH_FILENAME};
use crate::store::{self, DataStore, FileStore, ItemType};

/// Chain entries are named `YYYY.MM.DD.HH.MM.SS-uuuuuu`, with `.delta`
/// on everything but a primary.
pub static RUN_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}\.\d{2}\.\d{2}\.\d{2}\.\d{2}\.\d{2}-\d+(\.delta)?$").unwrap()
});

pub struct RestoreOptions {
    pub ssd: bool,
    pub dry_run: bool,
    pub overwrite: bool,
    pub continue_on_errors: bool,
}

/// One step of the replay: what to do, where, and with which staged
/// content.
#[derive(Debug)]
struct Instruction {
    op: DiffOp,
    /// Staged content to copy in; `None` for directories and removes.
    content: Option<Utf8PathBuf>,
    original: String,
    local: Utf8PathBuf,
}

/// Deferred mutations, run in registration order after every entry has
/// been processed.
enum CommitAction {
    MakeDir { dest: Utf8PathBuf },
    MoveFile { temp: Utf8PathBuf, dest: Utf8PathBuf },
    Remove { dest: Utf8PathBuf },
}

impl CommitAction {
    fn run(self) -> Result<()> {
        match self {
            CommitAction::MakeDir { dest } => {
                clear_target(&dest)?;
                fs::create_dir_all(&dest).with_context(|| format!("Couldn't create {dest}"))
            }
            CommitAction::MoveFile { temp, dest } => {
                clear_target(&dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Couldn't create {parent}"))?;
                }
                file_util::move_local(&temp, &dest)
            }
            CommitAction::Remove { dest } => {
                // Removing something already gone is not an error.
                clear_target(&dest)
            }
        }
    }
}

fn clear_target(dest: &Utf8Path) -> Result<()> {
    match dest.symlink_metadata() {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(dest).with_context(|| format!("Couldn't remove {dest}"))
        }
        Ok(_) => fs::remove_file(dest).with_context(|| format!("Couldn't remove {dest}")),
        Err(_) => Ok(()),
    }
}

/// Materializes the tree described by the chain at `source` into the
/// paths recorded in its indexes, with `substitutions` applied as plain
/// string replacements.
pub fn restore(
    backup_name: &str,
    source: &str,
    encryption_password: Option<&str>,
    working_dir: &Utf8Path,
    substitutions: &[(String, String)],
    options: &RestoreOptions,
) -> Result<()> {
    let store = match store::open(source, options.ssd)? {
        DataStore::File(file_store) => file_store,
        DataStore::Bulk(bulk) => bail!(
            "{} is not a file-based data store, which restoring requires. \
             Copy the chain to your local filesystem first and point this \
             command at that copy.",
            bulk.describe()
        ),
    };

    fs::create_dir_all(working_dir)
        .with_context(|| format!("Couldn't create {working_dir}"))?;
    let working_dir = working_dir
        .canonicalize_utf8()
        .with_context(|| format!("Couldn't canonicalize {working_dir}"))?;

    let backup_dir = Utf8PathBuf::from(backup_name);
    if store.item_type(&backup_dir)? == Some(ItemType::Dir) {
        store.set_working_dir(&store.working_dir().join(&backup_dir))?;
    }

    let chain = discover_chain(&*store)?;
    info!("Replaying {} chain entries", chain.len());

    // Stage every entry concurrently: transfer, unpack, verify.
    let final_dirs: Vec<Utf8PathBuf> = concurrently::map(
        options.ssd && store.execute_in_parallel(),
        &chain,
        |entry| {
            stage_entry(
                &*store,
                entry,
                &working_dir,
                encryption_password,
                options.continue_on_errors,
            )
            .with_context(|| format!("Couldn't stage {entry}"))
        },
    )?;

    let staging_dir = working_dir.join("staging");
    let result = replay(
        &chain,
        &final_dirs,
        &staging_dir,
        &working_dir,
        substitutions,
        options,
    );

    match &result {
        Ok(()) => {
            if staging_dir.is_dir() {
                fs::remove_dir_all(&staging_dir)
                    .with_context(|| format!("Couldn't remove {staging_dir}"))?;
            }
        }
        Err(_) => warn!("{staging_dir} preserved after errors"),
    }
    result
}

/// Lists the chain: every directory at the top of the source, validated
/// against the naming scheme and sliced from the latest primary forward.
fn discover_chain(store: &dyn FileStore) -> Result<Vec<String>> {
    let entries = store.walk(Utf8Path::new(""))?;
    let Some(top) = entries.first() else {
        bail!("No directories were found");
    };
    ensure!(
        top.files.is_empty(),
        "Files were not expected at the top of the chain: {}",
        top.files.join(", ")
    );
    ensure!(!top.dirs.is_empty(), "No directories were found");

    let mut primaries = Vec::new();
    for (index, name) in top.dirs.iter().enumerate() {
        let captures = RUN_DIR_RE
            .captures(name)
            .ok_or_else(|| anyhow!("'{name}' is not a recognized directory name"))?;
        if captures.get(1).is_none() {
            primaries.push(index);
        }
    }

    match primaries.len() {
        0 => Err(anyhow!("No primary directories were found"))
            .context(Error::MissingSnapshot),
        1 => Ok(top.dirs[primaries[0]..].to_vec()),
        _ => bail!(
            "Multiple primary directories were found: {}",
            primaries
                .iter()
                .map(|i| top.dirs[*i].as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Readies one chain entry under `working_dir/<entry>/final/`:
///
/// ```text
/// <working_dir>/<entry>/
///   transferred/    (temporary; skipped when the source is local)
///   decompressed/   (temporary; skipped when the entry isn't archived)
///   final/
/// ```
///
/// An entry whose `final/` already exists is reused as-is.
fn stage_entry(
    store: &dyn FileStore,
    entry: &str,
    working_dir: &Utf8Path,
    encryption_password: Option<&str>,
    continue_on_errors: bool,
) -> Result<Utf8PathBuf> {
    let entry_dir = working_dir.join(entry);
    let final_dir = entry_dir.join("final");
    if final_dir.is_dir() {
        debug!("{entry} is already staged");
        return Ok(final_dir);
    }

    // Pull the entry onto the local filesystem, unless it's there already.
    let (source_dir, transferred_temp) = if store.is_local_filesystem() {
        (store.working_dir().join(entry), false)
    } else {
        let transferred_dir = entry_dir.join("transferred");
        let walked_entries = store.walk(Utf8Path::new(entry))?;
        // The first entry is the walk base; stores report roots relative
        // to however they resolved it.
        let base = walked_entries
            .first()
            .map(|walked| walked.root.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(entry));
        let mut any = false;
        for walked in &walked_entries {
            for file in &walked.files {
                let remote = walked.root.join(file);
                let relative = remote
                    .strip_prefix(&base)
                    .expect("walked files sit under the walk base");
                file_util::fetch_file_from_store(
                    store,
                    &remote,
                    &transferred_dir.join(relative),
                    |_| (),
                )?;
                any = true;
            }
        }
        ensure!(any, "The directory {entry} does not contain any files");
        (transferred_dir, true)
    };

    // Unpack, if the entry was archived.
    let (payload_dir, decompressed_temp) = if source_dir.join(INDEX_FILENAME).is_file() {
        (source_dir.clone(), false)
    } else {
        let first_volume = source_dir.join(format!("{}.001", archive::ARCHIVE_FILENAME));
        ensure!(
            first_volume.is_file(),
            "The archive file {first_volume} was not found"
        );

        // The tool prompts (and blocks) for a password on encrypted
        // archives when none is given, so always hand it one; a bogus
        // password fails fast instead.
        let bogus = format!("duffel-no-password-{}", std::process::id());
        let password = encryption_password.unwrap_or(&bogus);

        if let Err(e) = archive::verify(&first_volume, Some(password)) {
            let failure = anyhow!(e).context(Error::DecompressFailed(entry.to_owned()));
            if continue_on_errors {
                warn!("Archive validation failed for {entry}: {failure:#}");
            } else {
                return Err(failure);
            }
        }

        let decompressed_dir = entry_dir.join("decompressed");
        fs::create_dir_all(&decompressed_dir)
            .with_context(|| format!("Couldn't create {decompressed_dir}"))?;
        if let Err(e) = archive::extract(&first_volume, &decompressed_dir, Some(password)) {
            return Err(anyhow!(e).context(Error::DecompressFailed(entry.to_owned())));
        }
        (decompressed_dir, true)
    };

    verify_files(&payload_dir, entry, continue_on_errors)?;

    // Move (or link, when both stages were passthroughs) the payload into
    // final/, via a temp name so a crash can't leave a half-built final.
    let temp_dest = entry_dir.join("final.__temp__");
    if temp_dest.exists() {
        fs::remove_dir_all(&temp_dest)?;
    }
    fs::create_dir_all(&temp_dest)?;

    for item in payload_dir
        .read_dir_utf8()
        .with_context(|| format!("Couldn't read {payload_dir}"))?
    {
        let item = item?;
        if item.file_name() == INDEX_HASH_FILENAME {
            continue;
        }
        let dest = temp_dest.join(item.file_name());
        if transferred_temp || decompressed_temp {
            fs::rename(item.path(), &dest)
                .with_context(|| format!("Couldn't move {} to {dest}", item.path()))?;
        } else {
            symlink(item.path(), &dest)?;
        }
    }
    fs::rename(&temp_dest, &final_dir)
        .with_context(|| format!("Couldn't move {temp_dest} to {final_dir}"))?;

    // The scratch stages have served their purpose.
    if decompressed_temp {
        let _ = fs::remove_dir_all(entry_dir.join("decompressed"));
    }
    if transferred_temp {
        let _ = fs::remove_dir_all(entry_dir.join("transferred"));
    }

    Ok(final_dir)
}

#[cfg(unix)]
fn symlink(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(source, dest)
        .with_context(|| format!("Couldn't link {dest} to {source}"))
}

#[cfg(not(unix))]
fn symlink(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    // No symlinks to lean on; copy instead.
    fs::copy(source, dest).with_context(|| format!("Couldn't copy {source} to {dest}"))?;
    Ok(())
}

/// Recomputes every payload file's hash: content files must hash to their
/// own names, and the index must match `index.hash`.
fn verify_files(payload_dir: &Utf8Path, entry: &str, continue_on_errors: bool) -> Result<()> {
    for index_file in [INDEX_FILENAME, INDEX_HASH_FILENAME] {
        ensure!(
            payload_dir.join(index_file).is_file(),
            "The index file {index_file} does not exist in {entry}"
        );
    }

    let expected_index_hash = fs::read_to_string(payload_dir.join(INDEX_HASH_FILENAME))?
        .trim()
        .to_owned();

    let mut mismatches = Vec::new();
    for walked in WalkDir::new(payload_dir) {
        let walked = walked?;
        if !walked.file_type().is_file() {
            continue;
        }
        let path = Utf8Path::from_path(walked.path())
            .ok_or_else(|| anyhow!("{} isn't UTF-8", walked.path().display()))?;
        let name = path.file_name().unwrap();
        if name == INDEX_HASH_FILENAME {
            continue;
        }

        let expected = if name == INDEX_FILENAME {
            expected_index_hash.as_str()
        } else {
            name
        };
        let actual = hashing::hash_reader(
            fs::File::open(path).with_context(|| format!("Couldn't open {path}"))?,
            |_| (),
        )?;
        if actual != expected {
            mismatches.push(format!(
                "{}: expected {expected}, hashed to {actual}",
                path.strip_prefix(payload_dir).unwrap_or(path)
            ));
        }
    }

    if !mismatches.is_empty() {
        let failure = anyhow!(Error::CorruptArchive(
            entry.to_owned(),
            mismatches.join("; ")
        ));
        if continue_on_errors {
            warn!("{failure:#}");
        } else {
            return Err(failure);
        }
    }
    Ok(())
}

fn apply_substitutions(path: &str, substitutions: &[(String, String)]) -> Utf8PathBuf {
    let mut path = path.to_owned();
    for (from, to) in substitutions {
        path = path.replace(from, to);
    }
    Utf8PathBuf::from(path)
}

fn staging_path(staging_dir: &Utf8Path, hash: &str) -> Utf8PathBuf {
    staging_dir.join(&hash[0..2]).join(&hash[2..4]).join(hash)
}

/// Builds the flat content pool and the per-entry instruction lists, then
/// applies them with deferred commits.
fn replay(
    chain: &[String],
    final_dirs: &[Utf8PathBuf],
    staging_dir: &Utf8Path,
    working_dir: &Utf8Path,
    substitutions: &[(String, String)],
    options: &RestoreOptions,
) -> Result<()> {
    // Pool every entry's content files under one content-addressed root.
    // First link wins; later entries never overwrite earlier content
    // (equal hash means equal bytes anyway).
    for final_dir in final_dirs {
        for walked in WalkDir::new(final_dir).follow_links(true) {
            let walked = walked?;
            if !walked.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(walked.path())
                .ok_or_else(|| anyhow!("{} isn't UTF-8", walked.path().display()))?;
            // Top-level files (the index) aren't content.
            if path.parent() == Some(final_dir.as_path()) {
                continue;
            }
            let dest = staging_dir.join(path.strip_prefix(final_dir).unwrap());
            if !dest.is_file() {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                symlink(path, &dest)?;
            }
        }
    }

    // Translate every index into instructions, tracking which hashes the
    // chain has staged so far.
    let mut staged_hashes: FxHashSet<String> = FxHashSet::default();
    let mut per_entry: Vec<(String, Vec<Instruction>)> = Vec::new();

    for (entry, final_dir) in chain.iter().zip(final_dirs) {
        let index_bytes = fs::read(final_dir.join(INDEX_FILENAME))
            .with_context(|| format!("Couldn't read {entry}'s index"))?;
        let diffs = crate::diff::from_index_json(&index_bytes)
            .with_context(|| format!("Couldn't parse {entry}'s index"))?;

        let mut instructions = Vec::with_capacity(diffs.len());
        for (item_index, diff) in diffs.into_iter().enumerate() {
            instructions.push(
                build_instruction(diff, staging_dir, substitutions, &mut staged_hashes)
                    .with_context(|| {
                        format!("Bad instruction {item_index} in {entry}'s index")
                    })?,
            );
        }
        per_entry.push((entry.clone(), instructions));
    }

    apply(&per_entry, working_dir, options)
}

fn build_instruction(
    diff: Diff,
    staging_dir: &Utf8Path,
    substitutions: &[(String, String)],
    staged_hashes: &mut FxHashSet<String>,
) -> Result<Instruction> {
    let local = apply_substitutions(diff.path.as_str(), substitutions);

    let content = match diff.op {
        DiffOp::Add => match &diff.this {
            Some(EntryInfo::File { hash, .. }) => {
                staged_hashes.insert(hash.clone());
                Some(staging_path(staging_dir, hash))
            }
            // An add with no hash creates a directory.
            _ => None,
        },
        DiffOp::Modify => {
            let this_hash = diff
                .this
                .as_ref()
                .and_then(EntryInfo::file_hash)
                .context("modify without a new hash")?;
            let other_hash = diff
                .other
                .as_ref()
                .and_then(EntryInfo::file_hash)
                .context("modify without an original hash")?;
            ensure!(
                staged_hashes.contains(other_hash),
                "The original file does not exist in the staged content"
            );
            staged_hashes.insert(this_hash.to_owned());
            Some(staging_path(staging_dir, this_hash))
        }
        DiffOp::Remove => {
            if let Some(hash) = diff.other.as_ref().and_then(EntryInfo::file_hash) {
                ensure!(
                    staged_hashes.contains(hash),
                    "The referenced file does not exist in the staged content"
                );
            }
            None
        }
    };

    Ok(Instruction {
        op: diff.op,
        content,
        original: diff.path.as_str().to_owned(),
        local,
    })
}

fn print_instruction_table(entry: &str, instructions: &[Instruction]) {
    let local_width = instructions
        .iter()
        .map(|i| i.local.as_str().len())
        .max()
        .unwrap_or(0)
        .max("Local Location".len());

    println!("\n{entry}");
    println!("  {:<10} {:<local_width$}  Original Location", "Operation", "Local Location");
    for instruction in instructions {
        println!(
            "  [{:^8}] {:<local_width$}  {}",
            instruction.op.name().to_uppercase(),
            instruction.local.as_str(),
            instruction.original
        );
    }
}

fn apply(
    per_entry: &[(String, Vec<Instruction>)],
    working_dir: &Utf8Path,
    options: &RestoreOptions,
) -> Result<()> {
    let scratch = working_dir.join("instructions");
    fs::create_dir_all(&scratch)?;

    let mut commit_actions: Vec<CommitAction> = Vec::new();
    let mut failures: Vec<anyhow::Error> = Vec::new();
    let mut scratch_counter = 0usize;

    'entries: for (entry, instructions) in per_entry {
        print_instruction_table(entry, instructions);
        if options.dry_run {
            continue;
        }

        for instruction in instructions {
            match prepare(
                instruction,
                &scratch,
                &mut scratch_counter,
                &mut commit_actions,
                options.overwrite,
            ) {
                Ok(()) => {}
                Err(e) => {
                    let e = e.context(format!(
                        "Couldn't prepare {} of {}",
                        instruction.op.name(),
                        instruction.local
                    ));
                    if options.continue_on_errors {
                        warn!("{e:#}");
                        failures.push(e);
                    } else {
                        failures.push(e);
                        break 'entries;
                    }
                }
            }
        }
    }

    // Land everything that staged cleanly, in registration order.
    info!("Committing {} actions", commit_actions.len());
    for action in commit_actions {
        action.run()?;
    }
    fs::remove_dir_all(&scratch)?;

    match failures.len() {
        0 => Ok(()),
        n => Err(failures
            .swap_remove(0)
            .context(format!("{n} instructions failed"))),
    }
}

fn prepare(
    instruction: &Instruction,
    scratch: &Utf8Path,
    scratch_counter: &mut usize,
    commit_actions: &mut Vec<CommitAction>,
    overwrite: bool,
) -> Result<()> {
    if instruction.op == DiffOp::Add
        && instruction.local.symlink_metadata().is_ok()
        && !overwrite
    {
        bail!(Error::OverwriteBlocked(instruction.local.clone()));
    }

    match (&instruction.op, &instruction.content) {
        (DiffOp::Remove, _) => commit_actions.push(CommitAction::Remove {
            dest: instruction.local.clone(),
        }),
        (_, None) => commit_actions.push(CommitAction::MakeDir {
            dest: instruction.local.clone(),
        }),
        (_, Some(content)) => {
            ensure!(
                content.is_file(),
                "The archive data for {} is missing",
                instruction.original
            );
            let temp = scratch.join(scratch_counter.to_string());
            *scratch_counter += 1;
            fs::copy(content, &temp)
                .with_context(|| format!("Couldn't stage {content}"))?;
            commit_actions.push(CommitAction::MoveFile {
                temp,
                dest: instruction.local.clone(),
            });
        }
    }
    Ok(())
}
