use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::tempdir;

use duffel::error::Error;
use duffel::offsite::{self, BackupOptions};
use duffel::restore::{self, RestoreOptions};

mod common;
use common::*;

const NAME: &str = "unit";

struct Offsite {
    _dirs: Vec<tempfile::TempDir>,
    source: Utf8PathBuf,
    state: Utf8PathBuf,
    work: Utf8PathBuf,
    dest: Utf8PathBuf,
}

fn fresh_offsite() -> Result<Offsite> {
    let source_dir = tempdir()?;
    let state_dir = tempdir()?;
    let work_dir = tempdir()?;
    let dest_dir = tempdir()?;

    let source = utf8(source_dir.path()).join("source");
    build_source_tree(&source)?;

    Ok(Offsite {
        state: utf8(state_dir.path()),
        work: utf8(work_dir.path()),
        dest: utf8(dest_dir.path()).join("offsite"),
        source,
        _dirs: vec![source_dir, state_dir, work_dir, dest_dir],
    })
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

fn run_backup(o: &Offsite, options: &BackupOptions) -> Result<()> {
    offsite::backup(
        NAME,
        Some(o.dest.as_str()),
        std::slice::from_ref(&o.source),
        &o.work,
        options,
    )
}

#[test]
fn chain_with_dedup_and_restore() -> Result<()> {
    let o = fresh_offsite()?;

    run_backup(&o, &options(&o.state))?;

    let chain_dir = o.dest.join(NAME);
    let runs = dir_names(&chain_dir);
    assert_eq!(runs.len(), 1);
    let primary = &runs[0];
    assert!(!primary.ends_with(".delta"), "first run must be a primary");

    // Three unique contents, an index, and its hash.
    let primary_dir = chain_dir.join(primary);
    assert_eq!(content_blobs(&primary_dir).len(), 3);
    let index = fs::read(primary_dir.join("index.json"))?;
    assert_eq!(
        fs::read_to_string(primary_dir.join("index.hash"))?,
        sha512_hex(&index)
    );

    // The staged run directory was cleaned up after delivery.
    assert_eq!(dir_names(&o.work).len(), 0);

    // T1: one new file, plus a duplicate of existing content.
    fs::write(o.source.join("one/d.txt"), "delta content")?;
    fs::write(o.source.join("two/copy_of_A"), "one/A")?;
    run_backup(&o, &options(&o.state))?;

    let runs = dir_names(&chain_dir);
    assert_eq!(runs.len(), 2);
    let delta = runs.iter().find(|r| r.ends_with(".delta")).expect("a delta");

    // Only the genuinely new content was copied; the duplicate rode on
    // the chain's existing blob.
    let delta_blobs = content_blobs(&chain_dir.join(delta));
    assert_eq!(delta_blobs, vec![sha512_hex(b"delta content")]);

    // No two blobs across the chain share a hash.
    let mut all_blobs = content_blobs(&primary_dir);
    all_blobs.extend(delta_blobs);
    let total = all_blobs.len();
    all_blobs.dedup();
    assert_eq!(all_blobs.len(), total);

    // Replaying the chain elsewhere reproduces the source exactly.
    let target_dir = tempdir()?;
    let target = utf8(target_dir.path()).join("restored");
    let restore_work = tempdir()?;
    restore::restore(
        NAME,
        o.dest.as_str(),
        None,
        &utf8(restore_work.path()),
        &[(o.source.to_string(), target.to_string())],
        &restore_options(),
    )?;
    assert_eq!(read_tree(&target), read_tree(&o.source));
    Ok(())
}

#[test]
fn unchanged_sources_produce_no_run() -> Result<()> {
    let o = fresh_offsite()?;
    run_backup(&o, &options(&o.state))?;
    run_backup(&o, &options(&o.state))?;
    assert_eq!(dir_names(&o.dest.join(NAME)).len(), 1);
    Ok(())
}

#[test]
fn pending_snapshot_protocol() -> Result<()> {
    let o = fresh_offsite()?;

    // No destination: the run stays local and the snapshot is pending.
    offsite::backup(NAME, None, std::slice::from_ref(&o.source), &o.work, &options(&o.state))?;
    let pending = o.state.join(format!("OffsiteFileBackup.{NAME}.__pending__.json"));
    let committed = o.state.join(format!("OffsiteFileBackup.{NAME}.json"));
    assert!(pending.is_file());
    assert!(!committed.exists());
    assert_eq!(dir_names(&o.work).len(), 1, "the staged run is kept");

    // Running again without resolving the pending snapshot is refused.
    let err =
        offsite::backup(NAME, None, std::slice::from_ref(&o.source), &o.work, &options(&o.state))
            .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::PendingSnapshotConflict(_))
    ));

    offsite::commit(NAME, Some(&o.state))?;
    assert!(!pending.exists());
    assert!(committed.is_file());

    // With everything committed there's nothing pending to ignore.
    let err = offsite::backup(
        NAME,
        None,
        std::slice::from_ref(&o.source),
        &o.work,
        &BackupOptions {
            ignore_pending_snapshot: true,
            ..options(&o.state)
        },
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MissingPendingSnapshot(_))
    ));
    Ok(())
}

#[test]
fn forced_reseed_starts_a_new_primary() -> Result<()> {
    let o = fresh_offsite()?;
    run_backup(&o, &options(&o.state))?;
    fs::write(o.source.join("one/extra"), "extra")?;
    run_backup(
        &o,
        &BackupOptions {
            force: true,
            ..options(&o.state)
        },
    )?;

    let runs = dir_names(&o.dest.join(NAME));
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| !r.ends_with(".delta")));

    // A reseed recopies everything relative to an empty snapshot.
    assert_eq!(content_blobs(&o.dest.join(NAME).join(&runs[1])).len(), 4);
    Ok(())
}

#[test]
fn encrypted_chain() -> Result<()> {
    if !have_7z() {
        eprintln!("skipping: no 7z binary on the path");
        return Ok(());
    }

    let o = fresh_offsite()?;
    // Enough incompressible-ish bytes to need more than one volume.
    let noise: Vec<u8> = (0u32..8192)
        .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
        .collect();
    fs::write(o.source.join("two/noise.bin"), &noise)?;

    let encrypted = BackupOptions {
        compress: true,
        encryption_password: Some("pw".to_owned()),
        archive_volume_size: 1024,
        ..options(&o.state)
    };
    run_backup(&o, &encrypted)?;

    let chain_dir = o.dest.join(NAME);
    let runs = dir_names(&chain_dir);
    let run_files = dir_names(&chain_dir.join(&runs[0]));
    assert!(run_files.iter().all(|f| f.starts_with("data.7z.")));
    assert!(run_files.contains(&"data.7z.001".to_owned()));
    assert!(run_files.len() > 1, "small volumes should split");

    // The wrong password doesn't decrypt.
    let target_dir = tempdir()?;
    let target = utf8(target_dir.path()).join("restored");
    let subs = vec![(o.source.to_string(), target.to_string())];

    let bad_work = tempdir()?;
    let err = restore::restore(
        NAME,
        o.dest.as_str(),
        Some("not-the-password"),
        &utf8(bad_work.path()),
        &subs,
        &restore_options(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::DecompressFailed(_))
    ));
    assert!(!target.exists());

    // The right one does.
    let good_work = tempdir()?;
    restore::restore(
        NAME,
        o.dest.as_str(),
        Some("pw"),
        &utf8(good_work.path()),
        &subs,
        &restore_options(),
    )?;
    assert_eq!(read_tree(&target), read_tree(&o.source));
    Ok(())
}
