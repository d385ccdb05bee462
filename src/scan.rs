//! Building a snapshot from live sources: discover, hash, organize.
//!
//! Symlinks are reported by stores as their own item type but are skipped
//! here with an info message - the snapshot format has no way to
//! represent them.

use anyhow::{Context, Result, bail, ensure};
use camino::Utf8PathBuf;
use tracing::*;

use crate::concurrently;
use crate::error::Error;
use crate::filter::PathFilter;
use crate::hashing::{self, NOT_CALCULATED};
use crate::snapshot::Snapshot;
use crate::store::{FileStore, ItemType, is_descendant};

pub struct ScanOptions<'a> {
    pub run_in_parallel: bool,
    pub calculate_hashes: bool,
    pub filter: Option<&'a PathFilter>,
}

impl Default for ScanOptions<'_> {
    fn default() -> Self {
        Self {
            run_in_parallel: false,
            calculate_hashes: true,
            filter: None,
        }
    }
}

/// What one input contributed: files to hash, plus any empty directories
/// worth remembering.
struct InputInfo {
    files: Vec<Utf8PathBuf>,
    empty_dirs: Vec<Utf8PathBuf>,
}

fn validate_inputs(store: &dyn FileStore, inputs: &[Utf8PathBuf]) -> Result<()> {
    ensure!(!inputs.is_empty(), "Nothing to scan");

    for input in inputs {
        match store.item_type(input)? {
            Some(ItemType::File) | Some(ItemType::Dir) => {}
            _ => bail!(Error::InvalidInput(input.clone())),
        }
    }

    // Sort shallowest-first so each input only needs checking against the
    // ones before it.
    let mut sorted: Vec<&Utf8PathBuf> = inputs.iter().collect();
    sorted.sort_by_key(|p| p.components().count());

    for (index, input) in sorted.iter().enumerate().skip(1) {
        for shallower in &sorted[..index] {
            if is_descendant(input, shallower) {
                bail!(Error::Overlap {
                    child: (*input).clone(),
                    parent: (*shallower).clone(),
                });
            }
        }
    }
    Ok(())
}

fn discover(
    store: &dyn FileStore,
    input: &Utf8PathBuf,
    filter: Option<&PathFilter>,
) -> Result<InputInfo> {
    let mut files = Vec::new();
    let mut empty_dirs = Vec::new();

    match store.item_type(input)? {
        Some(ItemType::File) => files.push(input.clone()),
        Some(ItemType::Dir) => {
            for entry in store.walk(input)? {
                if entry.is_empty() {
                    empty_dirs.push(entry.root);
                    continue;
                }
                for name in &entry.files {
                    let path = entry.root.join(name);
                    if store.item_type(&path)? != Some(ItemType::File) {
                        info!("{path} is not a supported item type; skipping");
                        continue;
                    }
                    if let Some(filter) = filter {
                        if !filter.matches(&path) {
                            debug!("{path} excluded by filters");
                            continue;
                        }
                    }
                    files.push(path);
                }
            }
        }
        // It was a file or directory when we validated; not anymore.
        _ => bail!(Error::InvalidInput(input.clone())),
    }

    debug!(
        "{}: {} files, {} empty directories",
        input,
        files.len(),
        empty_dirs.len()
    );
    Ok(InputInfo { files, empty_dirs })
}

/// Scans the given inputs (files or directories) through a store into a
/// fresh snapshot.
///
/// Discovery fans out one task per input and hashing one task per file,
/// each reading in 16 KiB chunks. A file that disappears between
/// discovery and hashing is skipped, not an error.
pub fn calculate(
    store: &dyn FileStore,
    inputs: &[Utf8PathBuf],
    options: &ScanOptions,
) -> Result<Snapshot> {
    validate_inputs(store, inputs)?;

    let infos: Vec<InputInfo> =
        concurrently::map(options.run_in_parallel, inputs, |input| {
            discover(store, input, options.filter)
        })
        .context(Error::ScanFailed)?;

    let all_files: Vec<Utf8PathBuf> = infos.iter().flat_map(|i| i.files.clone()).collect();

    let hashed: Vec<Option<(Utf8PathBuf, String, u64)>> =
        concurrently::map(options.run_in_parallel, &all_files, |path| {
            if store.item_type(path)?.is_none() {
                info!("{path} no longer exists; skipping");
                return Ok(None);
            }
            let hash = if options.calculate_hashes {
                hashing::hash_file(store, path, |_| ())?
            } else {
                NOT_CALCULATED.to_owned()
            };
            let size = store.file_size(path)?;
            Ok(Some((path.clone(), hash, size)))
        })
        .context(Error::ScanFailed)?;

    let mut snapshot = Snapshot::empty();
    for (path, hash, size) in hashed.into_iter().flatten() {
        snapshot.add_file(&path, hash, size, false)?;
    }
    for info in &infos {
        for dir in &info.empty_dirs {
            snapshot.add_dir(dir, false)?;
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod test {
    use super::*;

    use camino::Utf8Path;

    use crate::store::fs::LocalFileStore;

    fn tree(dir: &tempfile::TempDir) -> (LocalFileStore, Utf8PathBuf) {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        std::fs::create_dir_all(root.join("one")).unwrap();
        std::fs::create_dir_all(root.join("two/empty")).unwrap();
        std::fs::write(root.join("one/A"), "one/A").unwrap();
        std::fs::write(root.join("one/BC"), "one/BC").unwrap();
        std::fs::write(root.join("two/File1"), "two/File1").unwrap();
        (LocalFileStore::here(true), root)
    }

    #[test]
    fn scan_finds_files_and_empty_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, root) = tree(&dir);

        let snapshot = calculate(&store, &[root.clone()], &ScanOptions::default())?;

        let paths: Vec<String> = snapshot
            .root
            .enumerate()
            .filter(|(_, n)| n.is_file() || n.explicitly_added())
            .map(|(p, _)| p.to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                root.join("one/A").to_string(),
                root.join("one/BC").to_string(),
                root.join("two/File1").to_string(),
                root.join("two/empty").to_string(),
            ]
        );

        let (_, a) = snapshot
            .root
            .enumerate()
            .find(|(p, _)| p == &root.join("one/A"))
            .unwrap();
        assert_eq!(a.file_size(), Some(5));
        assert_eq!(
            a.file_hash().unwrap(),
            "38818bc4ba444583f537b9ed36a2fb4e7fd49694efd4a06b8fe0c1b00161e904\
             f4edb7a9713543b74f283261d3000671b6c0567d6abea2b19686870d8b344b4e"
        );
        Ok(())
    }

    #[test]
    fn size_only_scans_use_the_sentinel() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, root) = tree(&dir);

        let options = ScanOptions {
            calculate_hashes: false,
            ..Default::default()
        };
        let snapshot = calculate(&store, &[root.clone()], &options)?;
        let (_, a) = snapshot
            .root
            .enumerate()
            .find(|(p, _)| p == &root.join("one/A"))
            .unwrap();
        assert_eq!(a.file_hash(), Some(NOT_CALCULATED));
        assert_eq!(a.file_size(), Some(5));
        Ok(())
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let store = LocalFileStore::here(false);
        let err = calculate(
            &store,
            &[Utf8PathBuf::from("/definitely/not/a/thing")],
            &ScanOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn overlapping_inputs_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, root) = tree(&dir);

        let err = calculate(
            &store,
            &[root.clone(), root.join("one")],
            &ScanOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Overlap { .. })
        ));
        Ok(())
    }

    #[test]
    fn filters_apply_during_discovery() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, root) = tree(&dir);

        let filter = PathFilter::new(&[], &["BC$".to_owned()])?.unwrap();
        let options = ScanOptions {
            filter: Some(&filter),
            ..Default::default()
        };
        let snapshot = calculate(&store, &[root.clone()], &options)?;
        assert!(
            !snapshot
                .root
                .enumerate()
                .any(|(p, _)| p == root.join("one/BC"))
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, root) = tree(&dir);
        std::os::unix::fs::symlink(root.join("one/A"), root.join("one/link"))?;

        let snapshot = calculate(&store, &[root.clone()], &ScanOptions::default())?;
        assert!(
            !snapshot
                .root
                .enumerate()
                .any(|(p, _)| p == root.join("one/link"))
        );
        Ok(())
    }
}
