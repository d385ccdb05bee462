//! Streaming file copies with a rename-into-place discipline.
//!
//! A file lands in a store as a `__temp__` sibling first, then renames to
//! its final name, so the destination never holds a partial file under a
//! real name.

use std::fs::File;
use std::io::{self, prelude::*};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::hashing::CHUNK_SIZE;
use crate::store::{FileStore, ItemType};

/// `F.stem + ".__temp__" + F.suffix`, next to `F`.
pub fn temp_sibling(dest: &Utf8Path) -> Utf8PathBuf {
    let stem = dest.file_stem().unwrap_or_default();
    let ext = dest
        .extension()
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    dest.with_file_name(format!("{stem}.__temp__{ext}"))
}

fn stream(
    mut from: impl Read,
    mut to: impl Write,
    mut progress: impl FnMut(u64),
) -> io::Result<()> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        let count = from.read(&mut buf)?;
        if count == 0 {
            break;
        }
        to.write_all(&buf[..count])?;
        written += count as u64;
        progress(written);
    }
    to.flush()
}

/// Copies a local file into the store at `dest`, creating parent
/// directories and going through a temp sibling.
pub fn write_file_to_store(
    store: &dyn FileStore,
    source: &Utf8Path,
    dest: &Utf8Path,
    progress: impl FnMut(u64),
) -> Result<()> {
    let temp = temp_sibling(dest);
    // An empty parent still matters: it creates the store root itself.
    store.make_dirs(temp.parent().unwrap_or(Utf8Path::new("")))?;

    let from = File::open(source).with_context(|| format!("Couldn't open {source}"))?;
    let to = store.write(&temp)?;
    stream(from, to, progress).with_context(|| format!("Couldn't write {temp}"))?;

    store.rename(&temp, dest)?;
    trace!("Copied {source} to {dest}");
    Ok(())
}

/// Copies a file out of the store to a local path, creating parent
/// directories and going through a temp sibling.
pub fn fetch_file_from_store(
    store: &dyn FileStore,
    source: &Utf8Path,
    dest: &Utf8Path,
    progress: impl FnMut(u64),
) -> Result<()> {
    let temp = temp_sibling(dest);
    if let Some(parent) = temp.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
    }

    let from = store.read(source)?;
    let to = File::create(&temp).with_context(|| format!("Couldn't create {temp}"))?;
    stream(from, to, progress).with_context(|| format!("Couldn't write {temp}"))?;

    std::fs::rename(&temp, dest)
        .with_context(|| format!("Couldn't rename {temp} to {dest}"))?;
    trace!("Fetched {source} to {dest}");
    Ok(())
}

/// Removes whatever sits at `path` in the store; fine if nothing does.
pub fn remove_item(store: &dyn FileStore, path: &Utf8Path) -> Result<()> {
    match store.item_type(path)? {
        Some(ItemType::Dir) => store.remove_dir(path),
        Some(_) => store.remove_file(path),
        None => Ok(()),
    }
}

/// A local rename that falls back to copy-and-remove when the rename
/// crosses filesystems.
pub fn move_local(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(18) /* EXDEV */ => {
            std::fs::copy(from, to)
                .with_context(|| format!("Couldn't copy {from} to {to}"))?;
            std::fs::remove_file(from).with_context(|| format!("Couldn't remove {from}"))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Couldn't rename {from} to {to}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::store::fs::LocalFileStore;

    #[test]
    fn temp_siblings() {
        assert_eq!(
            temp_sibling(Utf8Path::new("a/b/file.txt")),
            Utf8PathBuf::from("a/b/file.__temp__.txt")
        );
        assert_eq!(
            temp_sibling(Utf8Path::new("noext")),
            Utf8PathBuf::from("noext.__temp__")
        );
    }

    #[test]
    fn round_trips_through_a_store() -> Result<()> {
        let source_dir = tempfile::tempdir()?;
        let store_dir = tempfile::tempdir()?;
        let fetched_dir = tempfile::tempdir()?;

        let source = Utf8PathBuf::from_path_buf(source_dir.path().join("in.bin")).unwrap();
        std::fs::write(&source, b"some file contents")?;

        let store = LocalFileStore::new(
            Utf8PathBuf::from_path_buf(store_dir.path().to_owned()).unwrap(),
            true,
            None,
        );

        write_file_to_store(&store, &source, Utf8Path::new("deep/ly/nested.bin"), |_| ())?;
        // No temp debris left behind.
        assert!(!store_dir.path().join("deep/ly/nested.__temp__.bin").exists());

        let fetched = Utf8PathBuf::from_path_buf(fetched_dir.path().join("out.bin")).unwrap();
        fetch_file_from_store(&store, Utf8Path::new("deep/ly/nested.bin"), &fetched, |_| ())?;
        assert_eq!(std::fs::read(&fetched)?, b"some file contents");
        Ok(())
    }
}
