//! A store that keeps everything as path-addressed buffers.
//!
//! Great for testing - especially the paths that are awkward to hit with
//! a real filesystem, like a destination with almost no room left.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, prelude::*};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};

use super::{FileStore, ItemType, WalkEntry};

#[derive(Default)]
struct State {
    files: BTreeMap<Utf8PathBuf, Vec<u8>>,
    dirs: BTreeSet<Utf8PathBuf>,
}

pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    cwd: Mutex<Utf8PathBuf>,
    bytes_available: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A store that claims to have only `bytes_available` bytes free.
    pub fn with_capacity(bytes_available: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            cwd: Mutex::new(Utf8PathBuf::new()),
            bytes_available,
        }
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.cwd.lock().unwrap().join(path)
    }

    fn lookup(state: &State, path: &Utf8Path) -> Option<ItemType> {
        if state.files.contains_key(path) {
            return Some(ItemType::File);
        }
        // A directory exists if it was made, or if anything lives under it.
        if state.dirs.iter().any(|d| d.starts_with(path))
            || state.files.keys().any(|f| f.starts_with(path) && f != path)
        {
            return Some(ItemType::Dir);
        }
        None
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Commits its buffer back to the store when dropped,
/// like closing a file handle.
struct MemoryWriter {
    buf: Vec<u8>,
    path: Utf8PathBuf,
    state: Arc<Mutex<State>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(self.path.clone(), std::mem::take(&mut self.buf));
    }
}

impl FileStore for MemoryStore {
    fn describe(&self) -> String {
        "in-memory store".to_owned()
    }

    fn bytes_available(&self) -> Result<Option<u64>> {
        Ok(self.bytes_available)
    }

    fn working_dir(&self) -> Utf8PathBuf {
        self.cwd.lock().unwrap().clone()
    }

    fn set_working_dir(&self, path: &Utf8Path) -> Result<()> {
        *self.cwd.lock().unwrap() = path.to_owned();
        Ok(())
    }

    fn item_type(&self, path: &Utf8Path) -> Result<Option<ItemType>> {
        let path = self.resolve(path);
        Ok(Self::lookup(&self.state.lock().unwrap(), &path))
    }

    fn file_size(&self, path: &Utf8Path) -> Result<u64> {
        let path = self.resolve(path);
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&path)
            .map(|buf| buf.len() as u64)
            .ok_or_else(|| anyhow!("No file {path}"))
    }

    fn remove_dir(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        let mut state = self.state.lock().unwrap();
        state.files.retain(|f, _| !f.starts_with(&path));
        state.dirs.retain(|d| !d.starts_with(&path));
        Ok(())
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        self.state.lock().unwrap().files.remove(&path);
        Ok(())
    }

    fn make_dirs(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        if !path.as_str().is_empty() {
            self.state.lock().unwrap().dirs.insert(path);
        }
        Ok(())
    }

    fn read(&self, path: &Utf8Path) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(path);
        let state = self.state.lock().unwrap();
        let buf = state
            .files
            .get(&path)
            .ok_or_else(|| anyhow!("No file {path}"))?
            .clone();
        Ok(Box::new(io::Cursor::new(buf)))
    }

    fn write(&self, path: &Utf8Path) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(MemoryWriter {
            buf: Vec::new(),
            path: self.resolve(path),
            state: self.state.clone(),
        }))
    }

    fn rename(&self, old: &Utf8Path, new: &Utf8Path) -> Result<()> {
        let old = self.resolve(old);
        let new = self.resolve(new);
        let mut state = self.state.lock().unwrap();

        match Self::lookup(&state, &old) {
            Some(ItemType::File) => {
                // Replace whatever is at the destination.
                state.files.retain(|f, _| !f.starts_with(&new));
                state.dirs.retain(|d| !d.starts_with(&new));
                let buf = state.files.remove(&old).unwrap();
                state.files.insert(new, buf);
            }
            Some(ItemType::Dir) => {
                state.files.retain(|f, _| !f.starts_with(&new));
                state.dirs.retain(|d| !d.starts_with(&new));
                let moved: Vec<(Utf8PathBuf, Vec<u8>)> = state
                    .files
                    .iter()
                    .filter(|(f, _)| f.starts_with(&old))
                    .map(|(f, buf)| {
                        (new.join(f.strip_prefix(&old).unwrap()), buf.clone())
                    })
                    .collect();
                state.files.retain(|f, _| !f.starts_with(&old));
                let moved_dirs: Vec<Utf8PathBuf> = state
                    .dirs
                    .iter()
                    .filter(|d| d.starts_with(&old))
                    .map(|d| new.join(d.strip_prefix(&old).unwrap()))
                    .collect();
                state.dirs.retain(|d| !d.starts_with(&old));
                state.files.extend(moved);
                state.dirs.extend(moved_dirs);
            }
            _ => bail!("No item {old} to rename"),
        }
        Ok(())
    }

    fn walk(&self, path: &Utf8Path) -> Result<Vec<WalkEntry>> {
        let start = self.resolve(path);
        let state = self.state.lock().unwrap();
        if Self::lookup(&state, &start).is_none() {
            return Ok(Vec::new());
        }

        // Reconstruct the directory tree from the flat path maps.
        let mut children: BTreeMap<Utf8PathBuf, (BTreeSet<String>, BTreeSet<String>)> =
            BTreeMap::new();
        children.entry(start.clone()).or_default();

        let mut note = |path: &Utf8Path, is_file: bool| {
            let Ok(relative) = path.strip_prefix(&start) else {
                return;
            };
            let mut parent = start.clone();
            let mut parts = relative.components().peekable();
            while let Some(part) = parts.next() {
                let entry = children.entry(parent.clone()).or_default();
                if parts.peek().is_none() && is_file {
                    entry.1.insert(part.as_str().to_owned());
                } else {
                    entry.0.insert(part.as_str().to_owned());
                    parent.push(part.as_str());
                    children.entry(parent.clone()).or_default();
                }
            }
        };

        for file in state.files.keys() {
            note(file, true);
        }
        for dir in state.dirs.iter() {
            note(dir, false);
        }

        Ok(children
            .into_iter()
            .map(|(root, (dirs, files))| WalkEntry {
                root,
                dirs: dirs.into_iter().collect(),
                files: files.into_iter().collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn behaves_like_a_filesystem() -> Result<()> {
        let store = MemoryStore::new();
        store.make_dirs(Utf8Path::new("a/b"))?;
        store.write(Utf8Path::new("a/b/f.txt"))?.write_all(b"hello")?;
        store.write(Utf8Path::new("top.txt"))?.write_all(b"hi")?;

        assert_eq!(store.item_type(Utf8Path::new("a"))?, Some(ItemType::Dir));
        assert_eq!(
            store.item_type(Utf8Path::new("a/b/f.txt"))?,
            Some(ItemType::File)
        );
        assert_eq!(store.file_size(Utf8Path::new("a/b/f.txt"))?, 5);

        let entries = store.walk(Utf8Path::new(""))?;
        assert_eq!(entries[0].dirs, vec!["a"]);
        assert_eq!(entries[0].files, vec!["top.txt"]);

        store.rename(Utf8Path::new("a"), Utf8Path::new("z"))?;
        assert_eq!(store.item_type(Utf8Path::new("a"))?, None);
        let mut contents = String::new();
        store
            .read(Utf8Path::new("z/b/f.txt"))?
            .read_to_string(&mut contents)?;
        assert_eq!(contents, "hello");

        store.remove_dir(Utf8Path::new("z"))?;
        assert_eq!(store.item_type(Utf8Path::new("z"))?, None);
        Ok(())
    }

    #[test]
    fn snapshots_round_trip_through_it() -> Result<()> {
        use crate::snapshot::Snapshot;

        let store = MemoryStore::new();
        let mut snapshot = Snapshot::empty();
        snapshot.add_file(Utf8Path::new("/f"), "aa".repeat(64), 1, false)?;
        snapshot.persist(&store, None)?;

        assert!(Snapshot::is_persisted(&store, None)?);
        assert_eq!(Snapshot::load(&store, None)?, snapshot);
        Ok(())
    }

    #[test]
    fn cramped_destinations_are_refused() -> Result<()> {
        use crate::error::Error;
        use crate::store::ensure_capacity;

        let local_dir = tempfile::tempdir()?;
        let local_root = Utf8PathBuf::from_path_buf(local_dir.path().to_owned()).unwrap();
        std::fs::write(local_root.join("big"), vec![0u8; 4096])?;

        let local = crate::store::fs::LocalFileStore::new(local_root.clone(), false, None);
        let cramped = MemoryStore::with_capacity(Some(1024));

        let err = ensure_capacity(&local, &cramped, std::iter::once(local_root.join("big")))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InsufficientSpace { .. })
        ));

        let roomy = MemoryStore::with_capacity(Some(1024 * 1024));
        ensure_capacity(&local, &roomy, std::iter::once(local_root.join("big")))?;
        Ok(())
    }
}
