//! The local filesystem, wrapped in the [`FileStore`] interface.

use std::fs::{self, File};
use std::io::{self, prelude::*};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use super::{FileStore, ItemType, WalkEntry, is_descendant};
use crate::error::Error;

pub struct LocalFileStore {
    working_dir: Mutex<Utf8PathBuf>,
    ssd: bool,
    /// Tests can pretend we're on some other drive.
    local_override: Option<bool>,
}

impl LocalFileStore {
    pub fn new(root: Utf8PathBuf, ssd: bool, local_override: Option<bool>) -> Self {
        // Anchor relative roots now so saving and restoring the working
        // directory round-trips.
        let root = if root.as_str().is_empty() || root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self {
            working_dir: Mutex::new(root),
            ssd,
            local_override,
        }
    }

    /// A store rooted at the current directory,
    /// for sources given as absolute paths.
    pub fn here(ssd: bool) -> Self {
        Self::new(Utf8PathBuf::new(), ssd, None)
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.working_dir.lock().unwrap().join(path)
    }

    fn walk_into(&self, dir: &Utf8Path, entries: &mut Vec<WalkEntry>) -> Result<()> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        let listing = fs::read_dir(dir).with_context(|| format!("Couldn't read {dir}"))?;
        for entry in listing {
            let entry = entry?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| anyhow::anyhow!("{:?} in {dir} isn't UTF-8", n))?;
            // file_type() doesn't follow symlinks,
            // so links to directories land in `files` and are never descended.
            if entry.file_type()?.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();

        let subdirs: Vec<Utf8PathBuf> = dirs.iter().map(|d| dir.join(d)).collect();
        entries.push(WalkEntry {
            root: dir.to_owned(),
            dirs,
            files,
        });
        for subdir in subdirs {
            self.walk_into(&subdir, entries)?;
        }
        Ok(())
    }
}

impl FileStore for LocalFileStore {
    fn describe(&self) -> String {
        format!("local filesystem at {}", self.working_dir.lock().unwrap())
    }

    fn is_local_filesystem(&self) -> bool {
        self.local_override.unwrap_or(true)
    }

    fn execute_in_parallel(&self) -> bool {
        self.ssd
    }

    fn validate_backup_inputs(&self, inputs: &[Utf8PathBuf]) -> Result<()> {
        let working_dir = self.working_dir.lock().unwrap().clone();

        for input in inputs {
            let input_dir = match self.item_type(input)? {
                Some(ItemType::File) => input.parent().unwrap_or(input).to_owned(),
                Some(ItemType::Dir) => input.clone(),
                _ => bail!(Error::InvalidInput(input.clone())),
            };

            if is_descendant(&working_dir, &input_dir) {
                bail!(Error::Overlap {
                    child: working_dir,
                    parent: input.clone(),
                });
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn bytes_available(&self) -> Result<Option<u64>> {
        // Find a directory that exists; the destination may not yet.
        let working_dir = self.working_dir.lock().unwrap().clone();
        let cwd = Utf8PathBuf::from(".");
        let existing = std::iter::once(working_dir.as_path())
            .chain(working_dir.ancestors().skip(1))
            .chain(std::iter::once(cwd.as_path()))
            .find(|d| !d.as_str().is_empty() && d.is_dir());

        match existing {
            Some(dir) => {
                let stat = rustix::fs::statvfs(dir.as_std_path())
                    .with_context(|| format!("statvfs({dir}) failed"))?;
                Ok(Some(stat.f_bavail * stat.f_frsize))
            }
            None => Ok(None),
        }
    }

    #[cfg(not(unix))]
    fn bytes_available(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn working_dir(&self) -> Utf8PathBuf {
        self.working_dir.lock().unwrap().clone()
    }

    fn set_working_dir(&self, path: &Utf8Path) -> Result<()> {
        *self.working_dir.lock().unwrap() = path.to_owned();
        Ok(())
    }

    fn item_type(&self, path: &Utf8Path) -> Result<Option<ItemType>> {
        let path = self.resolve(path);
        match path.symlink_metadata() {
            Ok(meta) => Ok(Some(if meta.is_symlink() {
                ItemType::Symlink
            } else if meta.is_dir() {
                ItemType::Dir
            } else {
                ItemType::File
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Couldn't stat {path}")),
        }
    }

    fn file_size(&self, path: &Utf8Path) -> Result<u64> {
        let path = self.resolve(path);
        Ok(path
            .metadata()
            .with_context(|| format!("Couldn't stat {path}"))?
            .len())
    }

    fn remove_dir(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        fs::remove_dir_all(&path).with_context(|| format!("Couldn't remove {path}"))
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        fs::remove_file(&path).with_context(|| format!("Couldn't remove {path}"))
    }

    fn make_dirs(&self, path: &Utf8Path) -> Result<()> {
        let path = self.resolve(path);
        if path.as_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&path).with_context(|| format!("Couldn't create {path}"))
    }

    fn read(&self, path: &Utf8Path) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(path);
        let fh = File::open(&path).with_context(|| format!("Couldn't open {path}"))?;
        Ok(Box::new(fh))
    }

    fn write(&self, path: &Utf8Path) -> Result<Box<dyn Write + Send>> {
        let path = self.resolve(path);
        let fh = File::create(&path).with_context(|| format!("Couldn't create {path}"))?;
        Ok(Box::new(fh))
    }

    fn rename(&self, old: &Utf8Path, new: &Utf8Path) -> Result<()> {
        let old = self.resolve(old);
        let new = self.resolve(new);

        // Renames replace whatever is at the destination.
        match self.item_type(&new)? {
            Some(ItemType::Dir) => fs::remove_dir_all(&new)
                .with_context(|| format!("Couldn't clear {new} before rename"))?,
            Some(_) => fs::remove_file(&new)
                .with_context(|| format!("Couldn't clear {new} before rename"))?,
            None => {}
        }

        fs::rename(&old, &new).with_context(|| format!("Couldn't rename {old} to {new}"))
    }

    fn walk(&self, path: &Utf8Path) -> Result<Vec<WalkEntry>> {
        let start = self.resolve(path);
        let mut entries = Vec::new();
        if start.is_dir() {
            self.walk_into(&start, &mut entries)?;
        }
        Ok(entries)
    }
}
