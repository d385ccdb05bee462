//! An SFTP server as a [`FileStore`].
//!
//! Sessions are single-channel, so everything sits behind one mutex and
//! the store never advertises parallel I/O.

use std::io::prelude::*;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use tracing::*;

use super::{FileStore, ItemType, WalkEntry};

pub const SSH_PORT: u16 = 22;

/// libssh2's "no such file" status.
const FX_NO_SUCH_FILE: i32 = 2;

pub enum Auth {
    Password(String),
    /// PEM contents of a private key file.
    PrivateKey(String),
}

struct Inner {
    sftp: Sftp,
    // The session owns the TCP stream; hold it so the connection lives
    // as long as the store does.
    _session: Session,
    cwd: Utf8PathBuf,
}

pub struct SftpStore {
    inner: Mutex<Inner>,
    host: String,
}

impl SftpStore {
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        auth: Auth,
        working_dir: Option<&Utf8Path>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .with_context(|| format!("Couldn't connect to {host}:{port}"))?;

        let mut session = Session::new().context("Couldn't create an SSH session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {host} failed"))?;

        match auth {
            Auth::Password(password) => session
                .userauth_password(username, &password)
                .with_context(|| format!("Password auth for {username}@{host} failed"))?,
            Auth::PrivateKey(pem) => session
                .userauth_pubkey_memory(username, None, &pem, None)
                .with_context(|| format!("Key auth for {username}@{host} failed"))?,
        }

        let sftp = session
            .sftp()
            .with_context(|| format!("Couldn't open an SFTP channel to {host}"))?;
        debug!("SFTP session to {host}:{port} established");

        Ok(Self {
            inner: Mutex::new(Inner {
                sftp,
                _session: session,
                cwd: working_dir.map(Utf8Path::to_owned).unwrap_or_default(),
            }),
            host: host.to_owned(),
        })
    }

    fn resolve(inner: &Inner, path: &Utf8Path) -> PathBuf {
        inner.cwd.join(path).into_std_path_buf()
    }

    fn stat_type(inner: &Inner, path: &Utf8Path) -> Result<Option<ItemType>> {
        let resolved = Self::resolve(inner, path);
        match inner.sftp.lstat(&resolved) {
            Ok(stat) => Ok(Some(if stat.file_type().is_symlink() {
                ItemType::Symlink
            } else if stat.is_dir() {
                ItemType::Dir
            } else {
                ItemType::File
            })),
            Err(e) if e.code() == ErrorCode::SFTP(FX_NO_SUCH_FILE) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Couldn't stat {path}")),
        }
    }

    fn walk_locked(&self, inner: &Inner, path: &Utf8Path) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        let mut to_search = vec![path.to_owned()];

        while let Some(search_dir) = to_search.pop() {
            if Self::stat_type(inner, &search_dir)? != Some(ItemType::Dir) {
                continue;
            }

            let mut dirs = Vec::new();
            let mut files = Vec::new();

            let listing = inner
                .sftp
                .readdir(&Self::resolve(inner, &search_dir))
                .with_context(|| format!("Couldn't list {search_dir}"))?;
            for (child, stat) in listing {
                let name = child
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow!("{:?} in {search_dir} isn't UTF-8", child))?
                    .to_owned();
                if stat.is_dir() {
                    dirs.push(name);
                } else {
                    files.push(name);
                }
            }
            dirs.sort();
            files.sort();

            to_search.extend(dirs.iter().map(|d| search_dir.join(d)));
            entries.push(WalkEntry {
                root: search_dir,
                dirs,
                files,
            });
        }
        Ok(entries)
    }

    fn remove_dir_locked(&self, inner: &Inner, path: &Utf8Path) -> Result<()> {
        // The protocol only removes empty directories, so empty them
        // bottom-up first. No harm if the directory is already gone.
        if Self::stat_type(inner, path)?.is_none() {
            return Ok(());
        }

        let entries = self.walk_locked(inner, path)?;
        for entry in &entries {
            for file in &entry.files {
                let file = entry.root.join(file);
                inner
                    .sftp
                    .unlink(&Self::resolve(inner, &file))
                    .with_context(|| format!("Couldn't remove {file}"))?;
            }
        }
        for entry in entries.iter().rev() {
            inner
                .sftp
                .rmdir(&Self::resolve(inner, &entry.root))
                .with_context(|| format!("Couldn't remove {}", entry.root))?;
        }
        Ok(())
    }
}

impl FileStore for SftpStore {
    fn describe(&self) -> String {
        format!("SFTP server {}", self.host)
    }

    fn bytes_available(&self) -> Result<Option<u64>> {
        // No API for this.
        Ok(None)
    }

    fn working_dir(&self) -> Utf8PathBuf {
        self.inner.lock().unwrap().cwd.clone()
    }

    fn set_working_dir(&self, path: &Utf8Path) -> Result<()> {
        self.inner.lock().unwrap().cwd = path.to_owned();
        Ok(())
    }

    fn item_type(&self, path: &Utf8Path) -> Result<Option<ItemType>> {
        let inner = self.inner.lock().unwrap();
        Self::stat_type(&inner, path)
    }

    fn file_size(&self, path: &Utf8Path) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let stat = inner
            .sftp
            .stat(&Self::resolve(&inner, path))
            .with_context(|| format!("Couldn't stat {path}"))?;
        stat.size
            .ok_or_else(|| anyhow!("No size reported for {path}"))
    }

    fn remove_dir(&self, path: &Utf8Path) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        self.remove_dir_locked(&inner, path)
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        match inner.sftp.unlink(&Self::resolve(&inner, path)) {
            Ok(()) => Ok(()),
            // Nothing there? Nothing to do.
            Err(e) if e.code() == ErrorCode::SFTP(FX_NO_SUCH_FILE) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Couldn't remove {path}")),
        }
    }

    fn make_dirs(&self, path: &Utf8Path) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let full = inner.cwd.join(path);

        let mut ancestors: Vec<&Utf8Path> = full.ancestors().collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if ancestor.as_str().is_empty() || ancestor == "/" {
                continue;
            }
            match inner.sftp.lstat(ancestor.as_std_path()) {
                Ok(_) => continue,
                Err(_) => inner
                    .sftp
                    .mkdir(ancestor.as_std_path(), 0o755)
                    .with_context(|| format!("Couldn't create {ancestor}"))?,
            }
        }
        Ok(())
    }

    fn read(&self, path: &Utf8Path) -> Result<Box<dyn Read + Send>> {
        let inner = self.inner.lock().unwrap();
        let fh = inner
            .sftp
            .open(&Self::resolve(&inner, path))
            .with_context(|| format!("Couldn't open {path}"))?;
        Ok(Box::new(fh))
    }

    fn write(&self, path: &Utf8Path) -> Result<Box<dyn Write + Send>> {
        let inner = self.inner.lock().unwrap();
        let fh = inner
            .sftp
            .open_mode(
                &Self::resolve(&inner, path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .with_context(|| format!("Couldn't create {path}"))?;
        Ok(Box::new(fh))
    }

    fn rename(&self, old: &Utf8Path, new: &Utf8Path) -> Result<()> {
        let inner = self.inner.lock().unwrap();

        // Renames replace; clear the destination first.
        match Self::stat_type(&inner, new)? {
            Some(ItemType::Dir) => self.remove_dir_locked(&inner, new)?,
            Some(_) => inner
                .sftp
                .unlink(&Self::resolve(&inner, new))
                .with_context(|| format!("Couldn't clear {new} before rename"))?,
            None => {}
        }

        inner
            .sftp
            .rename(
                &Self::resolve(&inner, old),
                &Self::resolve(&inner, new),
                None,
            )
            .with_context(|| format!("Couldn't rename {old} to {new}"))
    }

    fn walk(&self, path: &Utf8Path) -> Result<Vec<WalkEntry>> {
        let inner = self.inner.lock().unwrap();
        self.walk_locked(&inner, path)
    }
}
