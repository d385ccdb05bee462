//! Tools for hashing everything we care about with the one true hash.
//!
//! File contents, offsite indexes, and the content-addressed store all key
//! off lowercase SHA-512 hex.

use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result};
use camino::Utf8Path;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha512};

use crate::store::FileStore;

/// All streaming I/O moves in chunks of this size,
/// with progress reported at chunk boundaries.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Stored in place of a hash when a scan was asked not to calculate them.
pub const NOT_CALCULATED: &str = "not calculated";

/// Hashes the reader to completion, calling `progress` with the running
/// byte count after each chunk.
pub fn hash_reader<R: Read>(mut r: R, mut progress: impl FnMut(u64)) -> Result<String> {
    let mut hasher = Sha512::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut hashed: u64 = 0;

    loop {
        let count = r.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
        hashed += count as u64;
        progress(hashed);
    }

    Ok(HEXLOWER.encode(&hasher.finalize()))
}

/// Hashes a file in the given store.
pub fn hash_file(
    store: &dyn FileStore,
    path: &Utf8Path,
    progress: impl FnMut(u64),
) -> Result<String> {
    let reader = store
        .read(path)
        .with_context(|| format!("Couldn't open {path} for hashing"))?;
    hash_reader(reader, progress).with_context(|| format!("Couldn't hash {path}"))
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha512,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
        }
    }

    pub fn finalize(self) -> (String, R) {
        (HEXLOWER.encode(&self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}
