#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

pub fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_owned()).expect("test paths are UTF-8")
}

/// The seed tree: `one/A` (5 B), `one/BC` (6 B), `two/File1` (9 B),
/// each file containing its own relative path.
pub fn build_source_tree(root: &Utf8Path) -> Result<()> {
    fs::create_dir_all(root.join("one"))?;
    fs::create_dir_all(root.join("two"))?;
    fs::write(root.join("one/A"), "one/A")?;
    fs::write(root.join("one/BC"), "one/BC")?;
    fs::write(root.join("two/File1"), "two/File1")?;
    Ok(())
}

/// Every file under `root`, keyed by relative path, mapped to its bytes.
pub fn read_tree(root: &Utf8Path) -> BTreeMap<String, Vec<u8>> {
    let mut tree = BTreeMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry.expect("couldn't walk dir");
        if !entry.file_type().is_file() {
            continue;
        }
        let path = utf8(entry.path());
        let relative = path.strip_prefix(root).unwrap().to_string();
        tree.insert(relative, fs::read(entry.path()).expect("couldn't read file"));
    }
    tree
}

pub fn sha512_hex(bytes: &[u8]) -> String {
    duffel::hashing::hash_reader(bytes, |_| ()).unwrap()
}

/// The content-addressed blob names (128-hex leaves) in one offsite run
/// directory.
pub fn content_blobs(run_dir: &Utf8Path) -> Vec<String> {
    let mut blobs = Vec::new();
    for entry in WalkDir::new(run_dir) {
        let entry = entry.expect("couldn't walk dir");
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.len() == 128 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
            blobs.push(name);
        }
    }
    blobs.sort();
    blobs
}

/// Names of the entries directly under `dir`, sorted.
pub fn dir_names(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("couldn't read dir")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn have_7z() -> bool {
    duffel::archive::zip_binary().is_ok()
}
