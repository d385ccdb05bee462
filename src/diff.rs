//! Diffs two snapshots into a minimal, ordered list of add/modify/remove
//! operations.
//!
//! The recursion walks paired nodes and returns the diffs plus a verdict
//! for the pair: if every entry under a directory was removed (and nobody
//! explicitly asked for that directory), the child-level removes collapse
//! into one remove of the directory itself.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

use crate::snapshot::{Node, Snapshot};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiffOp {
    Remove,
    Add,
    Modify,
}

impl DiffOp {
    pub fn name(&self) -> &'static str {
        match self {
            DiffOp::Remove => "remove",
            DiffOp::Add => "add",
            DiffOp::Modify => "modify",
        }
    }
}

/// What sat at a path on one side of a diff.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EntryInfo {
    File { hash: String, size: u64 },
    Dir,
}

impl EntryInfo {
    fn of(node: &Node) -> Self {
        match node.file_hash() {
            Some(hash) => EntryInfo::File {
                hash: hash.to_owned(),
                size: node.file_size().unwrap(),
            },
            None => EntryInfo::Dir,
        }
    }

    pub fn file_hash(&self) -> Option<&str> {
        match self {
            EntryInfo::File { hash, .. } => Some(hash),
            EntryInfo::Dir => None,
        }
    }

    pub fn file_size(&self) -> Option<u64> {
        match self {
            EntryInfo::File { size, .. } => Some(*size),
            EntryInfo::Dir => None,
        }
    }
}

/// One difference between two snapshots.
///
/// `this` is present for adds and modifies, `other` for removes and
/// modifies.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Diff {
    pub op: DiffOp,
    pub path: Utf8PathBuf,
    pub this: Option<EntryInfo>,
    pub other: Option<EntryInfo>,
}

impl Diff {
    fn add(path: Utf8PathBuf, this: &Node) -> Self {
        Self {
            op: DiffOp::Add,
            path,
            this: Some(EntryInfo::of(this)),
            other: None,
        }
    }

    fn remove(path: Utf8PathBuf, other: &Node) -> Self {
        Self {
            op: DiffOp::Remove,
            path,
            this: None,
            other: Some(EntryInfo::of(other)),
        }
    }

    fn modify(path: Utf8PathBuf, this: &Node, other: &Node) -> Self {
        Self {
            op: DiffOp::Modify,
            path,
            this: Some(EntryInfo::of(this)),
            other: Some(EntryInfo::of(other)),
        }
    }
}

type FileCompare<'a> = &'a dyn Fn(&Node, &Node) -> bool;

fn diff_nodes(
    this: &Node,
    other: Option<&Node>,
    path: &Utf8Path,
    compare: FileCompare,
) -> (Vec<Diff>, Option<DiffOp>) {
    let mut diffs = Vec::new();

    let Some(other) = other else {
        // Nothing on the other side: everything here is new. A directory
        // with contents adds its leaves; the intermediate directories are
        // implied.
        if this.is_dir() && !this.children.is_empty() {
            for (name, child) in &this.children {
                diffs.extend(diff_nodes(child, None, &path.join(name), compare).0);
            }
        } else {
            diffs.push(Diff::add(path.to_owned(), this));
        }
        return (diffs, Some(DiffOp::Add));
    };

    if this.is_file() || other.is_file() {
        if this.is_file() && other.is_file() {
            if compare(this, other) {
                return (diffs, None);
            }
            diffs.push(Diff::modify(path.to_owned(), this, other));
        } else {
            // The type changed: out with the old, in with the new.
            diffs.push(Diff::remove(path.to_owned(), other));
            diffs.extend(diff_nodes(this, None, path, compare).0);
        }
        return (diffs, Some(DiffOp::Modify));
    }

    // Two directories.
    fn merge(acc: &mut Option<DiffOp>, op: DiffOp) {
        match *acc {
            None => *acc = Some(op),
            Some(prior) if prior == op => {}
            Some(_) => *acc = Some(DiffOp::Modify),
        }
    }
    let mut verdict: Option<DiffOp> = None;
    let mut saw_unchanged = false;

    for (name, other_child) in &other.children {
        if this.children.contains_key(name) {
            continue;
        }
        diffs.push(Diff::remove(path.join(name), other_child));
        merge(&mut verdict, DiffOp::Remove);
    }

    for (name, this_child) in &this.children {
        let (child_diffs, child_verdict) =
            diff_nodes(this_child, other.children.get(name), &path.join(name), compare);
        diffs.extend(child_diffs);
        match child_verdict {
            Some(op) => merge(&mut verdict, op),
            None => saw_unchanged = true,
        }
    }

    if verdict == Some(DiffOp::Remove) {
        if saw_unchanged || this.explicitly_added() || other.explicitly_added() {
            // Something under here survives (or the directory itself was
            // asked for); keep the child-level removes and call the
            // directory modified.
            verdict = Some(DiffOp::Modify);
        } else {
            // Everything under here went away: one remove says it all.
            diffs = vec![Diff::remove(path.to_owned(), other)];
        }
    }

    debug_assert_eq!(verdict.is_none(), diffs.is_empty());
    (diffs, verdict)
}

impl Snapshot {
    /// Enumerates the differences between two snapshots.
    ///
    /// Files are equal when their hashes match, or their sizes when
    /// `compare_hashes` is off.
    pub fn diff(&self, other: &Snapshot, compare_hashes: bool) -> Vec<Diff> {
        fn hashes_equal(a: &Node, b: &Node) -> bool {
            a.file_hash() == b.file_hash()
        }
        fn sizes_equal(a: &Node, b: &Node) -> bool {
            a.file_size() == b.file_size()
        }
        let compare: FileCompare = if compare_hashes {
            &hashes_equal
        } else {
            &sizes_equal
        };
        diff_nodes(&self.root, Some(&other.root), Utf8Path::new(""), compare).0
    }
}

/// Diffs split by operation. Order matters to appliers:
/// removes happen before adds.
#[derive(Debug, Default)]
pub struct DiffGroups {
    pub remove: Vec<Diff>,
    pub add: Vec<Diff>,
    pub modify: Vec<Diff>,
}

impl DiffGroups {
    pub fn new(diffs: Vec<Diff>) -> Self {
        let mut groups = Self::default();
        for diff in diffs {
            match diff.op {
                DiffOp::Remove => groups.remove.push(diff),
                DiffOp::Add => groups.add.push(diff),
                DiffOp::Modify => groups.modify.push(diff),
            }
        }
        groups
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty() && self.modify.is_empty()
    }

    pub fn len(&self) -> usize {
        self.remove.len() + self.add.len() + self.modify.len()
    }

    /// All groups flattened in apply order (remove, add, modify),
    /// each sorted by path.
    pub fn sorted(mut self) -> Vec<Diff> {
        let mut flat = Vec::with_capacity(self.len());
        for group in [&mut self.remove, &mut self.add, &mut self.modify] {
            group.sort_by(|a, b| a.path.cmp(&b.path));
            flat.append(group);
        }
        flat
    }
}

/// The wire form used in offsite `index.json` files.
#[derive(Debug, Serialize, Deserialize)]
struct DiffJson {
    operation: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    this_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    this_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other_file_size: Option<u64>,
}

impl From<&Diff> for DiffJson {
    fn from(diff: &Diff) -> Self {
        let file_parts = |side: &Option<EntryInfo>| match side {
            Some(EntryInfo::File { hash, size }) => (Some(hash.clone()), Some(*size)),
            _ => (None, None),
        };
        let (this_hash, this_file_size) = file_parts(&diff.this);
        let (other_hash, other_file_size) = file_parts(&diff.other);
        Self {
            operation: diff.op.name().to_owned(),
            path: diff.path.as_str().to_owned(),
            this_hash,
            this_file_size,
            other_hash,
            other_file_size,
        }
    }
}

impl TryFrom<DiffJson> for Diff {
    type Error = anyhow::Error;

    fn try_from(json: DiffJson) -> Result<Self> {
        let this_file = json.this_hash.map(|hash| EntryInfo::File {
            hash,
            size: json.this_file_size.unwrap_or_default(),
        });
        let other_file = json.other_hash.map(|hash| EntryInfo::File {
            hash,
            size: json.other_file_size.unwrap_or_default(),
        });

        let (op, this, other) = match json.operation.as_str() {
            "add" => (DiffOp::Add, Some(this_file.unwrap_or(EntryInfo::Dir)), None),
            "modify" => (
                DiffOp::Modify,
                Some(this_file.context("modify without this_hash")?),
                Some(other_file.context("modify without other_hash")?),
            ),
            "remove" => (
                DiffOp::Remove,
                None,
                Some(other_file.unwrap_or(EntryInfo::Dir)),
            ),
            unknown => bail!("'{unknown}' is not a diff operation"),
        };

        Ok(Self {
            op,
            path: Utf8PathBuf::from(json.path),
            this,
            other,
        })
    }
}

/// Serializes grouped diffs as the offsite index:
/// a flat JSON array, removes then adds then modifies, path-sorted within
/// each group.
pub fn to_index_json(groups: DiffGroups) -> Result<Vec<u8>> {
    let wire: Vec<DiffJson> = groups.sorted().iter().map(DiffJson::from).collect();
    Ok(serde_json::to_vec(&wire)?)
}

pub fn from_index_json(bytes: &[u8]) -> Result<Vec<Diff>> {
    let wire: Vec<DiffJson> = serde_json::from_slice(bytes).context("Not a valid index")?;
    wire.into_iter().map(Diff::try_from).collect()
}
