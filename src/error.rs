//! Failure taxonomy for the cases callers make policy decisions on.
//!
//! Everything else travels as a plain [`anyhow::Error`] chain; these
//! variants are attached as context so tests and drivers can
//! `downcast_ref` when the distinction matters.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("'{0}' is not a file or directory")]
    InvalidInput(Utf8PathBuf),

    #[error("the input '{child}' overlaps with '{parent}'")]
    Overlap {
        child: Utf8PathBuf,
        parent: Utf8PathBuf,
    },

    #[error("not enough space at the destination: {required} required, {available} available")]
    InsufficientSpace { required: String, available: String },

    #[error("errors were encountered while scanning files")]
    ScanFailed,

    #[error("no snapshot was found")]
    MissingSnapshot,

    #[error(
        "a pending snapshot exists for the backup '{0}'; \
         commit it first, or pass --ignore-pending-snapshot to discard it"
    )]
    PendingSnapshotConflict(String),

    #[error("a pending snapshot for the backup '{0}' was not found")]
    MissingPendingSnapshot(String),

    #[error("corrupt content in '{0}': {1}")]
    CorruptArchive(String, String),

    #[error("couldn't decompress the archive in '{0}'")]
    DecompressFailed(String),

    #[error("'{0}' already exists and will not be overwritten")]
    OverwriteBlocked(Utf8PathBuf),
}
