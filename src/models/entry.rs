//! Directory listing entries as decoded from the source namespace.

use serde::Serialize;

/// What a listing entry refers to.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Directory,
    /// Symlinks and anything else the namespace reports. Not migrated.
    Other(String),
}

impl EntryKind {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "object" => Self::Object,
            "directory" => Self::Directory,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single child of a directory listing.
///
/// Immutable once the decoder has produced it; `object_path` is derived at
/// decode time from the enclosing directory's path.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// URL-encoded name relative to the parent directory.
    pub url_name: String,

    /// Human-readable name, when the namespace reports one.
    pub utf8_name: Option<String>,

    pub kind: EntryKind,

    /// Object size in bytes. Absent for directories.
    pub size: Option<i64>,

    pub hash_scheme: Option<String>,
    pub hash: Option<String>,

    /// Whether the object carries custom metadata annotations.
    pub custom_metadata: bool,

    /// `join(parent directory path, url_name)`.
    pub object_path: String,
}

/// One decoded `directory` element: its own path and its children in
/// document order.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<Entry>,
}
