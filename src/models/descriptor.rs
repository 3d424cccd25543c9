//! The protocol-agnostic description of an object being migrated.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::{collections::BTreeMap, io};

/// Streamed object payload. Never buffered in full.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

/// Everything the destination needs to know about an object, resolved from
/// the source response headers and (optionally) its annotation document.
#[derive(Serialize, Clone, Debug)]
pub struct ObjectDescriptor {
    /// Destination key.
    pub key: String,

    /// Path of the object in the source namespace.
    pub source_path: String,

    /// Payload size in bytes, excluding any annotation prefix.
    pub size: u64,

    /// Source-side entity tag, quotes stripped.
    pub etag: Option<String>,

    pub last_modified: DateTime<Utc>,

    pub content_type: Option<String>,

    /// Metadata derived from the annotation document, keys carry the
    /// `x-amz-meta-` prefix.
    pub user_metadata: BTreeMap<String, String>,
}

/// An object fetched from the source: its descriptor plus the remaining
/// payload stream.
pub struct FetchedObject {
    pub descriptor: ObjectDescriptor,
    pub body: PayloadStream,
}
