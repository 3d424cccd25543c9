//! Represents an object written by the local destination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A migrated object as recorded in the local destination's SQLite index.
///
/// The struct stores metadata only; the payload lives on disk under the
/// sharded object directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Destination key (path-like identifier).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type) reported by the source.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload as written.
    pub etag: String,

    /// Entity tag the source reported for the object.
    pub source_etag: Option<String>,

    /// Modification time the source reported for the object.
    pub source_last_modified: DateTime<Utc>,

    /// When the object was written locally.
    pub stored_at: DateTime<Utc>,

    /// User metadata as a JSON object.
    pub metadata: String,
}
