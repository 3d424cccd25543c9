//! Destination stores a migration can write to.

use crate::{
    errors::DestinationError,
    models::{
        descriptor::{ObjectDescriptor, PayloadStream},
        document::METADATA_PREFIX,
    },
};
use async_trait::async_trait;
use std::collections::HashMap;

pub mod local;
pub mod s3;

pub use local::LocalDestination;
pub use s3::{S3Destination, S3Settings};

/// Provenance field carrying the source entity tag.
pub const SOURCE_ETAG: &str = "source-etag";
/// Provenance field carrying the source modification time (RFC 3339).
pub const SOURCE_MTIME: &str = "source-mtime";

/// Where migrated objects end up.
///
/// `exists` followed by `put` is check-then-act; two runs racing on the same
/// key may both upload.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    async fn exists(&self, key: &str) -> Result<bool, DestinationError>;

    /// Stream the payload under `descriptor.key`. Returns the bytes written.
    async fn put(
        &self,
        descriptor: &ObjectDescriptor,
        body: PayloadStream,
    ) -> Result<u64, DestinationError>;
}

/// User metadata as stored by the destination: the `x-amz-meta-` prefix is
/// dropped (the S3 API adds it back on the wire) and the provenance fields
/// are added.
pub fn stored_metadata(descriptor: &ObjectDescriptor) -> HashMap<String, String> {
    let mut metadata: HashMap<String, String> = descriptor
        .user_metadata
        .iter()
        .map(|(key, value)| {
            let key = key.strip_prefix(METADATA_PREFIX).unwrap_or(key);
            (key.to_string(), value.clone())
        })
        .collect();
    if let Some(etag) = &descriptor.etag {
        metadata.insert(SOURCE_ETAG.to_string(), etag.clone());
    }
    metadata.insert(
        SOURCE_MTIME.to_string(),
        descriptor.last_modified.to_rfc3339(),
    );
    metadata
}
