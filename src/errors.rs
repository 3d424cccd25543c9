//! Error types shared across the crawler, the transfer client and the
//! migration pipeline.
//!
//! Every error here is scoped to a single request, branch or job. None of
//! them terminate a crawl or a migration run on their own; the component
//! that owns the loop logs them and moves on.

use std::io;
use thiserror::Error;

/// Failures decoding an annotation document attached to an object.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid date `{value}` in `{field}`, expected YYYY-MM-DDTHH:MM:SS")]
    InvalidDate { field: &'static str, value: String },
    #[error("malformed annotation document: {0}")]
    MalformedXml(#[from] quick_xml::DeError),
    #[error("annotation document is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// Failures decoding a streamed directory listing.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("malformed directory listing: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute in directory listing: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("entry is missing the `{0}` attribute")]
    MissingAttribute(&'static str),
    #[error("entry `{name}` has an invalid size `{value}`")]
    InvalidSize { name: String, value: String },
    #[error("listing ended inside directory `{0}`")]
    Truncated(String),
}

/// Failures talking to the source namespace.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("bad request status {status} for {url}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Status {
        url: String,
        status: u16,
        message: Option<String>,
    },
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {header} header `{value}`")]
    InvalidHeader { header: &'static str, value: String },
    #[error("negative annotation length: total {total} bytes is smaller than object size {object_size}")]
    NegativeAnnotation { total: u64, object_size: u64 },
    #[error("annotation of {length} bytes exceeds the {limit} byte limit")]
    AnnotationTooLarge { length: u64, limit: u64 },
    #[error("failed reading annotation prefix: {0}")]
    Annotation(#[source] io::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Failures on the destination side of a migration.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("failed to head {bucket}/{key}: {source}")]
    Head {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to upload {bucket}/{key}: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures abandoning one crawl branch, or the crawl itself.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Listing(#[from] ListingError),
    #[error("failed writing listing output: {0}")]
    Output(#[from] io::Error),
    #[error("crawl coordinator failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure of a single migration job. Rendered verbatim into the failure log.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

/// Failures of the pipeline as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open {path}: {source}")]
    OpenLog {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed writing outcome log: {0}")]
    Log(#[source] io::Error),
    #[error("failed reading job list: {0}")]
    Input(#[source] io::Error),
    #[error("migration queue is closed")]
    QueueClosed,
    #[error("transfer worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
