//! S3-compatible destination (MinIO and friends).

use super::{Destination, stored_metadata};
use crate::{
    errors::DestinationError,
    models::descriptor::{ObjectDescriptor, PayloadStream},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region, RequestChecksumCalculation, StalledStreamProtectionConfig},
    operation::head_object::HeadObjectError,
};
use aws_smithy_types::byte_stream::ByteStream;
use futures::StreamExt;
use http_body::Frame;
use http_body_util::StreamBody;
use std::{env, fmt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// Chunks buffered between the source stream and the upload body.
const PUMP_DEPTH: usize = 8;

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

impl S3Settings {
    /// Reads `MINIO_ENDPOINT`, `MINIO_ACCESS_KEY`, `MINIO_SECRET_KEY`,
    /// `MINIO_BUCKET` and the optional `MINIO_REGION`.
    pub fn from_env() -> Result<Self, DestinationError> {
        Ok(Self {
            endpoint: require_env("MINIO_ENDPOINT")?,
            access_key: require_env("MINIO_ACCESS_KEY")?,
            secret_key: require_env("MINIO_SECRET_KEY")?,
            bucket: require_env("MINIO_BUCKET")?,
            region: env::var("MINIO_REGION")
                .ok()
                .filter(|region| !region.is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        })
    }
}

fn require_env(name: &'static str) -> Result<String, DestinationError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(DestinationError::MissingEnv(name))
}

pub struct S3Destination {
    client: aws_sdk_s3::Client,
    bucket: String,
    endpoint: String,
}

impl S3Destination {
    pub fn new(settings: S3Settings) -> Self {
        let creds = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "hcp-migrate-env",
        );
        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(&settings.endpoint)
            .region(Region::new(settings.region))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: settings.bucket,
            endpoint: settings.endpoint,
        }
    }
}

#[async_trait]
impl Destination for S3Destination {
    fn describe(&self) -> String {
        format!("s3://{}/ at {}", self.bucket, self.endpoint)
    }

    async fn exists(&self, key: &str) -> Result<bool, DestinationError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Ok(false);
                }
                Err(DestinationError::Head {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn put(
        &self,
        descriptor: &ObjectDescriptor,
        mut body: PayloadStream,
    ) -> Result<u64, DestinationError> {
        let content_length =
            i64::try_from(descriptor.size).map_err(|_| DestinationError::Upload {
                bucket: self.bucket.clone(),
                key: descriptor.key.clone(),
                source: format!("object size {} out of range", descriptor.size).into(),
            })?;

        // The SDK body must be Sync; hand chunks over through a channel.
        let (tx, rx) = mpsc::channel(PUMP_DEPTH);
        let pump = tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });
        let frames = ReceiverStream::new(rx).map(|chunk| chunk.map(Frame::data));
        let stream = ByteStream::from_body_1_x(StreamBody::new(frames));

        debug!(bucket = %self.bucket, key = %descriptor.key, size = descriptor.size, "uploading");
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&descriptor.key)
            .content_length(content_length)
            .set_content_type(descriptor.content_type.clone())
            .set_metadata(Some(stored_metadata(descriptor)))
            .body(stream)
            .send()
            .await;
        pump.abort();

        result.map_err(|err| DestinationError::Upload {
            bucket: self.bucket.clone(),
            key: descriptor.key.clone(),
            source: Box::new(err),
        })?;
        Ok(descriptor.size)
    }
}
