//! src/services/destination/local.rs
//!
//! LocalDestination — writes migrated objects to local disk with an SQLite
//! index. Payloads live under `base_path/objects/{shard}/{shard}/{key}`; the
//! `objects` table records size, MD5 etag, content type, source provenance
//! and user metadata for each key, and answers existence checks.

use super::{Destination, stored_metadata};
use crate::{
    errors::DestinationError,
    models::{
        descriptor::{ObjectDescriptor, PayloadStream},
        object::StoredObject,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const INDEX_FILE: &str = "index.db";
const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct LocalDestination {
    /// Shared SQLite pool for the object index.
    pub db: SqlitePool,

    /// Base directory; payloads go under `objects/`.
    pub base_path: PathBuf,
}

impl LocalDestination {
    /// Open (creating if needed) a local destination rooted at `base_path`.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, DestinationError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::new()
            .filename(base_path.join(INDEX_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let destination = Self { db, base_path };
        destination.apply_schema().await?;
        info!(path = %destination.base_path.display(), "local destination ready");
        Ok(destination)
    }

    async fn apply_schema(&self) -> Result<(), DestinationError> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("applying {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    /// Rejects keys that are empty, absolute, contain `..` or control bytes.
    fn ensure_key_safe(key: &str) -> Result<(), DestinationError> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(DestinationError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), `00`–`ff` each.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// On-disk payload path for a key. Parent directories may not exist yet.
    pub fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.join("objects");
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Index record for a key, if the key has been written.
    pub async fn get(&self, key: &str) -> Result<Option<StoredObject>, DestinationError> {
        let object = sqlx::query_as::<_, StoredObject>(
            "SELECT id, key, filename, content_type, size_bytes, etag, source_etag,
                    source_last_modified, stored_at, metadata
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(object)
    }

    /// Stream a payload into a temp file next to its final location,
    /// computing size and MD5 on the way, then rename into place.
    async fn write_payload(
        &self,
        file_path: &Path,
        mut body: PayloadStream,
    ) -> Result<(i64, String), DestinationError> {
        let parent = file_path.parent().ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "object path missing parent directory")
        })?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        let written: io::Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn describe(&self) -> String {
        format!("local store at {}", self.base_path.display())
    }

    async fn exists(&self, key: &str) -> Result<bool, DestinationError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM objects WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(found.is_some())
    }

    async fn put(
        &self,
        descriptor: &ObjectDescriptor,
        body: PayloadStream,
    ) -> Result<u64, DestinationError> {
        let key = descriptor.key.as_str();
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let (size_bytes, etag) = self.write_payload(&file_path, body).await?;

        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        let metadata = serde_json::to_string(&stored_metadata(descriptor))?;

        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (
                id, key, filename, content_type, size_bytes, etag,
                source_etag, source_last_modified, stored_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                source_etag = excluded.source_etag,
                source_last_modified = excluded.source_last_modified,
                stored_at = excluded.stored_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(&filename)
        .bind(descriptor.content_type.clone())
        .bind(size_bytes)
        .bind(&etag)
        .bind(descriptor.etag.clone())
        .bind(descriptor.last_modified)
        .bind(Utc::now())
        .bind(&metadata)
        .execute(&self.db)
        .await;

        if let Err(err) = upsert {
            let _ = fs::remove_file(&file_path).await;
            return Err(err.into());
        }

        debug!(key = %key, size = size_bytes, etag = %etag, "stored object");
        Ok(u64::try_from(size_bytes).unwrap_or_default())
    }
}
