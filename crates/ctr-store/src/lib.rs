//! Mapping-table persistence, raw snapshot archive and document fetch.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctr_core::{ExternalKey, Mapping, NodeType};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctr-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing to map {node_type} {key} to an empty internal id")]
    EmptyInternalId { node_type: NodeType, key: ExternalKey },
    #[error("mapping row {id} carries unknown node type {found:?}")]
    UnknownNodeType { id: i64, found: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persistent table of (type, external key) -> internal id.
///
/// The only source of cross-run identity continuity; the reconciler refreshes
/// rows on every visit and the retirement resolver prunes the rest.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
    ) -> Result<Option<Mapping>, StoreError>;

    /// Create or refresh a mapping. Writing an internal id of zero is always
    /// an error; a stale row must be removed, never blanked.
    async fn upsert(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
        internal_id: i64,
    ) -> Result<Mapping, StoreError>;

    async fn remove(&self, node_type: NodeType, key: &ExternalKey) -> Result<(), StoreError>;

    async fn by_type(&self, node_type: NodeType) -> Result<Vec<Mapping>, StoreError>;

    async fn by_internal_id(
        &self,
        node_type: NodeType,
        internal_id: i64,
    ) -> Result<Option<Mapping>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    rows: Vec<Mapping>,
}

/// Mutex'd in-memory mapping store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mapping store lock").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
    ) -> Result<Option<Mapping>, StoreError> {
        let inner = self.inner.lock().expect("mapping store lock");
        Ok(inner
            .rows
            .iter()
            .find(|m| {
                m.node_type == node_type
                    && m.source_id == key.source_id
                    && m.item_id == key.item_id
            })
            .cloned())
    }

    async fn upsert(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
        internal_id: i64,
    ) -> Result<Mapping, StoreError> {
        if internal_id == 0 {
            return Err(StoreError::EmptyInternalId {
                node_type,
                key: key.clone(),
            });
        }
        let now = Utc::now().timestamp();
        let mut inner = self.inner.lock().expect("mapping store lock");
        if let Some(row) = inner.rows.iter_mut().find(|m| {
            m.node_type == node_type && m.source_id == key.source_id && m.item_id == key.item_id
        }) {
            row.internal_id = internal_id;
            row.time_modified = now;
            return Ok(row.clone());
        }
        inner.next_id += 1;
        let row = Mapping {
            id: inner.next_id,
            node_type,
            source_id: key.source_id.clone(),
            item_id: key.item_id,
            internal_id,
            time_created: now,
            time_modified: now,
        };
        inner.rows.push(row.clone());
        Ok(row)
    }

    async fn remove(&self, node_type: NodeType, key: &ExternalKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mapping store lock");
        inner.rows.retain(|m| {
            !(m.node_type == node_type
                && m.source_id == key.source_id
                && m.item_id == key.item_id)
        });
        Ok(())
    }

    async fn by_type(&self, node_type: NodeType) -> Result<Vec<Mapping>, StoreError> {
        let inner = self.inner.lock().expect("mapping store lock");
        Ok(inner
            .rows
            .iter()
            .filter(|m| m.node_type == node_type)
            .cloned()
            .collect())
    }

    async fn by_internal_id(
        &self,
        node_type: NodeType,
        internal_id: i64,
    ) -> Result<Option<Mapping>, StoreError> {
        let inner = self.inner.lock().expect("mapping store lock");
        Ok(inner
            .rows
            .iter()
            .find(|m| m.node_type == node_type && m.internal_id == internal_id)
            .cloned())
    }
}

/// Postgres-backed mapping store.
#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the mapping table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ctr_mapping (
                id BIGSERIAL PRIMARY KEY,
                type VARCHAR(10) NOT NULL,
                sourceid VARCHAR(200) NOT NULL,
                itemid BIGINT NOT NULL,
                internalid BIGINT NOT NULL,
                timecreated BIGINT NOT NULL,
                timemodified BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_ctr_mapping_sourceid ON ctr_mapping (sourceid)",
            "CREATE INDEX IF NOT EXISTS idx_ctr_mapping_sourceid_itemid ON ctr_mapping (sourceid, itemid)",
            "CREATE INDEX IF NOT EXISTS idx_ctr_mapping_type ON ctr_mapping (type)",
            "CREATE INDEX IF NOT EXISTS idx_ctr_mapping_internalid ON ctr_mapping (internalid)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_mapping(row: &PgRow) -> Result<Mapping, StoreError> {
    let id: i64 = row.get("id");
    let raw_type: String = row.get("type");
    let node_type = NodeType::parse(&raw_type).ok_or(StoreError::UnknownNodeType {
        id,
        found: raw_type,
    })?;
    Ok(Mapping {
        id,
        node_type,
        source_id: row.get("sourceid"),
        item_id: row.get("itemid"),
        internal_id: row.get("internalid"),
        time_created: row.get("timecreated"),
        time_modified: row.get("timemodified"),
    })
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn get(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
    ) -> Result<Option<Mapping>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM ctr_mapping WHERE type = $1 AND sourceid = $2 AND itemid = $3",
        )
        .bind(node_type.as_str())
        .bind(&key.source_id)
        .bind(key.item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    async fn upsert(
        &self,
        node_type: NodeType,
        key: &ExternalKey,
        internal_id: i64,
    ) -> Result<Mapping, StoreError> {
        if internal_id == 0 {
            return Err(StoreError::EmptyInternalId {
                node_type,
                key: key.clone(),
            });
        }
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE ctr_mapping SET internalid = $4, timemodified = $5
             WHERE type = $1 AND sourceid = $2 AND itemid = $3
             RETURNING *",
        )
        .bind(node_type.as_str())
        .bind(&key.source_id)
        .bind(key.item_id)
        .bind(internal_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = updated {
            return row_to_mapping(&row);
        }
        let inserted = sqlx::query(
            "INSERT INTO ctr_mapping (type, sourceid, itemid, internalid, timecreated, timemodified)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING *",
        )
        .bind(node_type.as_str())
        .bind(&key.source_id)
        .bind(key.item_id)
        .bind(internal_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row_to_mapping(&inserted)
    }

    async fn remove(&self, node_type: NodeType, key: &ExternalKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM ctr_mapping WHERE type = $1 AND sourceid = $2 AND itemid = $3")
            .bind(node_type.as_str())
            .bind(&key.source_id)
            .bind(key.item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn by_type(&self, node_type: NodeType) -> Result<Vec<Mapping>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ctr_mapping WHERE type = $1 ORDER BY id")
            .bind(node_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_mapping).collect()
    }

    async fn by_internal_id(
        &self,
        node_type: NodeType,
        internal_id: i64,
    ) -> Result<Option<Mapping>, StoreError> {
        let row = sqlx::query("SELECT * FROM ctr_mapping WHERE type = $1 AND internalid = $2")
            .bind(node_type.as_str())
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw upstream documents.
///
/// Every fetched XML snapshot is written here before parsing; identical
/// bytes on a later run resolve to the existing file.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let day = fetched_at.format("%Y%m%d").to_string();
        let dir = self.root.join(day);
        let path = dir.join(format!("{content_hash}.xml"));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            return Ok(ArchivedSnapshot {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(ArchivedSnapshot {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedSnapshot {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
                    .with_context(|| format!("renaming snapshot into place at {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// TLS peer verification. Disabling is supported for upstream servers
    /// with broken certificate chains and is logged loudly.
    pub verify_tls: bool,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            verify_tls: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Fetches the upstream taxonomy document over HTTP with retry/backoff.
#[derive(Debug)]
pub struct DocumentFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl DocumentFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.verify_tls {
            warn!("TLS peer verification is disabled for upstream fetches");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetch the document body as text. Retryable statuses and transport
    /// errors are retried with exponential backoff; anything else fails.
    pub async fn fetch_document(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        let span = info_span!("document_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(item_id: i64) -> ExternalKey {
        ExternalKey::new("komet", item_id)
    }

    #[tokio::test]
    async fn memory_store_round_trips_a_mapping() {
        let store = MemoryMappingStore::new();
        let created = store
            .upsert(NodeType::Topic, &key(10), 77)
            .await
            .expect("upsert");
        assert_eq!(created.internal_id, 77);
        assert_eq!(created.time_created, created.time_modified);

        let fetched = store
            .get(NodeType::Topic, &key(10))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched, created);
        assert!(store
            .get(NodeType::Descriptor, &key(10))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn upsert_refreshes_existing_row_in_place() {
        let store = MemoryMappingStore::new();
        let first = store.upsert(NodeType::Subject, &key(3), 5).await.expect("upsert");
        let second = store.upsert(NodeType::Subject, &key(3), 9).await.expect("upsert");
        assert_eq!(first.id, second.id);
        assert_eq!(second.internal_id, 9);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn zero_internal_id_is_rejected() {
        let store = MemoryMappingStore::new();
        store.upsert(NodeType::Topic, &key(10), 77).await.expect("upsert");
        let err = store.upsert(NodeType::Topic, &key(10), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyInternalId { .. }));
        // The existing row is untouched.
        let row = store
            .get(NodeType::Topic, &key(10))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(row.internal_id, 77);
    }

    #[tokio::test]
    async fn by_type_and_by_internal_id_filter_correctly() {
        let store = MemoryMappingStore::new();
        store.upsert(NodeType::Topic, &key(1), 11).await.expect("upsert");
        store.upsert(NodeType::Topic, &key(2), 12).await.expect("upsert");
        store.upsert(NodeType::Descriptor, &key(3), 13).await.expect("upsert");

        let topics = store.by_type(NodeType::Topic).await.expect("by_type");
        assert_eq!(topics.len(), 2);

        let found = store
            .by_internal_id(NodeType::Descriptor, 13)
            .await
            .expect("by_internal_id")
            .expect("present");
        assert_eq!(found.item_id, 3);
        assert!(store
            .by_internal_id(NodeType::Topic, 13)
            .await
            .expect("by_internal_id")
            .is_none());
    }

    #[tokio::test]
    async fn remove_deletes_only_the_matching_row() {
        let store = MemoryMappingStore::new();
        store.upsert(NodeType::Topic, &key(1), 11).await.expect("upsert");
        store.upsert(NodeType::Topic, &key(2), 12).await.expect("upsert");
        store.remove(NodeType::Topic, &key(1)).await.expect("remove");
        assert_eq!(store.len(), 1);
        assert!(store.get(NodeType::Topic, &key(1)).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn snapshot_archive_deduplicates_identical_documents() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(fetched_at, b"<taxonomy/>")
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, b"<taxonomy/>")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
