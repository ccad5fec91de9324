//! Record persistence and media storage collaborators for synd.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use synd_core::CanonicalRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

mod media;

pub use media::{upload_batch, ArtifactMediaStore, MediaUploader, StoredArtifact, UploadError, UploadFile, UploadOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Row store for canonical records. Only single-row atomicity is assumed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new row and returns the id it was stored under.
    async fn create(&self, record: &CanonicalRecord) -> Result<Uuid, StoreError>;

    async fn update(&self, id: Uuid, record: &CanonicalRecord) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<Option<CanonicalRecord>, StoreError>;
}

fn with_id(record: &CanonicalRecord, id: Uuid) -> CanonicalRecord {
    let mut stored = record.clone();
    stored.id = Some(id);
    stored
}

/// In-process store that counts calls; can be switched offline to simulate outages.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<Uuid, CanonicalRecord>>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &CanonicalRecord) -> Result<Uuid, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let id = Uuid::new_v4();
        self.rows.lock().await.insert(id, with_id(record, id));
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &CanonicalRecord) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        *row = with_id(record, id);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<CanonicalRecord>, StoreError> {
        self.check_online()?;
        Ok(self.rows.lock().await.get(&id).cloned())
    }
}

/// One pretty-printed JSON file per record under `root`, written via temp-file rename.
#[derive(Debug, Clone)]
pub struct JsonFileRecordStore {
    root: PathBuf,
}

impl JsonFileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn write(&self, id: Uuid, record: &CanonicalRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&with_id(record, id))?;
        write_atomically(&self.path_for(id), &bytes).await
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn create(&self, record: &CanonicalRecord) -> Result<Uuid, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        let id = Uuid::new_v4();
        self.write(id, record).await?;
        debug!(record_id = %id, root = %self.root.display(), "created draft file");
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &CanonicalRecord) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?
        {
            return Err(StoreError::NotFound(id));
        }
        self.write(id, record).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<CanonicalRecord>, StoreError> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

/// Postgres-backed store: one `listing_drafts` row per record, payload as JSONB.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listing_drafts (
                id          UUID PRIMARY KEY,
                payload     JSONB NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, record: &CanonicalRecord) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO listing_drafts (id, payload) VALUES ($1, $2)")
            .bind(id)
            .bind(Json(with_id(record, id)))
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &CanonicalRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listing_drafts
               SET payload = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(with_id(record, id)))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<CanonicalRecord>, StoreError> {
        let row = sqlx::query("SELECT payload FROM listing_drafts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(record): Json<CanonicalRecord> = row.try_get("payload")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(title: &str) -> CanonicalRecord {
        CanonicalRecord {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_store_creates_then_updates_same_row() {
        let store = MemoryRecordStore::new();
        let id = store.create(&record("v1")).await.unwrap();
        store.update(id, &record("v2")).await.unwrap();
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("v2"));
        assert_eq!(loaded.id, Some(id));
        assert_eq!(store.len().await, 1);
        assert_eq!((store.create_calls(), store.update_calls()), (1, 1));
    }

    #[tokio::test]
    async fn memory_store_reports_outage_and_missing_rows() {
        let store = MemoryRecordStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.create(&record("x")).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.update(missing, &record("x")).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn json_file_store_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileRecordStore::new(dir.path().join("drafts"));
        let id = store.create(&record("first")).await.unwrap();
        assert!(store.path_for(id).exists());

        store.update(id, &record("second")).await.unwrap();
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("second"));
        assert_eq!(loaded.id, Some(id));

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn json_file_store_refuses_update_without_create() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileRecordStore::new(dir.path());
        let id = Uuid::new_v4();
        assert!(matches!(
            store.update(id, &record("x")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.load(id).await.unwrap().is_none());
    }
}
