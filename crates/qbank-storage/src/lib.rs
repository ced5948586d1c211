//! Persisted question stores: an in-memory collection, a JSON file collection
//! and a Postgres JSONB table, all behind [`QuestionStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use qbank_core::{Document, QuestionPatch, KEY_FIELD};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qbank-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document collection {}: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },
    #[error("persisted document for questionid {questionid} is not an object")]
    NotAnObject { questionid: i64 },
    #[error("store rejected update: {0}")]
    Rejected(String),
}

/// Result of persisting a file-backed collection.
#[derive(Debug, Clone)]
pub struct StoreFlush {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub documents: usize,
}

/// Keyed document collection the reconciler reads from and patches.
///
/// `update_one` is a merge: only the fields carried by the patch change, and a
/// missing key is never inserted. It returns the matched document count.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError>;

    async fn update_one(&self, questionid: i64, patch: &QuestionPatch) -> Result<u64, StoreError>;

    /// Persist buffered writes. Stores that write through return `Ok(None)`.
    async fn flush(&self) -> Result<Option<StoreFlush>, StoreError> {
        Ok(None)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    index: HashMap<i64, usize>,
}

impl Collection {
    fn push(&mut self, doc: Document) {
        let Some(questionid) = doc.get(KEY_FIELD).and_then(JsonValue::as_i64) else {
            warn!("document without integer questionid kept but not addressable");
            self.docs.push(doc);
            return;
        };
        // first document wins, like a find_one over an unordered collection
        if self.index.contains_key(&questionid) {
            warn!(questionid, "duplicate questionid in collection");
        } else {
            self.index.insert(questionid, self.docs.len());
        }
        self.docs.push(doc);
    }
}

/// In-memory collection preserving insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collection>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(docs: impl IntoIterator<Item = Document>) -> Self {
        let mut collection = Collection::default();
        for doc in docs {
            collection.push(doc);
        }
        Self {
            inner: Mutex::new(collection),
        }
    }

    pub async fn insert(&self, doc: Document) {
        self.inner.lock().await.push(doc);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn documents(&self) -> Vec<Document> {
        self.inner.lock().await.docs.clone()
    }
}

#[async_trait]
impl QuestionStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .get(&questionid)
            .and_then(|&pos| inner.docs.get(pos))
            .cloned())
    }

    async fn update_one(&self, questionid: i64, patch: &QuestionPatch) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.index.get(&questionid).copied() else {
            return Ok(0);
        };
        match inner.docs.get_mut(pos) {
            Some(doc) => {
                patch.apply_to(doc);
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

/// Document collection stored as a JSON array on disk.
///
/// The file is read once at open; writes land in memory and are saved by
/// [`QuestionStore::flush`] through a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    memory: MemoryStore,
    dirty: AtomicBool,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = fs::read_to_string(&path).await.map_err(|source| StoreError::Io {
            action: "reading",
            path: path.clone(),
            source,
        })?;
        let value: JsonValue =
            serde_json::from_str(&text).map_err(|err| StoreError::Malformed {
                path: path.clone(),
                message: err.to_string(),
            })?;
        let JsonValue::Array(items) = value else {
            return Err(StoreError::Malformed {
                path,
                message: "expected a JSON array of documents".into(),
            });
        };
        let mut docs = Vec::with_capacity(items.len());
        for (pos, item) in items.into_iter().enumerate() {
            match item {
                JsonValue::Object(doc) => docs.push(doc),
                _ => {
                    return Err(StoreError::Malformed {
                        path,
                        message: format!("element {pos} is not an object"),
                    })
                }
            }
        }
        debug!(path = %path.display(), documents = docs.len(), "opened json collection");
        Ok(Self {
            path,
            memory: MemoryStore::from_documents(docs),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn documents(&self) -> Vec<Document> {
        self.memory.documents().await
    }

    async fn save(&self) -> Result<StoreFlush, StoreError> {
        let docs = self.memory.documents().await;
        let count = docs.len();
        let array = JsonValue::Array(docs.into_iter().map(JsonValue::Object).collect());
        let mut bytes =
            serde_json::to_vec_pretty(&array).map_err(|err| StoreError::Rejected(err.to_string()))?;
        bytes.push(b'\n');
        write_atomically(&self.path, &bytes).await?;
        Ok(StoreFlush {
            path: self.path.clone(),
            content_hash: sha256_hex(&bytes),
            byte_size: bytes.len(),
            documents: count,
        })
    }
}

#[async_trait]
impl QuestionStore for JsonFileStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
        self.memory.find_one(questionid).await
    }

    async fn update_one(&self, questionid: i64, patch: &QuestionPatch) -> Result<u64, StoreError> {
        let matched = self.memory.update_one(questionid, patch).await?;
        if matched > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(matched)
    }

    async fn flush(&self) -> Result<Option<StoreFlush>, StoreError> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let flushed = self.save().await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(Some(flushed))
    }
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| StoreError::Io {
            action: "creating directory",
            path: parent.clone(),
            source,
        })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let io_err = |action: &'static str| {
        let temp_path = temp_path.clone();
        move |source: std::io::Error| StoreError::Io {
            action,
            path: temp_path,
            source,
        }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file"))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file"))?;
    file.flush().await.map_err(io_err("flushing temp file"))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "renaming temp file onto",
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Postgres-backed store: `questions(questionid BIGINT PRIMARY KEY, document JSONB)`.
#[derive(Debug, Clone)]
pub struct PgQuestionStore {
    pool: PgPool,
}

impl PgQuestionStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .instrument(info_span!("pg_connect"))
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl QuestionStore for PgQuestionStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn find_one(&self, questionid: i64) -> Result<Option<Document>, StoreError> {
        let row: Option<Json<JsonValue>> =
            sqlx::query_scalar("SELECT document FROM questions WHERE questionid = $1")
                .bind(questionid)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(None),
            Some(Json(JsonValue::Object(mut doc))) => {
                doc.insert(KEY_FIELD.into(), JsonValue::from(questionid));
                Ok(Some(doc))
            }
            Some(_) => Err(StoreError::NotAnObject { questionid }),
        }
    }

    async fn update_one(&self, questionid: i64, patch: &QuestionPatch) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE questions SET document = document || $2 WHERE questionid = $1")
                .bind(questionid)
                .bind(Json(patch.to_document()))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
