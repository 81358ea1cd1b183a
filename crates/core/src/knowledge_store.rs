//! Lorebook: embedded knowledge store for retrieval-augmented generation.
//!
//! The core primitive is a [`KnowledgeEntry`]: a piece of setting text (a
//! character, a place, a plot point, or a chunk of an uploaded document)
//! paired with its embedding. Entries are durable (backed by `redb`) and
//! mirrored into an in-memory [`VectorIndex`] for similarity retrieval.
//!
//! This crate never generates embeddings. Callers (normally
//! `lorebook-engine`) compute them and hand them to [`KnowledgeStore`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lorebook::{IndexKind, KnowledgeStore};
//!
//! let store = KnowledgeStore::open("settings.lorebook", IndexKind::Exact).unwrap();
//!
//! let id = store.insert("character", "Alice is a warrior", vec![0.9, 0.1, 0.0]).unwrap();
//! let hits = store.search(&[1.0, 0.0, 0.0], 3, None).unwrap();
//! assert_eq!(hits[0].0.id, id);
//! ```

pub mod backup;
pub mod chunker;
#[cfg(feature = "hnsw")]
mod hnsw_index;
pub mod vector;

pub use chunker::{chunk, ChunkConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
#[cfg(feature = "hnsw")]
pub use hnsw_index::HnswIndex;
pub use vector::{check_finite, cosine_similarity, FlatIndex, IndexKind, VectorIndex};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LorebookError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("content must not be empty")]
    EmptyContent,
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("incompatible backup: {0}")]
    IncompatibleBackup(String),
    #[error("unsupported backup version: {0}")]
    UnsupportedBackupVersion(u32),
    #[error("corrupt backup: {0}")]
    CorruptBackup(String),
    /// A document ingest stopped part-way. Chunks in `progress.committed`
    /// stay in the store.
    #[error("document ingest failed ({progress}): {source}")]
    PartialIngest {
        progress: IngestProgress,
        #[source]
        source: Box<LorebookError>,
    },
    /// A document ingest was cancelled between chunks.
    #[error("document ingest cancelled ({progress})")]
    Cancelled { progress: IngestProgress },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LorebookError {
    /// Whether retrying the same call may succeed (external embedder failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            LorebookError::EmbeddingUnavailable(_) => true,
            LorebookError::PartialIngest { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<redb::DatabaseError> for LorebookError {
    fn from(e: redb::DatabaseError) -> Self {
        LorebookError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for LorebookError {
    fn from(e: redb::TransactionError) -> Self {
        LorebookError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for LorebookError {
    fn from(e: redb::TableError) -> Self {
        LorebookError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for LorebookError {
    fn from(e: redb::StorageError) -> Self {
        LorebookError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for LorebookError {
    fn from(e: redb::CommitError) -> Self {
        LorebookError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LorebookError>;

/// How far a chunked ingest got before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestProgress {
    /// Ids committed so far, in chunk order.
    pub committed: Vec<EntryId>,
    /// Index of the first chunk that was not committed. The unprocessed range
    /// is `failed_chunk..total_chunks`.
    pub failed_chunk: usize,
    pub total_chunks: usize,
}

impl std::fmt::Display for IngestProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} committed, chunks {}..{} not processed",
            self.committed.len(),
            self.failed_chunk,
            self.total_chunks
        )
    }
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Entry type for chunks produced from an uploaded document.
pub const DOCUMENT_CHUNK: &str = "document_chunk";

/// Stable entry identifier. Monotonically assigned, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of retrievable knowledge.
///
/// `content` and `embedding` never change after creation; an update is a
/// delete followed by an add under a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    /// Free-form grouping tag (`character`, `world`, `plot`, [`DOCUMENT_CHUNK`], ...).
    pub kind: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Entry counts for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KnowledgeStats {
    pub total_count: usize,
    pub counts_by_type: BTreeMap<String, usize>,
}

/// Full in-memory copy of a store, used by backup and restore.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    /// `None` while nothing has ever been embedded into the store.
    pub dimension: Option<usize>,
    pub next_id: u64,
    /// Ordered by id.
    pub entries: Vec<KnowledgeEntry>,
}

/// The persisted row; the embedding lives in its own table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    kind: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl EntryRecord {
    fn into_entry(self, id: EntryId, embedding: &[f32]) -> KnowledgeEntry {
        KnowledgeEntry {
            id,
            kind: self.kind,
            content: self.content,
            embedding: embedding.to_vec(),
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Entry rows as JSON, keyed by id.
const ENTRIES: TableDefinition<u64, &str> = TableDefinition::new("entries");
/// Raw little-endian f32 bytes keyed by id. Written in the same transaction
/// as the matching `entries` row.
const EMBEDDINGS: TableDefinition<u64, &[u8]> = TableDefinition::new("embeddings");
/// Keys `dim` (established embedding dimension) and `next_id`.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_DIM: &str = "dim";
const META_NEXT_ID: &str = "next_id";

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<EntryId, EntryRecord>,
    index: Box<dyn VectorIndex>,
    dim: Option<usize>,
    next_id: u64,
}

impl Inner {
    fn hydrate(&self, id: EntryId) -> Result<KnowledgeEntry> {
        let record = self.entries.get(&id).ok_or(LorebookError::NotFound(id))?;
        let embedding = self.index.get(id).ok_or_else(|| {
            LorebookError::Internal(format!("entry {id} has no vector in the index"))
        })?;
        Ok(record.clone().into_entry(id, embedding))
    }
}

/// Durable entry store with a synchronised vector index.
///
/// The redb tables are the source of truth; the in-memory entry map and
/// vector index are rebuilt from them on open. Both in-memory structures sit
/// behind one `RwLock`, so readers always see them agree: every mutation
/// takes the write lock, commits to redb, then updates both before
/// releasing it. Queries and stats share the read lock.
pub struct KnowledgeStore {
    db: Database,
    kind: IndexKind,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("index", &self.kind)
            .finish_non_exhaustive()
    }
}

impl KnowledgeStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<std::path::Path>, kind: IndexKind) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        Self::init(db, kind)
    }

    /// Create a store with no file I/O. Data is lost when it is dropped.
    pub fn open_in_memory(kind: IndexKind) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, kind)
    }

    fn init(db: Database, kind: IndexKind) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ENTRIES)?;
            write_txn.open_table(EMBEDDINGS)?;
            write_txn.open_table(META)?;
            write_txn.commit()?;
        }
        let inner = Self::load(&db, kind)?;
        info!(
            entries = inner.entries.len(),
            dim = ?inner.dim,
            index = ?kind,
            "opened knowledge store"
        );
        Ok(Self {
            db,
            kind,
            inner: RwLock::new(inner),
        })
    }

    /// Read every row and embedding and build the in-memory view.
    ///
    /// An entry without an embedding (or the reverse) means the file was not
    /// written by this store and is reported as a storage error.
    fn load(db: &Database, kind: IndexKind) -> Result<Inner> {
        let read_txn = db.begin_read()?;

        let meta = read_txn.open_table(META)?;
        let dim = meta.get(META_DIM)?.map(|g| g.value() as usize);
        let stored_next = meta.get(META_NEXT_ID)?.map(|g| g.value()).unwrap_or(1);

        let mut entries = BTreeMap::new();
        for row in read_txn.open_table(ENTRIES)?.iter()? {
            let (key, value) = row?;
            let record: EntryRecord = serde_json::from_str(value.value())?;
            entries.insert(EntryId(key.value()), record);
        }

        let mut index = kind.build()?;
        for row in read_txn.open_table(EMBEDDINGS)?.iter()? {
            let (key, value) = row?;
            let id = EntryId(key.value());
            if !entries.contains_key(&id) {
                return Err(LorebookError::Storage(format!(
                    "embedding for entry {id} has no entry row"
                )));
            }
            let embedding = bytes_to_embedding(id, value.value())?;
            if let Some(d) = dim {
                if embedding.len() != d {
                    return Err(LorebookError::Storage(format!(
                        "embedding for entry {id} has dimension {}, store has {d}",
                        embedding.len()
                    )));
                }
            }
            index.insert(id, embedding)?;
        }

        if index.len() != entries.len() {
            let missing = entries
                .keys()
                .find(|id| index.get(**id).is_none())
                .copied()
                .unwrap_or(EntryId(0));
            return Err(LorebookError::Storage(format!(
                "entry {missing} has no embedding"
            )));
        }

        let next_id = entries
            .keys()
            .next_back()
            .map(|id| id.0 + 1)
            .unwrap_or(1)
            .max(stored_next);
        let dim = dim.or(index.dim());

        Ok(Inner {
            entries,
            index,
            dim,
            next_id,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| LorebookError::Internal("knowledge store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| LorebookError::Internal("knowledge store lock poisoned".into()))
    }

    /// Run `f` inside one redb write transaction and commit it.
    ///
    /// On error the transaction is dropped, which rolls it back.
    fn persist<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<()>,
    {
        let write_txn = self.db.begin_write()?;
        f(&write_txn)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Store a new entry with a pre-computed embedding and return its id.
    ///
    /// # Errors
    /// - [`LorebookError::EmptyContent`] for blank `content`.
    /// - [`LorebookError::DimensionMismatch`] if the embedding length differs
    ///   from the store's established dimension.
    pub fn insert(&self, kind: &str, content: &str, embedding: Vec<f32>) -> Result<EntryId> {
        if content.trim().is_empty() {
            return Err(LorebookError::EmptyContent);
        }
        let mut inner = self.write()?;
        vector::check_dim(inner.dim, &embedding)?;

        let id = EntryId(inner.next_id);
        let record = EntryRecord {
            kind: kind.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let dim = embedding.len();
        let bytes = embedding_to_bytes(&embedding);

        // Undone below if the commit fails.
        inner.index.insert(id, embedding)?;
        let persisted = self.persist(|txn| {
            write_entry(txn, id, &record, &bytes)?;
            let mut meta = txn.open_table(META)?;
            meta.insert(META_NEXT_ID, id.0 + 1)?;
            meta.insert(META_DIM, dim as u64)?;
            Ok(())
        });
        if let Err(e) = persisted {
            inner.index.remove(id);
            return Err(e);
        }

        inner.dim = Some(dim);
        inner.next_id = id.0 + 1;
        inner.entries.insert(id, record);
        debug!(%id, kind, "inserted entry");
        Ok(id)
    }

    /// Atomically replace entry `old` with new content of the same kind.
    ///
    /// Readers see either the old entry or the new one, never both or neither.
    pub fn replace(&self, old: EntryId, content: &str, embedding: Vec<f32>) -> Result<EntryId> {
        if content.trim().is_empty() {
            return Err(LorebookError::EmptyContent);
        }
        let mut inner = self.write()?;
        let kind = match inner.entries.get(&old) {
            Some(r) => r.kind.clone(),
            None => return Err(LorebookError::NotFound(old)),
        };
        vector::check_dim(inner.dim, &embedding)?;

        let id = EntryId(inner.next_id);
        let record = EntryRecord {
            kind,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let bytes = embedding_to_bytes(&embedding);

        inner.index.insert(id, embedding)?;
        let persisted = self.persist(|txn| {
            remove_entry(txn, old)?;
            write_entry(txn, id, &record, &bytes)?;
            txn.open_table(META)?.insert(META_NEXT_ID, id.0 + 1)?;
            Ok(())
        });
        if let Err(e) = persisted {
            inner.index.remove(id);
            return Err(e);
        }

        inner.index.remove(old);
        inner.entries.remove(&old);
        inner.next_id = id.0 + 1;
        inner.entries.insert(id, record);
        debug!(%old, new = %id, "replaced entry");
        Ok(id)
    }

    /// Delete an entry and its vector. Returns `false` if `id` was absent.
    pub fn delete(&self, id: EntryId) -> Result<bool> {
        let mut inner = self.write()?;
        if !inner.entries.contains_key(&id) {
            return Ok(false);
        }
        self.persist(|txn| remove_entry(txn, id))?;
        inner.entries.remove(&id);
        inner.index.remove(id);
        debug!(%id, "deleted entry");
        Ok(true)
    }

    /// Remove every entry. The embedding dimension and id counter are kept.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        self.persist(wipe_entries)?;
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.index.clear();
        info!(dropped, "cleared knowledge store");
        Ok(())
    }

    /// Destructively overwrite the whole store with `snapshot`.
    ///
    /// The replacement index is built before the lock is taken and the redb
    /// swap is one transaction, so on any error the current contents are left
    /// untouched.
    pub fn replace_all(&self, snapshot: StoreSnapshot) -> Result<()> {
        let mut index = self.kind.build()?;
        let mut entries = BTreeMap::new();
        let mut rows = Vec::with_capacity(snapshot.entries.len());
        for entry in snapshot.entries {
            vector::check_dim(snapshot.dimension, &entry.embedding)?;
            if entries.contains_key(&entry.id) {
                return Err(LorebookError::CorruptBackup(format!(
                    "duplicate entry id {}",
                    entry.id
                )));
            }
            let bytes = embedding_to_bytes(&entry.embedding);
            index.insert(entry.id, entry.embedding)?;
            let record = EntryRecord {
                kind: entry.kind,
                content: entry.content,
                created_at: entry.created_at,
            };
            rows.push((entry.id, bytes));
            entries.insert(entry.id, record);
        }

        let mut inner = self.write()?;
        let next_id = inner.next_id.max(snapshot.next_id);
        let dim = snapshot.dimension.or(inner.dim);
        self.persist(|txn| {
            wipe_entries(txn)?;
            for (id, bytes) in &rows {
                if let Some(record) = entries.get(id) {
                    write_entry(txn, *id, record, bytes)?;
                }
            }
            let mut meta = txn.open_table(META)?;
            meta.insert(META_NEXT_ID, next_id)?;
            if let Some(d) = dim {
                meta.insert(META_DIM, d as u64)?;
            }
            Ok(())
        })?;

        let count = entries.len();
        *inner = Inner {
            entries,
            index,
            dim,
            next_id,
        };
        info!(entries = count, next_id, "replaced knowledge store contents");
        Ok(())
    }

    /// Fetch one entry.
    pub fn get(&self, id: EntryId) -> Result<KnowledgeEntry> {
        self.read()?.hydrate(id)
    }

    /// All entries in id (= insertion) order, optionally restricted to one kind.
    pub fn list(&self, kind: Option<&str>) -> Result<Vec<KnowledgeEntry>> {
        let inner = self.read()?;
        inner
            .entries
            .iter()
            .filter(|(_, r)| kind.map_or(true, |k| r.kind == k))
            .map(|(id, _)| inner.hydrate(*id))
            .collect()
    }

    /// Top-`k` entries by cosine similarity to `query`.
    ///
    /// `kinds`, when given, restricts results to entries of those kinds; the
    /// filter is applied before truncating to `k`. An empty store returns an
    /// empty list.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        kinds: Option<&[String]>,
    ) -> Result<Vec<(KnowledgeEntry, f32)>> {
        if k == 0 {
            return Err(LorebookError::InvalidArgument(
                "k must be at least 1".to_string(),
            ));
        }
        let inner = self.read()?;
        if let Some(d) = inner.dim {
            if query.len() != d {
                return Err(LorebookError::DimensionMismatch {
                    expected: d,
                    actual: query.len(),
                });
            }
        }
        if inner.entries.is_empty() {
            return Ok(Vec::new());
        }

        let window = if kinds.is_some() {
            inner.index.len()
        } else {
            k
        };
        let mut results = Vec::with_capacity(k.min(inner.entries.len()));
        for (id, score) in inner.index.search(query, window)? {
            if let Some(kinds) = kinds {
                let matches = inner
                    .entries
                    .get(&id)
                    .is_some_and(|r| kinds.iter().any(|wanted| *wanted == r.kind));
                if !matches {
                    continue;
                }
            }
            results.push((inner.hydrate(id)?, score));
            if results.len() == k {
                break;
            }
        }
        Ok(results)
    }

    /// Total and per-kind entry counts.
    pub fn stats(&self) -> Result<KnowledgeStats> {
        let inner = self.read()?;
        let mut counts_by_type = BTreeMap::new();
        for record in inner.entries.values() {
            *counts_by_type.entry(record.kind.clone()).or_insert(0) += 1;
        }
        Ok(KnowledgeStats {
            total_count: inner.entries.len(),
            counts_by_type,
        })
    }

    /// Consistent copy of every entry, taken under the read lock.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let inner = self.read()?;
        let entries = inner
            .entries
            .keys()
            .map(|id| inner.hydrate(*id))
            .collect::<Result<Vec<_>>>()?;
        Ok(StoreSnapshot {
            dimension: inner.dim,
            next_id: inner.next_id,
            entries,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of vectors in the index. Always equal to [`len`](Self::len).
    pub fn vector_count(&self) -> Result<usize> {
        Ok(self.read()?.index.len())
    }

    /// Established embedding dimension, `None` until the first insert.
    pub fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.read()?.dim)
    }

    /// Which index implementation backs this store.
    pub fn index_kind(&self) -> IndexKind {
        self.kind
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

fn write_entry(
    txn: &redb::WriteTransaction,
    id: EntryId,
    record: &EntryRecord,
    embedding_bytes: &[u8],
) -> Result<()> {
    let json = serde_json::to_string(record)?;
    txn.open_table(ENTRIES)?.insert(id.0, json.as_str())?;
    txn.open_table(EMBEDDINGS)?.insert(id.0, embedding_bytes)?;
    Ok(())
}

fn remove_entry(txn: &redb::WriteTransaction, id: EntryId) -> Result<()> {
    txn.open_table(ENTRIES)?.remove(id.0)?;
    txn.open_table(EMBEDDINGS)?.remove(id.0)?;
    Ok(())
}

fn wipe_entries(txn: &redb::WriteTransaction) -> Result<()> {
    {
        let mut table = txn.open_table(ENTRIES)?;
        let keys = table
            .iter()?
            .map(|row| row.map(|(k, _)| k.value()))
            .collect::<std::result::Result<Vec<u64>, _>>()?;
        for key in keys {
            table.remove(key)?;
        }
    }
    let mut table = txn.open_table(EMBEDDINGS)?;
    let keys = table
        .iter()?
        .map(|row| row.map(|(k, _)| k.value()))
        .collect::<std::result::Result<Vec<u64>, _>>()?;
    for key in keys {
        table.remove(key)?;
    }
    Ok(())
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn bytes_to_embedding(id: EntryId, bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(LorebookError::Storage(format!(
            "corrupt embedding for entry {id}: byte length {} is not a positive multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_temp_store() -> (KnowledgeStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = KnowledgeStore::open(file.path(), IndexKind::Exact).unwrap();
        (store, file)
    }

    fn kinds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn insert_and_search_returns_nearest() {
        let (store, _tmp) = open_temp_store();
        let alice = store
            .insert("character", "Alice is a warrior", vec![1.0, 0.0, 0.0])
            .unwrap();
        store
            .insert("world", "Eldor has two moons", vec![0.0, 1.0, 0.0])
            .unwrap();

        let hits = store.search(&[0.9, 0.1, 0.0], 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, alice);
        assert_eq!(hits[0].0.content, "Alice is a warrior");
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let (store, _tmp) = open_temp_store();
        let a = store.insert("plot", "one", vec![1.0, 0.0]).unwrap();
        let b = store.insert("plot", "two", vec![0.0, 1.0]).unwrap();
        assert!(b > a);
        assert!(store.delete(b).unwrap());
        let c = store.insert("plot", "three", vec![1.0, 1.0]).unwrap();
        assert!(c > b);

        store.clear().unwrap();
        let d = store.insert("plot", "four", vec![1.0, 1.0]).unwrap();
        assert!(d > c);
    }

    #[test]
    fn blank_content_is_rejected() {
        let (store, _tmp) = open_temp_store();
        assert!(matches!(
            store.insert("character", "  \n", vec![1.0]),
            Err(LorebookError::EmptyContent)
        ));
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn dimension_is_fixed_by_first_insert() {
        let (store, _tmp) = open_temp_store();
        store.insert("world", "a", vec![1.0, 0.0]).unwrap();
        let err = store.insert("world", "b", vec![1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            LorebookError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.vector_count().unwrap(), 1);
    }

    #[test]
    fn non_finite_embedding_is_rejected_before_commit() {
        let (store, _tmp) = open_temp_store();
        let kept = store.insert("world", "Eldor", vec![0.0, 1.0, 0.0]).unwrap();
        assert!(matches!(
            store.insert("world", "broken", vec![f32::INFINITY, 0.0, 1.0]),
            Err(LorebookError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.replace(kept, "broken", vec![f32::NAN, 0.0, 1.0]),
            Err(LorebookError::InvalidArgument(_))
        ));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.vector_count().unwrap(), 1);
        assert_eq!(store.get(kept).unwrap().content, "Eldor");
    }

    #[test]
    fn dimension_survives_clear() {
        let (store, _tmp) = open_temp_store();
        store.insert("world", "a", vec![1.0, 0.0]).unwrap();
        store.clear().unwrap();
        assert_eq!(store.dimension().unwrap(), Some(2));
        assert!(store.insert("world", "b", vec![1.0]).is_err());
    }

    #[test]
    fn delete_removes_entry_and_vector() {
        let (store, _tmp) = open_temp_store();
        let id = store.insert("character", "Bob", vec![1.0, 0.0]).unwrap();
        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(matches!(store.get(id), Err(LorebookError::NotFound(_))));
        assert_eq!(store.vector_count().unwrap(), 0);
        assert!(store.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn search_on_empty_store_is_empty() {
        let (store, _tmp) = open_temp_store();
        assert!(store.search(&[1.0, 0.0], 3, None).unwrap().is_empty());
    }

    #[test]
    fn search_rejects_zero_k_and_wrong_query_length() {
        let (store, _tmp) = open_temp_store();
        store.insert("world", "a", vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            store.search(&[1.0, 0.0], 0, None),
            Err(LorebookError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.search(&[1.0], 1, None),
            Err(LorebookError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn kind_filter_applies_before_truncation() {
        let (store, _tmp) = open_temp_store();
        store.insert("character", "c1", vec![1.0, 0.0]).unwrap();
        store.insert("character", "c2", vec![0.99, 0.01]).unwrap();
        let world = store.insert("world", "w1", vec![0.0, 1.0]).unwrap();

        let filter = kinds(&["world"]);
        let hits = store.search(&[1.0, 0.0], 1, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, world);
    }

    #[test]
    fn replace_swaps_entry_under_new_id() {
        let (store, _tmp) = open_temp_store();
        let old = store.insert("character", "Alice is a warrior", vec![1.0, 0.0]).unwrap();
        let new = store.replace(old, "Alice is a mage", vec![0.0, 1.0]).unwrap();
        assert_ne!(old, new);
        assert!(matches!(store.get(old), Err(LorebookError::NotFound(_))));
        let entry = store.get(new).unwrap();
        assert_eq!(entry.kind, "character");
        assert_eq!(entry.content, "Alice is a mage");
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.vector_count().unwrap(), 1);

        assert!(matches!(
            store.replace(EntryId(999), "x", vec![1.0, 0.0]),
            Err(LorebookError::NotFound(EntryId(999)))
        ));
    }

    #[test]
    fn stats_count_by_kind() {
        let (store, _tmp) = open_temp_store();
        store.insert("character", "a", vec![1.0]).unwrap();
        store.insert("character", "b", vec![1.0]).unwrap();
        store.insert(DOCUMENT_CHUNK, "c", vec![1.0]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.counts_by_type["character"], 2);
        assert_eq!(stats.counts_by_type[DOCUMENT_CHUNK], 1);
        assert_eq!(stats.counts_by_type.values().sum::<usize>(), stats.total_count);
    }

    #[test]
    fn list_is_in_insertion_order_and_filterable() {
        let (store, _tmp) = open_temp_store();
        let a = store.insert("world", "a", vec![1.0]).unwrap();
        store.insert("plot", "b", vec![1.0]).unwrap();
        let c = store.insert("world", "c", vec![1.0]).unwrap();

        let all: Vec<EntryId> = store.list(None).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(all.len(), 3);
        let worlds: Vec<EntryId> = store
            .list(Some("world"))
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(worlds, vec![a, c]);
    }

    #[test]
    fn entries_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        let id = {
            let store = KnowledgeStore::open(file.path(), IndexKind::Exact).unwrap();
            store.insert("world", "Eldor", vec![0.6, 0.8]).unwrap()
        };

        let store = KnowledgeStore::open(file.path(), IndexKind::Exact).unwrap();
        let entry = store.get(id).unwrap();
        assert_eq!(entry.content, "Eldor");
        assert_eq!(entry.embedding, vec![0.6, 0.8]);
        assert_eq!(store.dimension().unwrap(), Some(2));

        let next = store.insert("world", "Mirel", vec![0.8, 0.6]).unwrap();
        assert!(next > id);
    }

    #[test]
    fn replace_all_overwrites_and_keeps_ids_increasing() {
        let (store, _tmp) = open_temp_store();
        for i in 0..5 {
            store.insert("plot", &format!("p{i}"), vec![1.0, i as f32]).unwrap();
        }
        let snapshot = StoreSnapshot {
            dimension: Some(2),
            next_id: 3,
            entries: vec![KnowledgeEntry {
                id: EntryId(2),
                kind: "character".to_string(),
                content: "restored".to_string(),
                embedding: vec![0.0, 1.0],
                created_at: Utc::now(),
            }],
        };
        store.replace_all(snapshot).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(EntryId(2)).unwrap().content, "restored");
        let fresh = store.insert("plot", "after", vec![1.0, 0.0]).unwrap();
        assert!(fresh > EntryId(5));
    }

    #[test]
    fn failed_replace_all_leaves_store_untouched() {
        let (store, _tmp) = open_temp_store();
        let id = store.insert("plot", "keep me", vec![1.0, 0.0]).unwrap();
        let bad = StoreSnapshot {
            dimension: Some(2),
            next_id: 10,
            entries: vec![KnowledgeEntry {
                id: EntryId(1),
                kind: "plot".to_string(),
                content: "wrong".to_string(),
                embedding: vec![1.0, 0.0, 0.0],
                created_at: Utc::now(),
            }],
        };
        assert!(store.replace_all(bad).is_err());
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(id).unwrap().content, "keep me");
    }

    #[test]
    fn snapshot_round_trips_through_replace_all() {
        let (store, _tmp) = open_temp_store();
        store.insert("character", "a", vec![1.0, 0.0]).unwrap();
        store.insert("world", "b", vec![0.0, 1.0]).unwrap();
        let before = store.snapshot().unwrap();
        store.replace_all(before.clone()).unwrap();
        let after = store.snapshot().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn in_memory_store_works_without_files() {
        let store = KnowledgeStore::open_in_memory(IndexKind::Exact).unwrap();
        let id = store.insert("world", "x", vec![1.0]).unwrap();
        assert_eq!(store.get(id).unwrap().content, "x");
    }

    #[test]
    fn retryable_only_for_embedding_failures() {
        assert!(LorebookError::EmbeddingUnavailable("down".into()).is_retryable());
        assert!(!LorebookError::EmptyContent.is_retryable());
        let partial = LorebookError::PartialIngest {
            progress: IngestProgress {
                committed: vec![EntryId(1)],
                failed_chunk: 1,
                total_chunks: 3,
            },
            source: Box::new(LorebookError::EmbeddingUnavailable("down".into())),
        };
        assert!(partial.is_retryable());
        assert!(partial.to_string().contains("1 committed"));
    }

    #[test]
    fn concurrent_readers_see_consistent_counts() {
        let store = std::sync::Arc::new(KnowledgeStore::open_in_memory(IndexKind::Exact).unwrap());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .insert("plot", &format!("p{i}"), vec![1.0, i as f32])
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let stats = store.stats().unwrap();
                        let snap = store.snapshot().unwrap();
                        assert!(snap.entries.len() >= stats.total_count);
                        let _ = store.search(&[1.0, 0.0], 3, None).unwrap();
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 50);
        assert_eq!(store.vector_count().unwrap(), 50);
    }
}
