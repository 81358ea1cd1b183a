//! Knowledge engine for retrieval-augmented text continuation.
//!
//! Stores user-supplied settings (characters, world facts, plot points) and
//! uploaded documents, and returns the most relevant pieces for a
//! continuation request so a language model can condition on them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use lorebook_engine::{EngineConfig, KnowledgeEngine};
//!
//! let engine = KnowledgeEngine::open(&EngineConfig::default()).unwrap();
//!
//! engine.add_setting("character", "Alice is a warrior").unwrap();
//! engine.add_setting("world", "The kingdom of Eldor").unwrap();
//!
//! let hits = engine.query("warrior princess", 1).unwrap();
//! assert_eq!(hits[0].0.content, "Alice is a warrior");
//!
//! // Ready-to-paste prompt context.
//! let context = engine.assemble_context("warrior princess", 3, 2000).unwrap();
//! ```
//!
//! Embedding happens outside the store lock: a slow remote embedder never
//! blocks concurrent queries. Structural updates (entry rows and vectors)
//! are applied together under the lock, so readers never see one without the
//! other.

pub mod config;
pub mod embedder;
pub mod import;
#[cfg(feature = "remote")]
pub mod remote;

pub use config::{EmbeddingConfig, EmbeddingProvider, EngineConfig, RemoteFlavor};
pub use embedder::{CacheStats, CachedEmbedder, Embedder, HashingEmbedder};
pub use lorebook::LorebookError as Error;
pub use lorebook::{
    chunk, ChunkConfig, EntryId, IndexKind, IngestProgress, KnowledgeEntry, KnowledgeStats,
    KnowledgeStore, DOCUMENT_CHUNK,
};
#[cfg(feature = "remote")]
pub use remote::RemoteEmbedder;

pub type Result<T> = std::result::Result<T, Error>;

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Retrieval options for [`KnowledgeEngine::query_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub top_k: usize,
    /// Only return entries of these kinds. The filter is applied before
    /// truncating to `top_k`.
    pub kinds: Option<Vec<String>>,
    /// Drop results scoring below this cosine similarity.
    pub min_score: Option<f32>,
}

impl QueryOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            kinds: None,
            min_score: None,
        }
    }

    pub fn kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// The knowledge engine. Construct one per knowledge base and share it with
/// `Arc`; there is no global instance.
pub struct KnowledgeEngine {
    store: KnowledgeStore,
    embedder: Box<dyn Embedder>,
    chunking: ChunkConfig,
    default_top_k: usize,
    context_max_chars: usize,
    embed_batch_size: usize,
}

impl std::fmt::Debug for KnowledgeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeEngine")
            .field("store", &self.store)
            .field("dimension", &self.embedder.dimension())
            .field("chunking", &self.chunking)
            .field("embed_batch_size", &self.embed_batch_size)
            .finish_non_exhaustive()
    }
}

impl KnowledgeEngine {
    /// Build the store and embedder described by `config`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = match &config.db_path {
            Some(path) => KnowledgeStore::open(path, config.index)?,
            None => KnowledgeStore::open_in_memory(config.index)?,
        };
        let embedder = embedder::from_config(&config.embedding)?;
        let mut engine = Self::new(store, embedder)?;
        engine.chunking = config.chunking()?;
        engine.default_top_k = config.default_top_k;
        engine.context_max_chars = config.context_max_chars;
        engine.with_embed_batch_size(config.embed_batch_size)
    }

    /// Wire an existing store to an embedder.
    ///
    /// # Errors
    /// [`Error::DimensionMismatch`] if the store already holds vectors of a
    /// different length than the embedder produces.
    pub fn new(store: KnowledgeStore, embedder: Box<dyn Embedder>) -> Result<Self> {
        let dimension = embedder.dimension();
        if dimension == 0 {
            return Err(Error::InvalidConfiguration(
                "embedder reports dimension 0".to_string(),
            ));
        }
        if let Some(stored) = store.dimension()? {
            if stored != dimension {
                return Err(Error::DimensionMismatch {
                    expected: stored,
                    actual: dimension,
                });
            }
        }
        let defaults = EngineConfig::default();
        Ok(Self {
            store,
            embedder,
            chunking: ChunkConfig::default(),
            default_top_k: defaults.default_top_k,
            context_max_chars: defaults.context_max_chars,
            embed_batch_size: defaults.embed_batch_size,
        })
    }

    /// Number of document chunks embedded per [`Embedder::embed_batch`] call.
    /// Cancellation is checked between batches.
    pub fn with_embed_batch_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfiguration(
                "embed_batch_size must be at least 1".to_string(),
            ));
        }
        self.embed_batch_size = size;
        Ok(self)
    }

    /// In-memory engine with the local hashing embedder.
    pub fn in_memory() -> Result<Self> {
        Self::new(
            KnowledgeStore::open_in_memory(IndexKind::Exact)?,
            Box::new(HashingEmbedder::default()),
        )
    }

    /// Explicit teardown. Dropping the engine is equivalent.
    pub fn close(self) {
        info!("closing knowledge engine");
    }

    /// Embedding dimension produced by this engine's embedder.
    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Configured chunking, used by [`add_document_default`](Self::add_document_default).
    pub fn chunking(&self) -> ChunkConfig {
        self.chunking
    }

    /// Number of vectors in the index; always equal to `stats().total_count`.
    pub fn vector_count(&self) -> Result<usize> {
        self.store.vector_count()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(text)?;
        self.check_embedding(embedding)
    }

    /// Embedder output must have the advertised length and finite components.
    fn check_embedding(&self, embedding: Vec<f32>) -> Result<Vec<f32>> {
        let expected = self.embedder.dimension();
        if embedding.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        lorebook::check_finite(&embedding)?;
        Ok(embedding)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Embed `content` and store it as one entry of `kind`.
    pub fn add_setting(&self, kind: &str, content: &str) -> Result<EntryId> {
        if content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }
        let embedding = self.embed(content)?;
        let id = self.store.insert(kind, content, embedding)?;
        info!(%id, kind, "added setting");
        Ok(id)
    }

    /// Chunk `content` and store every chunk as a [`DOCUMENT_CHUNK`] entry.
    ///
    /// Returns ids in chunk order. There is no overall transaction: if chunk
    /// *i* fails, chunks before it stay committed and the error is
    /// [`Error::PartialIngest`] describing what was committed and which range
    /// was not processed.
    pub fn add_document(
        &self,
        content: &str,
        chunk_size: usize,
        overlap: usize,
    ) -> Result<Vec<EntryId>> {
        self.add_document_cancellable(content, chunk_size, overlap, &AtomicBool::new(false))
    }

    /// [`add_document`](Self::add_document) with the configured chunking.
    pub fn add_document_default(&self, content: &str) -> Result<Vec<EntryId>> {
        self.add_document(content, self.chunking.size(), self.chunking.overlap())
    }

    /// Like [`add_document`](Self::add_document), checking `cancel` before
    /// each embedding batch. When it is set, returns [`Error::Cancelled`];
    /// chunks committed so far stay.
    ///
    /// Chunks are embedded in batches of `embed_batch_size` outside the store
    /// lock, then committed one by one. A failed batch is reported from its
    /// first chunk.
    #[tracing::instrument(
        skip_all,
        fields(bytes = content.len(), chunk_size = chunk_size, overlap = overlap)
    )]
    pub fn add_document_cancellable(
        &self,
        content: &str,
        chunk_size: usize,
        overlap: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<EntryId>> {
        let chunks = ChunkConfig::new(chunk_size, overlap)?.split(content);
        if chunks.is_empty() {
            return Err(Error::EmptyContent);
        }

        let total_chunks = chunks.len();
        let pending: Vec<(usize, &String)> = chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| !chunk.trim().is_empty())
            .collect();

        let mut committed = Vec::with_capacity(pending.len());
        let partial = |committed: Vec<EntryId>, failed_chunk: usize, source: Error| {
            warn!(chunk = failed_chunk, total_chunks, error = %source, "document ingest failed");
            Error::PartialIngest {
                progress: IngestProgress {
                    committed,
                    failed_chunk,
                    total_chunks,
                },
                source: Box::new(source),
            }
        };

        for batch in pending.chunks(self.embed_batch_size) {
            let first = batch[0].0;
            if cancel.load(Ordering::Relaxed) {
                warn!(chunk = first, total_chunks, "document ingest cancelled");
                return Err(Error::Cancelled {
                    progress: IngestProgress {
                        committed,
                        failed_chunk: first,
                        total_chunks,
                    },
                });
            }

            let texts: Vec<String> = batch.iter().map(|(_, chunk)| chunk.to_string()).collect();
            let embeddings = match self.embed_texts(&texts) {
                Ok(embeddings) => embeddings,
                Err(source) => return Err(partial(committed, first, source)),
            };
            for (&(i, chunk), embedding) in batch.iter().zip(embeddings) {
                match self.store.insert(DOCUMENT_CHUNK, chunk, embedding) {
                    Ok(id) => committed.push(id),
                    Err(source) => return Err(partial(committed, i, source)),
                }
            }
        }
        info!(chunks = committed.len(), "added document");
        Ok(committed)
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.embedder.embed_batch(texts)?;
        if embeddings.len() != texts.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "embedder returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }
        embeddings
            .into_iter()
            .map(|e| self.check_embedding(e))
            .collect()
    }

    /// Replace the content of entry `id`, keeping its kind.
    ///
    /// Entries are immutable, so the replacement gets a new id, which is
    /// returned. The swap is atomic for readers.
    pub fn update_setting(&self, id: EntryId, content: &str) -> Result<EntryId> {
        if content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }
        // Fail fast before paying for an embedding.
        self.store.get(id)?;
        let embedding = self.embed(content)?;
        let new_id = self.store.replace(id, content, embedding)?;
        info!(old = %id, new = %new_id, "updated setting");
        Ok(new_id)
    }

    /// Remove an entry and its vector. `false` if it did not exist.
    pub fn delete(&self, id: EntryId) -> Result<bool> {
        let removed = self.store.delete(id)?;
        debug!(%id, removed, "delete");
        Ok(removed)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        self.store.clear()?;
        self.embedder.invalidate_cache();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: EntryId) -> Result<KnowledgeEntry> {
        self.store.get(id)
    }

    /// Entries in insertion order, optionally only those of `kind`.
    pub fn list(&self, kind: Option<&str>) -> Result<Vec<KnowledgeEntry>> {
        self.store.list(kind)
    }

    /// Top-`top_k` entries for `text`, best first.
    ///
    /// An empty knowledge base yields an empty list, not an error.
    pub fn query(&self, text: &str, top_k: usize) -> Result<Vec<(KnowledgeEntry, f32)>> {
        self.query_with(text, &QueryOptions::new(top_k))
    }

    /// Query with the configured default `top_k`.
    pub fn query_default(&self, text: &str) -> Result<Vec<(KnowledgeEntry, f32)>> {
        self.query(text, self.default_top_k)
    }

    #[tracing::instrument(skip_all, fields(top_k = options.top_k))]
    pub fn query_with(
        &self,
        text: &str,
        options: &QueryOptions,
    ) -> Result<Vec<(KnowledgeEntry, f32)>> {
        if options.top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be at least 1".to_string()));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidArgument("query text is empty".to_string()));
        }
        if self.store.is_empty()? {
            return Ok(Vec::new());
        }

        let embedding = self.embed(text)?;
        let mut hits = self
            .store
            .search(&embedding, options.top_k, options.kinds.as_deref())?;
        if let Some(min) = options.min_score {
            hits.retain(|(_, score)| *score >= min);
        }
        debug!(hits = hits.len(), "query");
        Ok(hits)
    }

    /// Prompt-ready context: one `[kind] content` line per retrieved entry,
    /// best first, stopping before the text would exceed `max_chars`
    /// characters.
    pub fn assemble_context(&self, text: &str, top_k: usize, max_chars: usize) -> Result<String> {
        let hits = self.query(text, top_k)?;
        let mut context = String::new();
        let mut used = 0;
        for (entry, _score) in &hits {
            let line = format!("[{}] {}\n", entry.kind, entry.content);
            let len = line.chars().count();
            if used + len > max_chars {
                break;
            }
            context.push_str(&line);
            used += len;
        }
        Ok(context)
    }

    /// [`assemble_context`](Self::assemble_context) with the configured
    /// `default_top_k` and `context_max_chars`.
    pub fn assemble_context_default(&self, text: &str) -> Result<String> {
        self.assemble_context(text, self.default_top_k, self.context_max_chars)
    }

    pub fn stats(&self) -> Result<KnowledgeStats> {
        self.store.stats()
    }

    // -----------------------------------------------------------------------
    // Backup / restore
    // -----------------------------------------------------------------------

    /// Serialise the whole knowledge base (see [`lorebook::backup`]).
    pub fn backup(&self) -> Result<Vec<u8>> {
        let snapshot = self.store.snapshot()?;
        lorebook::backup::encode(snapshot, self.embedder.dimension())
    }

    /// Replace the whole knowledge base with the contents of `blob`.
    ///
    /// The blob is fully validated against this engine's embedder before
    /// anything is touched; on any error the current contents are kept.
    #[tracing::instrument(skip_all, fields(bytes = blob.len()))]
    pub fn restore(&self, blob: &[u8]) -> Result<()> {
        let snapshot = lorebook::backup::decode(blob, self.embedder.dimension())?;
        let entries = snapshot.entries.len();
        self.store.replace_all(snapshot)?;
        self.embedder.invalidate_cache();
        info!(entries, "restored knowledge base");
        Ok(())
    }

    /// Write a backup to `path` atomically. Returns the number of bytes written.
    pub fn backup_to_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let bytes = self.backup()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        info!(path = %path.display(), bytes = bytes.len(), "wrote backup");
        Ok(bytes.len() as u64)
    }

    pub fn restore_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = std::fs::read(path)?;
        self.restore(&blob)
    }
}
