//! Text → vector capability.
//!
//! The engine only talks to [`Embedder`]. Two providers ship with the crate:
//! [`HashingEmbedder`] (offline, deterministic) and, behind the `remote`
//! feature, [`RemoteEmbedder`](crate::remote::RemoteEmbedder). Either can be
//! wrapped in [`CachedEmbedder`].

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use lorebook::{LorebookError, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Maps text to a fixed-length vector.
///
/// Implementations must be deterministic for identical input and must
/// always return vectors of length [`dimension`](Embedder::dimension).
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// # Errors
    /// [`LorebookError::EmbeddingUnavailable`] when the provider can not
    /// produce a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Drop any memoised vectors. No-op for uncached embedders.
    fn invalidate_cache(&self) {}
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
    fn invalidate_cache(&self) {
        (**self).invalidate_cache()
    }
}

impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
    fn invalidate_cache(&self) {
        (**self).invalidate_cache()
    }
}

// ---------------------------------------------------------------------------
// Hashing embedder
// ---------------------------------------------------------------------------

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Signed feature hashing over lowercase word tokens and character trigrams.
///
/// Texts that share words or spellings land close together; no model files or
/// network access are needed. Output is L2-normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 384;

    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(LorebookError::InvalidConfiguration(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn add_feature(&self, vector: &mut [f32], namespace: &[u8], feature: &str, weight: f32) {
        let digest = Sha256::new()
            .chain_update(namespace)
            .chain_update([0u8])
            .chain_update(feature.as_bytes())
            .finalize();
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: Self::DEFAULT_DIMENSION,
        }
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        let mut vector = vec![0.0f32; self.dimension];

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, b"w", word, WORD_WEIGHT);
        }

        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            self.add_feature(&mut vector, b"t", &trigram, TRIGRAM_WEIGHT);
        }

        let mut norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            // Short punctuation-only input: hash the whole string so the
            // vector is never all zeros.
            self.add_feature(&mut vector, b"s", &lower, WORD_WEIGHT);
            norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        }
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type CacheKey = [u8; 32];

#[derive(Default)]
struct CacheState {
    vectors: HashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
}

/// Hit/miss counters for a [`CachedEmbedder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

/// Bounded memoising wrapper around another embedder.
///
/// Keys are SHA-256 digests of the input text; the oldest insertion is
/// evicted first once `capacity` is reached. The inner embedder is called
/// without holding the cache lock.
pub struct CachedEmbedder<E> {
    inner: E,
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        let len = self.state.lock().map(|s| s.vectors.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len,
        }
    }

    fn key(text: &str) -> CacheKey {
        Sha256::digest(text.as_bytes()).into()
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let state = self
            .state
            .lock()
            .map_err(|_| LorebookError::Internal("embedding cache lock poisoned".into()))?;
        Ok(state.vectors.get(key).cloned())
    }

    fn remember(&self, key: CacheKey, vector: &[f32]) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| LorebookError::Internal("embedding cache lock poisoned".into()))?;
        if state.vectors.contains_key(&key) {
            return Ok(());
        }
        while state.vectors.len() >= self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.vectors.remove(&oldest);
                }
                None => break,
            }
        }
        state.vectors.insert(key, vector.to_vec());
        state.order.push_back(key);
        Ok(())
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::key(text);
        if let Some(hit) = self.lookup(&key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = self.inner.embed(text)?;
        self.remember(key, &vector)?;
        Ok(vector)
    }

    /// Cache hits are served locally; the misses go to the inner embedder in
    /// one batch.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<CacheKey> = texts.iter().map(|t| Self::key(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let hit = self.lookup(key)?;
            if hit.is_none() {
                missing.push(i);
            }
            out.push(hit);
        }
        self.hits
            .fetch_add((texts.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed_batch(&batch)?;
            if vectors.len() != batch.len() {
                return Err(LorebookError::EmbeddingUnavailable(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (&i, vector) in missing.iter().zip(vectors) {
                self.remember(keys[i], &vector)?;
                out[i] = Some(vector);
            }
        }
        out.into_iter()
            .map(|v| v.ok_or_else(|| LorebookError::Internal("batch slot left empty".into())))
            .collect()
    }

    fn invalidate_cache(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.vectors.clear();
            state.order.clear();
        }
        self.inner.invalidate_cache();
    }
}

/// Build the embedder described by `config`, cached unless
/// `cache_capacity` is zero.
pub fn from_config(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let base: Box<dyn Embedder> = match config.provider {
        EmbeddingProvider::Local => Box::new(HashingEmbedder::new(config.dimension)?),
        EmbeddingProvider::Remote => remote_from_config(config)?,
    };
    info!(
        provider = ?config.provider,
        dimension = base.dimension(),
        cache_capacity = config.cache_capacity,
        "embedder ready"
    );
    if config.cache_capacity == 0 {
        return Ok(base);
    }
    Ok(Box::new(CachedEmbedder::new(base, config.cache_capacity)))
}

#[cfg(feature = "remote")]
fn remote_from_config(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    Ok(Box::new(crate::remote::RemoteEmbedder::from_config(config)?))
}

#[cfg(not(feature = "remote"))]
fn remote_from_config(_config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    Err(LorebookError::InvalidConfiguration(
        "remote embedding provider requires the `remote` cargo feature".to_string(),
    ))
}
