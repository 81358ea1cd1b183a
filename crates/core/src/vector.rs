//! Vector index capability for similarity retrieval.
//!
//! Two interchangeable implementations sit behind [`VectorIndex`]:
//!
//! - [`FlatIndex`]: exact (brute-force) cosine similarity over every stored
//!   embedding. This is the baseline and the default.
//! - `HnswIndex` (cargo feature `hnsw`): approximate graph search whose
//!   candidates are re-scored exactly, so ordering rules are shared.
//!
//! Which one a store uses is decided by [`IndexKind`] at open time, never by
//! the engine code paths.
//!
//! # Complexity (flat)
//! - `insert`, `get`: O(1) amortised via an id → slot map
//! - `remove`: O(1) swap-remove
//! - `search`: O(n·d) where d is the embedding dimension

use crate::{EntryId, LorebookError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Nearest-neighbour index keyed by [`EntryId`].
///
/// Implementations hold the only in-memory copy of each embedding; the
/// store hydrates [`KnowledgeEntry`](crate::KnowledgeEntry) values from
/// [`VectorIndex::get`].
pub trait VectorIndex: Send + Sync + std::fmt::Debug {
    /// Insert the embedding for `id`, replacing any previous one.
    ///
    /// # Errors
    /// [`LorebookError::DimensionMismatch`] if the embedding is empty or its
    /// length differs from the dimension established by the first insert.
    fn insert(&mut self, id: EntryId, embedding: Vec<f32>) -> Result<()>;

    /// Remove the embedding for `id`. Returns `false` if it was absent.
    fn remove(&mut self, id: EntryId) -> bool;

    /// Top-`k` ids by cosine similarity to `query`.
    ///
    /// Sorted by descending score, ties broken by ascending id. `k` larger
    /// than [`len`](VectorIndex::len) returns everything.
    ///
    /// # Errors
    /// [`LorebookError::InvalidArgument`] for `k == 0`,
    /// [`LorebookError::DimensionMismatch`] for a query of the wrong length.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(EntryId, f32)>>;

    /// The stored embedding for `id`.
    fn get(&self, id: EntryId) -> Option<&[f32]>;

    /// Number of stored embeddings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Established embedding dimension, `None` until the first insert.
    fn dim(&self) -> Option<usize>;

    /// Drop every embedding and forget the dimension.
    fn clear(&mut self);
}

/// Which [`VectorIndex`] implementation a store builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Brute-force cosine scan ([`FlatIndex`]).
    #[default]
    Exact,
    /// Approximate HNSW graph with exact re-scoring. Requires the `hnsw`
    /// cargo feature.
    Hnsw,
}

impl IndexKind {
    /// Construct an empty index of this kind.
    ///
    /// # Errors
    /// [`LorebookError::InvalidConfiguration`] when `Hnsw` is requested from a
    /// build without the `hnsw` feature.
    pub fn build(self) -> Result<Box<dyn VectorIndex>> {
        match self {
            IndexKind::Exact => Ok(Box::new(FlatIndex::new())),
            #[cfg(feature = "hnsw")]
            IndexKind::Hnsw => Ok(Box::new(crate::hnsw_index::HnswIndex::new())),
            #[cfg(not(feature = "hnsw"))]
            IndexKind::Hnsw => Err(LorebookError::InvalidConfiguration(
                "hnsw index requested but the `hnsw` feature is disabled for this build"
                    .to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: EntryId,
    embedding: Vec<f32>,
    norm: f32,
}

/// Flat vector index: exact cosine similarity against every stored embedding.
#[derive(Debug, Default, Clone)]
pub struct FlatIndex {
    slots: Vec<Slot>,
    /// Position of each id in `slots`.
    positions: HashMap<EntryId, usize>,
    /// Set on first insert; later inserts and queries are validated against it.
    dim: Option<usize>,
}

impl FlatIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, id: EntryId, embedding: Vec<f32>) -> Result<()> {
        check_dim(self.dim, &embedding)?;
        self.dim.get_or_insert(embedding.len());

        let norm = l2_norm(&embedding);
        match self.positions.get(&id) {
            Some(&pos) => {
                let slot = &mut self.slots[pos];
                slot.embedding = embedding;
                slot.norm = norm;
            }
            None => {
                self.positions.insert(id, self.slots.len());
                self.slots.push(Slot {
                    id,
                    embedding,
                    norm,
                });
            }
        }
        Ok(())
    }

    /// Swap-remove; order of `slots` is irrelevant because search re-ranks.
    fn remove(&mut self, id: EntryId) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };
        self.slots.swap_remove(pos);
        if let Some(moved) = self.slots.get(pos) {
            self.positions.insert(moved.id, pos);
        }
        true
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(EntryId, f32)>> {
        check_query(self.dim, query, k)?;
        if self.slots.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<(EntryId, f32)> = self
            .slots
            .iter()
            .map(|s| (s.id, cosine_with_norms(query, query_norm, &s.embedding, s.norm)))
            .collect();

        rank(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    fn get(&self, id: EntryId) -> Option<&[f32]> {
        self.positions
            .get(&id)
            .map(|&pos| self.slots[pos].embedding.as_slice())
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.positions.clear();
        self.dim = None;
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Validate an embedding about to be inserted against the established
/// dimension. Every component must be finite.
pub(crate) fn check_dim(dim: Option<usize>, embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(LorebookError::DimensionMismatch {
            expected: dim.unwrap_or(0),
            actual: 0,
        });
    }
    if let Some(d) = dim.filter(|d| *d != embedding.len()) {
        return Err(LorebookError::DimensionMismatch {
            expected: d,
            actual: embedding.len(),
        });
    }
    check_finite(embedding)
}

/// Reject NaN and infinite components.
pub fn check_finite(embedding: &[f32]) -> Result<()> {
    match embedding.iter().position(|x| !x.is_finite()) {
        Some(pos) => Err(LorebookError::InvalidArgument(format!(
            "embedding component {pos} is not finite ({})",
            embedding[pos]
        ))),
        None => Ok(()),
    }
}

/// Validate search arguments. An index with no established dimension accepts
/// any query length (it has nothing to compare against).
pub(crate) fn check_query(dim: Option<usize>, query: &[f32], k: usize) -> Result<()> {
    if k == 0 {
        return Err(LorebookError::InvalidArgument(
            "k must be at least 1".to_string(),
        ));
    }
    match dim {
        Some(d) if d != query.len() => Err(LorebookError::DimensionMismatch {
            expected: d,
            actual: query.len(),
        }),
        _ => Ok(()),
    }
}

/// Sort by descending score, then ascending id. `total_cmp` keeps the order
/// total even if a NaN score slips through.
pub(crate) fn rank(scored: &mut [(EntryId, f32)]) {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

/// Euclidean (L2) norm of `v`.
pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between `a` and `b`.
///
/// Returns `0.0` if either side is the zero vector or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, l2_norm(a), b, l2_norm(b))
}

pub(crate) fn cosine_with_norms(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    // `zip` would silently truncate mismatched inputs.
    if a.len() != b.len() || a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
