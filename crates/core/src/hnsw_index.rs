//! Approximate nearest-neighbour backend on rust-cv/hnsw.
//!
//! The graph only proposes candidates. Every candidate is re-scored with exact
//! cosine similarity and ranked by the same rule as [`FlatIndex`], so for
//! small and medium stores the results match the flat scan.
//!
//! HNSW has no true deletion. Removed entries are tombstoned and skipped;
//! once tombstones exceed half of the graph it is rebuilt from the live set.
//!
//! [`FlatIndex`]: crate::vector::FlatIndex

use crate::vector::{check_dim, check_query, cosine_with_norms, l2_norm, rank, VectorIndex};
use crate::{EntryId, Result};
use hnsw::{Hnsw, Searcher};
use rand::rngs::StdRng;
use space::{Metric, Neighbor};
use std::collections::{HashMap, HashSet};

/// Floor for the `ef` search parameter (recall vs. speed).
const MIN_EF_SEARCH: usize = 64;
/// Floor for the number of candidates pulled from the graph before re-scoring.
const MIN_CANDIDATES: usize = 16;

/// `1 - cosine`, scaled into `u32` because the graph needs an integer unit.
struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let a: &[f32] = a;
        let b: &[f32] = b;
        let (na, nb) = (l2_norm(a), l2_norm(b));
        if na == 0.0 || nb == 0.0 {
            return u32::MAX;
        }
        let distance = (1.0 - cosine_with_norms(a, na, b, nb)).clamp(0.0, 2.0);
        (distance * (u32::MAX as f32 / 2.0)) as u32
    }
}

type Graph = Hnsw<CosineDistance, Box<[f32]>, StdRng, 16, 32>;

struct Live {
    position: usize,
    embedding: Vec<f32>,
    norm: f32,
}

/// HNSW-backed [`VectorIndex`].
///
/// The graph is built with the default seed, so two indexes fed the same
/// inserts in the same order are identical.
pub struct HnswIndex {
    graph: Graph,
    /// Graph position → entry id. Positions are never reused until rebuild.
    positions: Vec<EntryId>,
    live: HashMap<EntryId, Live>,
    tombstones: HashSet<usize>,
    dim: Option<usize>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("live", &self.live.len())
            .field("tombstones", &self.tombstones.len())
            .field("dim", &self.dim)
            .finish()
    }
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HnswIndex {
    pub fn new() -> Self {
        Self {
            graph: Hnsw::new(CosineDistance),
            positions: Vec::new(),
            live: HashMap::new(),
            tombstones: HashSet::new(),
            dim: None,
        }
    }

    fn push_to_graph(&mut self, id: EntryId, embedding: &[f32]) -> usize {
        let mut searcher = Searcher::default();
        let position = self
            .graph
            .insert(embedding.to_vec().into_boxed_slice(), &mut searcher);
        self.positions.push(id);
        position
    }

    fn tombstone(&mut self, position: usize) {
        self.tombstones.insert(position);
        if self.tombstones.len() * 2 > self.positions.len() {
            self.rebuild();
        }
    }

    /// Rebuild the graph from live entries in ascending id order.
    fn rebuild(&mut self) {
        tracing::debug!(
            live = self.live.len(),
            tombstones = self.tombstones.len(),
            "rebuilding hnsw graph"
        );
        self.graph = Hnsw::new(CosineDistance);
        self.positions.clear();
        self.tombstones.clear();

        let mut ids: Vec<EntryId> = self.live.keys().copied().collect();
        ids.sort();
        for id in ids {
            let embedding = match self.live.get(&id) {
                Some(live) => live.embedding.clone(),
                None => continue,
            };
            let position = self.push_to_graph(id, &embedding);
            if let Some(live) = self.live.get_mut(&id) {
                live.position = position;
            }
        }
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&mut self, id: EntryId, embedding: Vec<f32>) -> Result<()> {
        check_dim(self.dim, &embedding)?;
        self.dim.get_or_insert(embedding.len());

        if let Some(old) = self.live.remove(&id) {
            self.tombstone(old.position);
        }
        let position = self.push_to_graph(id, &embedding);
        let norm = l2_norm(&embedding);
        self.live.insert(
            id,
            Live {
                position,
                embedding,
                norm,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: EntryId) -> bool {
        match self.live.remove(&id) {
            Some(old) => {
                self.tombstone(old.position);
                true
            }
            None => false,
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(EntryId, f32)>> {
        check_query(self.dim, query, k)?;
        if self.live.is_empty() {
            return Ok(Vec::new());
        }

        let wanted = (k.max(MIN_CANDIDATES) + self.tombstones.len()).min(self.positions.len());
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0
            };
            wanted
        ];
        let ef = (wanted * 2).max(MIN_EF_SEARCH);
        let query_box = query.to_vec().into_boxed_slice();
        let mut searcher = Searcher::default();
        self.graph
            .nearest(&query_box, ef, &mut searcher, &mut neighbors);

        let query_norm = l2_norm(query);
        let mut scored: Vec<(EntryId, f32)> = neighbors
            .into_iter()
            .filter(|n| n.index != !0)
            .filter(|n| !self.tombstones.contains(&n.index))
            .filter_map(|n| {
                let id = *self.positions.get(n.index)?;
                let live = self.live.get(&id)?;
                Some((
                    id,
                    cosine_with_norms(query, query_norm, &live.embedding, live.norm),
                ))
            })
            .collect();

        rank(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    fn get(&self, id: EntryId) -> Option<&[f32]> {
        self.live.get(&id).map(|l| l.embedding.as_slice())
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}
