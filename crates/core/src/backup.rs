//! Versioned backup format.
//!
//! A backup is a JSON document:
//!
//! ```json
//! {
//!   "format": "lorebook-backup",
//!   "version": 1,
//!   "dimension": 384,
//!   "next_id": 42,
//!   "created_at": "2026-01-01T00:00:00Z",
//!   "entries": [
//!     { "id": 1, "kind": "character", "content": "...", "embedding": [..], "created_at": "..." }
//!   ]
//! }
//! ```
//!
//! Decoding checks the header before trusting the body: the format tag and
//! version are read first, then the body is parsed and validated as a whole.
//! Nothing is applied to a store until [`decode`] has returned `Ok`.

use crate::{EntryId, KnowledgeEntry, LorebookError, Result, StoreSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Format tag written into every backup.
pub const FORMAT: &str = "lorebook-backup";
/// Current (and only) supported version.
pub const VERSION: u32 = 1;

#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct BackupV1 {
    format: String,
    version: u32,
    dimension: usize,
    next_id: u64,
    created_at: DateTime<Utc>,
    entries: Vec<KnowledgeEntry>,
}

/// Serialise `snapshot` as a version-1 backup.
///
/// `dimension` is written even for an empty store so a later restore can be
/// checked against the embedder.
pub fn encode(snapshot: StoreSnapshot, dimension: usize) -> Result<Vec<u8>> {
    if let Some(d) = snapshot.dimension {
        if d != dimension {
            return Err(LorebookError::DimensionMismatch {
                expected: dimension,
                actual: d,
            });
        }
    }
    let blob = BackupV1 {
        format: FORMAT.to_string(),
        version: VERSION,
        dimension,
        next_id: snapshot.next_id,
        created_at: Utc::now(),
        entries: snapshot.entries,
    };
    Ok(serde_json::to_vec(&blob)?)
}

/// Parse and validate a backup against the embedder's `expected_dimension`.
///
/// # Errors
/// - [`LorebookError::CorruptBackup`]: not JSON, wrong format tag, malformed
///   body, duplicate ids or blank content.
/// - [`LorebookError::UnsupportedBackupVersion`]: a version other than
///   [`VERSION`].
/// - [`LorebookError::IncompatibleBackup`]: header dimension differs from
///   `expected_dimension`, or an entry's embedding differs from the header.
pub fn decode(bytes: &[u8], expected_dimension: usize) -> Result<StoreSnapshot> {
    let header: Header = serde_json::from_slice(bytes)
        .map_err(|e| LorebookError::CorruptBackup(format!("unreadable header: {e}")))?;
    if header.format != FORMAT {
        return Err(LorebookError::CorruptBackup(format!(
            "unknown format tag {:?}",
            header.format
        )));
    }
    if header.version != VERSION {
        return Err(LorebookError::UnsupportedBackupVersion(header.version));
    }

    let blob: BackupV1 = serde_json::from_slice(bytes)
        .map_err(|e| LorebookError::CorruptBackup(format!("malformed body: {e}")))?;

    if blob.dimension != expected_dimension {
        return Err(LorebookError::IncompatibleBackup(format!(
            "backup has embedding dimension {}, embedder produces {expected_dimension}",
            blob.dimension
        )));
    }

    let mut seen: HashSet<EntryId> = HashSet::with_capacity(blob.entries.len());
    for entry in &blob.entries {
        if entry.embedding.len() != blob.dimension {
            return Err(LorebookError::IncompatibleBackup(format!(
                "entry {} has embedding dimension {}, header says {}",
                entry.id,
                entry.embedding.len(),
                blob.dimension
            )));
        }
        if !seen.insert(entry.id) {
            return Err(LorebookError::CorruptBackup(format!(
                "duplicate entry id {}",
                entry.id
            )));
        }
        if entry.content.trim().is_empty() {
            return Err(LorebookError::CorruptBackup(format!(
                "entry {} has blank content",
                entry.id
            )));
        }
    }

    let max_id = blob.entries.iter().map(|e| e.id.0).max();
    let next_id = match max_id {
        Some(m) => blob.next_id.max(m + 1),
        None => blob.next_id,
    };

    let mut entries = blob.entries;
    entries.sort_by_key(|e| e.id);

    Ok(StoreSnapshot {
        dimension: if entries.is_empty() {
            None
        } else {
            Some(blob.dimension)
        },
        next_id,
        entries,
    })
}
