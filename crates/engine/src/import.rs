//! Bulk import of text files from a directory tree.

use crate::{EntryId, Error, KnowledgeEngine, Result};
use lorebook::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Extensions to import, matched case-insensitively, with or without the
    /// leading dot.
    pub extensions: Vec<String>,
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            extensions: vec![".txt".to_string()],
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ImportOptions {
    /// Default extensions with the engine's configured chunking.
    pub fn for_engine(engine: &KnowledgeEngine) -> Self {
        let chunking = engine.chunking();
        Self {
            chunk_size: chunking.size(),
            overlap: chunking.overlap(),
            ..Self::default()
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedFile {
    pub path: PathBuf,
    pub ids: Vec<EntryId>,
}

#[derive(Debug)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<ImportedFile>,
    pub failed: Vec<FailedFile>,
}

impl ImportReport {
    pub fn success_count(&self) -> usize {
        self.imported.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

/// Feed every matching file under `dir` to
/// [`KnowledgeEngine::add_document`], in sorted path order.
///
/// Per-file problems (unreadable, not UTF-8, empty, embedder failure) are
/// collected in the report and do not stop the import.
///
/// # Errors
/// [`Error::InvalidArgument`] if `dir` is missing or not a directory.
pub fn import_directory(
    engine: &KnowledgeEngine,
    dir: impl AsRef<Path>,
    options: &ImportOptions,
) -> Result<ImportReport> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| options.matches(path))
        .collect();
    paths.sort();

    let mut report = ImportReport::default();
    for path in paths {
        match import_file(engine, &path, options) {
            Ok(ids) => report.imported.push(ImportedFile { path, ids }),
            Err(error) => {
                warn!(path = %path.display(), %error, "import failed");
                report.failed.push(FailedFile { path, error });
            }
        }
    }

    info!(
        dir = %dir.display(),
        imported = report.success_count(),
        failed = report.failure_count(),
        "directory import finished"
    );
    Ok(report)
}

fn import_file(
    engine: &KnowledgeEngine,
    path: &Path,
    options: &ImportOptions,
) -> Result<Vec<EntryId>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|_| {
        Error::InvalidArgument(format!("{} is not valid UTF-8", path.display()))
    })?;
    engine.add_document(&text, options.chunk_size, options.overlap)
}
