//! Project-wide embedding index.
//!
//! [`EmbeddingIndex::build`] walks the project root, chunks every eligible
//! file, embeds all chunk texts in one batch and writes a fresh
//! [`IndexSnapshot`]. There is no incremental path: any source change is
//! picked up only by the next full build.
//!
//! The snapshot is written to a temporary sibling file and renamed into
//! place, so readers see either the old snapshot or the new one.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::extract_chunks;
use crate::config::{Config, IndexConfig};
use crate::embedding::{check_batch, EmbeddingProvider};
use crate::models::{Chunk, IndexSnapshot, Warning, WarningKind};

/// Summary of a build, for display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub chunks: usize,
    pub warnings: Vec<Warning>,
}

/// Chunks gathered from disk before embedding.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub chunks: Vec<Chunk>,
    pub report: IndexReport,
}

pub struct EmbeddingIndex {
    root: PathBuf,
    snapshot_path: PathBuf,
    settings: IndexConfig,
}

impl EmbeddingIndex {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.project.root.clone(),
            snapshot_path: config.snapshot_path(),
            settings: config.index.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Walk the root and chunk every eligible file. Unreadable files are
    /// skipped and reported as warnings.
    pub fn scan(&self) -> Result<ScanOutput> {
        let excludes = build_globset(&self.settings.exclude_globs)?;
        let mut out = ScanOutput::default();

        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && self
                        .settings
                        .exclude_dirs
                        .iter()
                        .any(|d| e.file_name().to_string_lossy() == d.as_str()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    out.report.files_skipped += 1;
                    out.report
                        .warnings
                        .push(Warning::new(WarningKind::Scan, None, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let rel = relative_path(&self.root, path);

            if !self.has_allowed_extension(path) || excludes.is_match(&rel) {
                continue;
            }

            match self.read_eligible(path) {
                Ok(text) => {
                    let extraction = extract_chunks(&rel, &text, self.settings.max_chunk_chars);
                    if let Some(w) = extraction.warning {
                        tracing::debug!(path = %rel, reason = %w.message, "parse fallback");
                        out.report.warnings.push(w);
                    }
                    out.report.files_scanned += 1;
                    out.chunks.extend(extraction.chunks);
                }
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "skipping file");
                    out.report.files_skipped += 1;
                    out.report.warnings.push(Warning::new(
                        WarningKind::Scan,
                        Some(&rel),
                        format!("{:#}", e),
                    ));
                }
            }
        }

        out.report.chunks = out.chunks.len();
        Ok(out)
    }

    /// Full rebuild: scan, embed in one batch, persist.
    pub async fn build(
        &self,
        provider: &dyn EmbeddingProvider,
    ) -> Result<(IndexSnapshot, IndexReport)> {
        let ScanOutput { mut chunks, report } = self.scan()?;

        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = provider
                .embed_batch(&texts)
                .await
                .context("Failed to embed index chunks")?;
            check_batch(texts.len(), &vectors)?;
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
        }

        let snapshot = IndexSnapshot {
            created_at: chrono::Utc::now().timestamp_millis(),
            root: absolute_root(&self.root),
            model: provider.model_name().to_string(),
            index: chunks,
        };
        save_snapshot(&self.snapshot_path, &snapshot)?;

        tracing::info!(
            files = report.files_scanned,
            chunks = report.chunks,
            path = %self.snapshot_path.display(),
            "index built"
        );
        Ok((snapshot, report))
    }

    /// Read the persisted snapshot. `None` when absent or unreadable.
    pub fn load(&self) -> Option<IndexSnapshot> {
        load_snapshot(&self.snapshot_path)
    }

    /// A snapshot built for a different root or embedding model must be rebuilt.
    pub fn is_stale(&self, snapshot: &IndexSnapshot, model: &str) -> bool {
        snapshot.root != absolute_root(&self.root) || snapshot.model != model
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.settings
                    .extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    fn read_eligible(&self, path: &Path) -> Result<String> {
        let len = std::fs::metadata(path)?.len();
        if len > self.settings.max_file_bytes {
            anyhow::bail!(
                "file is {} bytes, over the {} byte limit",
                len,
                self.settings.max_file_bytes
            );
        }
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

/// Read and parse a snapshot file. Missing or malformed files yield `None`.
pub fn load_snapshot(path: &Path) -> Option<IndexSnapshot> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read snapshot");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed snapshot");
            None
        }
    }
}

/// Write a snapshot atomically (temp file + rename).
pub fn save_snapshot(path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let json = serde_json::to_vec(snapshot)?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
    Ok(())
}

fn absolute_root(root: &Path) -> String {
    root.canonicalize()
        .unwrap_or_else(|_| root.to_path_buf())
        .to_string_lossy()
        .to_string()
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
