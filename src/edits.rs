//! Applies proposed edits to files on disk.
//!
//! Each edit is validated and applied on its own; a bad edit produces a
//! failed [`EditOutcome`] and the batch carries on. Before an existing file
//! is touched, a timestamped copy is written to the backup directory.
//! Backups are best effort: a failed copy becomes a [`Warning`], never an
//! edit failure.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::{Edit, EditOp, EditOutcome, Warning, WarningKind};

/// Everything that happened while applying one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<EditOutcome>,
    pub warnings: Vec<Warning>,
}

impl ApplyReport {
    /// Number of edits that were written.
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }
}

pub struct EditApplier {
    root: PathBuf,
    backup_dir: PathBuf,
}

impl EditApplier {
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.project.root.clone(), config.backup_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute target for an edit path; relative paths are under the root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    /// Validate and apply raw edit entries in order.
    pub fn apply(&self, edits: &[Value]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for value in edits {
            let outcome = match Edit::from_value(value) {
                Ok(edit) => self.apply_edit(&edit, &mut report.warnings),
                Err(reason) => {
                    let path = value.get("path").and_then(|p| p.as_str()).unwrap_or("");
                    EditOutcome::failed(path, reason)
                }
            };
            if outcome.ok {
                tracing::info!(path = %outcome.path, strategy = ?outcome.strategy, "applied edit");
            } else {
                tracing::warn!(path = %outcome.path, reason = ?outcome.reason, "edit rejected");
            }
            report.outcomes.push(outcome);
        }
        report
    }

    /// Apply one validated edit. Backup problems are pushed onto `warnings`.
    pub fn apply_edit(&self, edit: &Edit, warnings: &mut Vec<Warning>) -> EditOutcome {
        let target = self.resolve(&edit.path);
        let strategy = edit.op.strategy();

        if target.exists() {
            if let Err(e) = self.backup(&target) {
                warnings.push(Warning::new(
                    WarningKind::Backup,
                    Some(&edit.path),
                    format!("{:#}", e),
                ));
            }
        } else if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return EditOutcome::failed(
                    &edit.path,
                    format!("failed to create {}: {}", parent.display(), e),
                );
            }
        }

        let written = match &edit.op {
            EditOp::ReplaceFile { new_content } => std::fs::write(&target, new_content)
                .with_context(|| format!("failed to write {}", target.display())),
            EditOp::ReplaceRange {
                start_line,
                end_line,
                new_text,
            } => read_or_empty(&target).and_then(|original| {
                let updated = replace_lines(&original, *start_line, *end_line, new_text);
                std::fs::write(&target, updated)
                    .with_context(|| format!("failed to write {}", target.display()))
            }),
        };

        match written {
            Ok(()) => EditOutcome::applied(&edit.path, strategy),
            Err(e) => EditOutcome::failed(&edit.path, format!("{:#}", e)),
        }
    }

    /// Copy `target` into the backup directory. Never replaces an earlier
    /// backup: a name collision within the same millisecond gets a counter.
    fn backup(&self, target: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("failed to create {}", self.backup_dir.display()))?;
        let base = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let stamp = backup_stamp();

        let mut attempt = 0u32;
        let (dest, mut file) = loop {
            let name = if attempt == 0 {
                format!("{}.{}.bak", base, stamp)
            } else {
                format!("{}.{}-{}.bak", base, stamp, attempt)
            };
            let dest = self.backup_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&dest) {
                Ok(file) => break (dest, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create {}", dest.display()))
                }
            }
        };

        let mut source = File::open(target)
            .with_context(|| format!("failed to open {}", target.display()))?;
        std::io::copy(&mut source, &mut file)
            .with_context(|| format!("failed to back up {} to {}", target.display(), dest.display()))?;
        tracing::debug!(from = %target.display(), to = %dest.display(), "backup written");
        Ok(dest)
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// UTC timestamp safe for file names, e.g. `2026-10-19T08-30-12-345Z`.
fn backup_stamp() -> String {
    Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Replace the inclusive 1-based line range `[start, end]` with `new_text`.
///
/// `start` is clamped into `[1, n]` and `end` into `[start, n]`, where `n`
/// is the number of `\n`-separated lines (an empty string has one).
pub fn replace_lines(original: &str, start: i64, end: i64, new_text: &str) -> String {
    let lines: Vec<&str> = original.split('\n').collect();
    let n = lines.len() as i64;
    let start = start.clamp(1, n);
    let end = end.clamp(start, n);

    let (s, e) = ((start - 1) as usize, end as usize);
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..s]);
    out.extend(new_text.split('\n'));
    out.extend_from_slice(&lines[e..]);
    out.join("\n")
}
