//! Core data models shared by the index, the edit applier and the repair loop.
//!
//! Everything that crosses a process boundary (the snapshot on disk, the
//! edit list from the fix service, the final [`crate::repair::RepairResult`])
//! derives `serde` so its JSON shape is fixed in one place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a chunk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    File,
}

/// A retrievable unit of source text with its location.
///
/// `id` depends only on `(file_path, start_line, end_line)`; see
/// [`crate::chunk::chunk_id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    /// Root-relative path with `/` separators.
    pub file_path: String,
    pub kind: ChunkKind,
    pub name: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// The persisted embedding index, one per project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Absolute project root the snapshot was built from.
    pub root: String,
    /// Embedding model id.
    pub model: String,
    pub index: Vec<Chunk>,
}

impl IndexSnapshot {
    /// Dimensionality shared by every embedded chunk, if any chunk has one.
    pub fn dims(&self) -> Option<usize> {
        self.index
            .iter()
            .find_map(|c| c.embedding.as_ref().map(|e| e.len()))
    }
}

/// How an [`Edit`] mutates its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    ReplaceFile {
        new_content: String,
    },
    /// Lines are 1-based and inclusive; out-of-range bounds are clamped.
    ReplaceRange {
        start_line: i64,
        end_line: i64,
        new_text: String,
    },
}

impl EditOp {
    pub fn strategy(&self) -> &'static str {
        match self {
            EditOp::ReplaceFile { .. } => "replace_file",
            EditOp::ReplaceRange { .. } => "replace_range",
        }
    }
}

/// A single proposed change to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub path: String,
    pub op: EditOp,
}

impl Edit {
    pub fn replace_file(path: &str, new_content: &str) -> Self {
        Self {
            path: path.to_string(),
            op: EditOp::ReplaceFile {
                new_content: new_content.to_string(),
            },
        }
    }

    pub fn replace_range(path: &str, start_line: i64, end_line: i64, new_text: &str) -> Self {
        Self {
            path: path.to_string(),
            op: EditOp::ReplaceRange {
                start_line,
                end_line,
                new_text: new_text.to_string(),
            },
        }
    }

    /// Validate one raw entry of a fix proposal's `edits` array.
    ///
    /// The error string becomes the per-edit `reason`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "edit must be a JSON object".to_string())?;

        let path = obj
            .get("path")
            .and_then(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "edit is missing a string 'path'".to_string())?;

        let strategy = obj.get("strategy").and_then(|s| s.as_str()).unwrap_or("");

        match strategy {
            "replace_file" => {
                let new_content = obj
                    .get("new_content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| "replace_file requires string 'new_content'".to_string())?;
                Ok(Edit::replace_file(path, new_content))
            }
            "replace_range" => {
                let start = obj.get("startLine").and_then(|v| v.as_i64());
                let end = obj.get("endLine").and_then(|v| v.as_i64());
                let text = obj.get("new_text").and_then(|v| v.as_str());
                match (start, end, text) {
                    (Some(s), Some(e), Some(t)) => Ok(Edit::replace_range(path, s, e, t)),
                    _ => Err(
                        "replace_range requires integer 'startLine'/'endLine' and string 'new_text'"
                            .to_string(),
                    ),
                }
            }
            "" => Err("edit is missing 'strategy'".to_string()),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// Per-edit result from the applier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub path: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EditOutcome {
    pub fn applied(path: &str, strategy: &str) -> Self {
        Self {
            path: path.to_string(),
            ok: true,
            strategy: Some(strategy.to_string()),
            reason: None,
        }
    }

    pub fn failed(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            ok: false,
            strategy: None,
            reason: Some(reason.into()),
        }
    }
}

/// Category of a recovered, non-fatal problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Source text did not parse; a whole-file chunk was used instead.
    Parse,
    /// A file was unreadable or skipped while indexing.
    Scan,
    /// A pre-edit backup copy could not be written.
    Backup,
    /// Context retrieval failed; the fix request went out without excerpts.
    Retrieval,
    /// The fix service failed or answered with something unusable.
    Proposal,
    /// The target could not be read or restored.
    Target,
}

/// An observable record of a swallowed error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.map(|p| p.to_string()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_from_value_replace_file() {
        let edit = Edit::from_value(&json!({
            "path": "src/a.lua",
            "strategy": "replace_file",
            "new_content": "return 1"
        }))
        .unwrap();
        assert_eq!(edit, Edit::replace_file("src/a.lua", "return 1"));
    }

    #[test]
    fn test_edit_from_value_replace_range() {
        let edit = Edit::from_value(&json!({
            "path": "a.js",
            "strategy": "replace_range",
            "startLine": 2,
            "endLine": 3,
            "new_text": "X\nY"
        }))
        .unwrap();
        assert_eq!(edit.op.strategy(), "replace_range");
    }

    #[test]
    fn test_edit_from_value_rejects_float_lines() {
        let err = Edit::from_value(&json!({
            "path": "a.js",
            "strategy": "replace_range",
            "startLine": 2.5,
            "endLine": 3,
            "new_text": "X"
        }))
        .unwrap_err();
        assert!(err.contains("replace_range requires"));
    }

    #[test]
    fn test_edit_from_value_unknown_strategy() {
        let err = Edit::from_value(&json!({"path": "a.js", "strategy": "patch"})).unwrap_err();
        assert_eq!(err, "unknown strategy: patch");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snap = IndexSnapshot {
            created_at: 1,
            root: "/p".to_string(),
            model: "m".to_string(),
            index: vec![Chunk {
                id: "abc".to_string(),
                file_path: "a.js".to_string(),
                kind: ChunkKind::Function,
                name: "f".to_string(),
                start_line: 1,
                end_line: 2,
                text: "function f() {}".to_string(),
                embedding: Some(vec![0.5, 0.5]),
            }],
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["createdAt"], 1);
        assert_eq!(v["index"][0]["filePath"], "a.js");
        assert_eq!(v["index"][0]["kind"], "function");
        assert_eq!(v["index"][0]["startLine"], 1);
        assert_eq!(snap.dims(), Some(2));
    }
}
