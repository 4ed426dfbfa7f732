//! Function-level source chunker.
//!
//! Parses a file with tree-sitter and emits one [`Chunk`] per function-like
//! node, sliced from the original text by 1-based line range. Slicing is
//! line-granular, so a chunk may carry sibling code that shares its first
//! or last line.
//!
//! Files with no grammar, files that fail to parse, and files without any
//! functions become a single whole-file chunk. Chunk ids are a hash of
//! `(path, start_line, end_line)`, so re-indexing unchanged code yields the
//! same ids.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tree_sitter::{Language, Node, Parser};

use crate::models::{Chunk, ChunkKind, Warning, WarningKind};

/// Node kinds treated as functions across the supported grammars.
const FUNCTION_KINDS: &[&str] = &[
    // JavaScript / TypeScript
    "function_declaration",
    "generator_function_declaration",
    "function_expression",
    "generator_function",
    "arrow_function",
    "method_definition",
    // Python
    "function_definition",
    // Rust
    "function_item",
];

/// Languages with a tree-sitter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    Rust,
}

impl SourceLanguage {
    /// Pick a grammar from the file extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "js" | "mjs" | "cjs" | "jsx" => Some(SourceLanguage::JavaScript),
            "ts" | "mts" | "cts" => Some(SourceLanguage::TypeScript),
            "tsx" => Some(SourceLanguage::Tsx),
            "py" => Some(SourceLanguage::Python),
            "rs" => Some(SourceLanguage::Rust),
            _ => None,
        }
    }

    fn grammar(&self) -> Language {
        match self {
            SourceLanguage::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            SourceLanguage::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            SourceLanguage::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            SourceLanguage::Python => tree_sitter_python::LANGUAGE.into(),
            SourceLanguage::Rust => tree_sitter_rust::LANGUAGE.into(),
        }
    }
}

/// Result of chunking one file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub chunks: Vec<Chunk>,
    /// Set when the file fell back to a whole-file chunk because it did not parse.
    pub warning: Option<Warning>,
}

/// Split `text` (the content of `path`) into chunks.
///
/// Never fails: anything the parser cannot handle becomes one chunk
/// spanning line 1 to the last line.
pub fn extract_chunks(path: &str, text: &str, max_chars: usize) -> Extraction {
    let lines: Vec<&str> = text.split('\n').collect();

    let Some(language) = SourceLanguage::from_path(path) else {
        return Extraction {
            chunks: vec![file_chunk(path, text, lines.len(), max_chars)],
            warning: None,
        };
    };

    match function_spans(text, language) {
        Ok(spans) if !spans.is_empty() => {
            let chunks = spans
                .into_iter()
                .map(|(name, start, end)| {
                    let body = slice_lines(&lines, start, end);
                    Chunk {
                        id: chunk_id(path, start, end),
                        file_path: path.to_string(),
                        kind: ChunkKind::Function,
                        name,
                        start_line: start,
                        end_line: end,
                        text: truncate_chars(&body, max_chars),
                        embedding: None,
                    }
                })
                .collect();
            Extraction {
                chunks,
                warning: None,
            }
        }
        Ok(_) => Extraction {
            chunks: vec![file_chunk(path, text, lines.len(), max_chars)],
            warning: None,
        },
        Err(reason) => Extraction {
            chunks: vec![file_chunk(path, text, lines.len(), max_chars)],
            warning: Some(Warning::new(WarningKind::Parse, Some(path), reason)),
        },
    }
}

/// Deterministic chunk id: hex of the first 16 bytes of
/// `sha256("{path}:{start}:{end}")`.
pub fn chunk_id(path: &str, start_line: usize, end_line: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", path, start_line, end_line).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn file_chunk(path: &str, text: &str, line_count: usize, max_chars: usize) -> Chunk {
    let end = line_count.max(1);
    Chunk {
        id: chunk_id(path, 1, end),
        file_path: path.to_string(),
        kind: ChunkKind::File,
        name: Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string()),
        start_line: 1,
        end_line: end,
        text: truncate_chars(text, max_chars),
        embedding: None,
    }
}

fn slice_lines(lines: &[&str], start: usize, end: usize) -> String {
    let from = start.saturating_sub(1).min(lines.len());
    let to = end.min(lines.len());
    lines[from..to].join("\n")
}

/// Collect `(name, start_line, end_line)` for every function node, in
/// pre-order. Errors carry a human-readable reason.
fn function_spans(text: &str, language: SourceLanguage) -> Result<Vec<(String, usize, usize)>, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&language.grammar())
        .map_err(|e| format!("grammar load failed: {}", e))?;

    let tree = parser
        .parse(text, None)
        .ok_or_else(|| "parser returned no tree".to_string())?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(format!(
            "syntax error near line {}",
            first_error_line(root).unwrap_or(1)
        ));
    }

    let src = text.as_bytes();
    let mut spans = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();
        // Anonymous nodes include keyword tokens such as `function`.
        if node.is_named() && FUNCTION_KINDS.contains(&node.kind()) {
            let start = node.start_position().row + 1;
            let end = node.end_position().row + 1;
            // Ids are derived from the line span; the outermost function wins.
            if seen.insert((start, end)) {
                spans.push((function_name(node, src), start, end));
            }
        }

        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return Ok(spans);
            }
        }
    }
}

fn first_error_line(node: Node) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row + 1);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error_line)
}

/// Own identifier, else the enclosing binding/key, else `anonymous_<kind>`.
fn function_name(node: Node, src: &[u8]) -> String {
    if let Some(name) = node
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(src).ok())
    {
        return name.to_string();
    }

    if let Some(parent) = node.parent() {
        let binding = match parent.kind() {
            "variable_declarator" => parent.child_by_field_name("name"),
            "pair" => parent.child_by_field_name("key"),
            "assignment_expression" => parent.child_by_field_name("left"),
            "field_definition" | "public_field_definition" => parent
                .child_by_field_name("property")
                .or_else(|| parent.child_by_field_name("name")),
            _ => None,
        };
        if let Some(name) = binding.and_then(|n| n.utf8_text(src).ok()) {
            return name.trim_matches(|c| c == '"' || c == '\'').to_string();
        }
    }

    format!("anonymous_{}", node.kind())
}
