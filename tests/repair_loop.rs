//! Repair sessions over real Lua modules with scripted fix services.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::sync::Mutex;
use tempfile::TempDir;

use code_mender::artifact::{FailureKind, LuaArtifact};
use code_mender::config::Config;
use code_mender::edits::EditApplier;
use code_mender::embedding::EmbeddingProvider;
use code_mender::fixer::{FixProposal, FixProposer, FixRequest};
use code_mender::index::EmbeddingIndex;
use code_mender::repair::{RepairOptions, RepairSession, StopReason};
use code_mender::search::{ExactScan, Retriever};

/// Returns the next scripted reply on each call and keeps every request.
struct Scripted {
    replies: Mutex<Vec<Vec<Value>>>,
    seen: Mutex<Vec<FixRequest>>,
}

impl Scripted {
    fn new(mut replies: Vec<Vec<Value>>) -> Self {
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FixProposer for Scripted {
    async fn propose(&self, request: &FixRequest) -> Result<FixProposal> {
        self.seen.lock().unwrap().push(request.clone());
        let edits = self.replies.lock().unwrap().pop().unwrap_or_default();
        Ok(FixProposal {
            edits,
            notes: Vec::new(),
        })
    }
}

/// Two-dimensional embeddings: does the text mention "total"?
struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                if t.contains("total") {
                    vec![1.0, 0.0]
                } else {
                    vec![0.0, 1.0]
                }
            })
            .collect())
    }
}

fn module(tmp: &TempDir, body: &str) -> LuaArtifact {
    let path = tmp.path().join("report.lua");
    fs::write(&path, body).unwrap();
    LuaArtifact::new(path, 5)
}

fn applier(tmp: &TempDir) -> EditApplier {
    EditApplier::new(tmp.path(), tmp.path().join(".backups"))
}

const FIXED: &str = "return { main = function() return 'fixed' end }";

#[tokio::test]
async fn test_syntax_error_fixed_with_replace_file() {
    let tmp = TempDir::new().unwrap();
    let artifact = module(&tmp, "return { main = function() return 'x' }");
    let applier = applier(&tmp);
    let proposer = Scripted::new(vec![vec![json!({
        "path": "report.lua",
        "strategy": "replace_file",
        "new_content": FIXED
    })]]);

    let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
        .run()
        .await;

    assert!(result.ok);
    assert_eq!(result.rounds, 2);
    assert_eq!(result.out, Some(json!("fixed")));
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.history[0].error.kind, FailureKind::Load);

    let seen = proposer.seen.lock().unwrap();
    assert_eq!(seen[0].file_path, "report.lua");
    assert_eq!(seen[0].file_content, "return { main = function() return 'x' }");
}

#[tokio::test]
async fn test_runtime_error_fixed_with_replace_range() {
    let tmp = TempDir::new().unwrap();
    let artifact = module(
        &tmp,
        "local M = {}\n\nfunction M.main()\n  return undefined_fn()\nend\n\nreturn M",
    );
    let applier = applier(&tmp);
    let proposer = Scripted::new(vec![vec![json!({
        "path": "report.lua",
        "strategy": "replace_range",
        "startLine": 4,
        "endLine": 4,
        "new_text": "  return 42"
    })]]);
    let options = RepairOptions {
        extra_context: Some("main must return 42".to_string()),
        ..RepairOptions::default()
    };

    let result = RepairSession::new(&artifact, &proposer, &applier, options)
        .run()
        .await;

    assert!(result.ok, "history: {:?}", result.history);
    assert_eq!(result.out, Some(json!(42)));
    assert_eq!(result.history[0].error.kind, FailureKind::Runtime);
    assert!(result.history[0].error.message.contains("undefined_fn"));

    let seen = proposer.seen.lock().unwrap();
    assert!(seen[0].query.contains("undefined_fn"));
    assert_eq!(seen[0].extra_context.as_deref(), Some("main must return 42"));
}

#[tokio::test]
async fn test_missing_entry_point_is_repaired() {
    let tmp = TempDir::new().unwrap();
    let artifact = module(&tmp, "return { version = 1 }");
    let applier = applier(&tmp);
    let proposer = Scripted::new(vec![vec![json!({
        "path": "report.lua",
        "strategy": "replace_file",
        "new_content": "return { version = 1, run = function() return 'ran' end }"
    })]]);

    let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
        .run()
        .await;

    assert!(result.ok);
    assert_eq!(result.history[0].error.kind, FailureKind::MissingEntryPoint);
    // No `main` and no `default`: the only function is used.
    assert_eq!(result.entry.as_deref(), Some("run"));
    assert_eq!(result.out, Some(json!("ran")));
}

#[tokio::test]
async fn test_no_edits_stops_after_first_round() {
    let tmp = TempDir::new().unwrap();
    let artifact = module(&tmp, "return { main = function() error('bad input') end }");
    let applier = applier(&tmp);
    let proposer = Scripted::new(vec![]);

    let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
        .run()
        .await;

    assert!(!result.ok);
    assert_eq!(result.rounds, 1);
    assert_eq!(result.stop_reason, StopReason::NoProgress);
    assert!(result.error.unwrap().contains("bad input"));
    assert_eq!(proposer.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unhelpful_edits_exhaust_rounds() {
    let tmp = TempDir::new().unwrap();
    let artifact = module(&tmp, "return { main = function() error('first') end }");
    let applier = applier(&tmp);
    let bad = |n: u32| {
        vec![json!({
            "path": "report.lua",
            "strategy": "replace_file",
            "new_content": format!("return {{ main = function() error('attempt {}') end }}", n)
        })]
    };
    let proposer = Scripted::new(vec![bad(1), bad(2), bad(3)]);
    let options = RepairOptions {
        max_rounds: 3,
        ..RepairOptions::default()
    };

    let result = RepairSession::new(&artifact, &proposer, &applier, options)
        .run()
        .await;

    assert!(!result.ok);
    assert_eq!(result.rounds, 3);
    assert_eq!(result.stop_reason, StopReason::Exhausted);
    // The last error comes from the final reload, which saw attempt 2.
    assert!(result.error.unwrap().contains("attempt 2"));
    assert_eq!(result.history.len(), 3);
}

#[tokio::test]
async fn test_requests_carry_retrieved_excerpts() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("helpers.js"),
        "function total(xs) {\n  return xs.reduce((a, b) => a + b, 0);\n}\n\nfunction greet(name) {\n  return 'hi ' + name;\n}\n",
    )
    .unwrap();
    let artifact = module(
        &tmp,
        "return { main = function() error('total is not defined') end }",
    );
    let applier = applier(&tmp);
    let proposer = Scripted::new(vec![]);

    let config = Config::minimal(tmp.path());
    let retriever = Retriever::new(
        EmbeddingIndex::new(&config),
        Box::new(KeywordEmbedder),
        Box::new(ExactScan),
    );
    let options = RepairOptions {
        top_k: 2,
        preferred_paths: vec!["report.lua".to_string()],
        ..RepairOptions::default()
    };

    let result = RepairSession::new(&artifact, &proposer, &applier, options)
        .with_retriever(&retriever)
        .run()
        .await;
    assert!(!result.ok);
    assert!(result.history[0].warnings.is_empty());

    let seen = proposer.seen.lock().unwrap();
    let excerpts = &seen[0].excerpts;
    assert_eq!(excerpts.len(), 2);
    // The preferred file is moved to the front of the excerpts.
    assert_eq!(excerpts[0].file_path, "report.lua");
    assert!(excerpts.iter().any(|c| c.name == "total"));
    assert!(config.snapshot_path().exists());
}
