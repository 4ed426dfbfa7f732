//! Command handlers behind the `mend` binary.
//!
//! Each handler prints its own human-readable output with `println!`;
//! diagnostics go through `tracing`.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::artifact::LuaArtifact;
use crate::config::{scaffold_config, Config};
use crate::edits::EditApplier;
use crate::embedding::create_provider;
use crate::fixer::create_proposer;
use crate::index::EmbeddingIndex;
use crate::repair::{RepairOptions, RepairResult, RepairSession, StopReason};
use crate::search::Retriever;

/// `mend init`
pub fn run_init(path: &Path) -> Result<()> {
    scaffold_config(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// `mend index build`
pub async fn run_index_build(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Building the index requires embeddings. Set [embedding] provider in config.");
    }
    let provider = create_provider(&config.embedding)?;
    let index = EmbeddingIndex::new(config);
    let (snapshot, report) = index.build(provider.as_ref()).await?;

    println!("index build");
    println!("  files scanned: {}", report.files_scanned);
    println!("  files skipped: {}", report.files_skipped);
    println!("  chunks: {}", report.chunks);
    println!("  model: {}", snapshot.model);
    println!("  snapshot: {}", index.snapshot_path().display());
    for w in &report.warnings {
        println!(
            "  warning: {} {}",
            w.path.as_deref().unwrap_or("-"),
            w.message
        );
    }
    Ok(())
}

/// `mend index status`
pub fn run_index_status(config: &Config) -> Result<()> {
    let index = EmbeddingIndex::new(config);
    let Some(snapshot) = index.load() else {
        println!("index: not built ({})", index.snapshot_path().display());
        return Ok(());
    };

    let created = chrono::DateTime::from_timestamp_millis(snapshot.created_at)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| snapshot.created_at.to_string());
    let files: std::collections::BTreeSet<&str> =
        snapshot.index.iter().map(|c| c.file_path.as_str()).collect();

    println!("index: {}", index.snapshot_path().display());
    println!("  created: {}", created);
    println!("  root: {}", snapshot.root);
    println!("  model: {}", snapshot.model);
    println!("  dims: {}", snapshot.dims().unwrap_or(0));
    println!("  files: {}", files.len());
    println!("  chunks: {}", snapshot.index.len());
    if config.embedding.is_enabled() {
        let model = config.embedding.model.as_deref().unwrap_or_default();
        if index.is_stale(&snapshot, model) {
            println!("  stale: yes (will rebuild on next search)");
        }
    }
    Ok(())
}

/// `mend search "<query>"`
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let provider = create_provider(&config.embedding)?;
    let retriever = Retriever::from_config(config, provider);
    let hits = retriever
        .search(query, limit.unwrap_or(config.search.top_k))
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let c = &hit.chunk;
        println!(
            "{}. [{:.3}] {}:{}-{} ({})",
            i + 1,
            hit.score,
            c.file_path,
            c.start_line,
            c.end_line,
            c.name
        );
    }
    Ok(())
}

/// `mend apply <edits.json>`. Accepts `{"edits": [...]}` or a bare array.
///
/// Returns `true` when every edit applied.
pub fn run_apply(config: &Config, edits_path: &Path) -> Result<bool> {
    let raw = std::fs::read_to_string(edits_path)
        .with_context(|| format!("Failed to read {}", edits_path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", edits_path.display()))?;
    let edits = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("edits") {
            Some(serde_json::Value::Array(items)) => items,
            _ => bail!("{} has no \"edits\" array", edits_path.display()),
        },
        _ => bail!("{} must hold an edit list", edits_path.display()),
    };

    let applier = EditApplier::from_config(config);
    let report = applier.apply(&edits);

    for outcome in &report.outcomes {
        if outcome.ok {
            println!(
                "ok    {} ({})",
                outcome.path,
                outcome.strategy.as_deref().unwrap_or("-")
            );
        } else {
            println!(
                "fail  {}: {}",
                outcome.path,
                outcome.reason.as_deref().unwrap_or("-")
            );
        }
    }
    for w in &report.warnings {
        eprintln!("Warning: {}", w.message);
    }
    println!("{}/{} edits applied", report.applied(), report.outcomes.len());

    Ok(report.applied() == report.outcomes.len())
}

/// Flags of `mend repair`.
#[derive(Debug, Clone, Default)]
pub struct RepairArgs {
    pub file: PathBuf,
    pub entry: Option<String>,
    pub rounds: Option<u32>,
    pub context: Option<String>,
    pub prefer: Vec<String>,
    pub json: bool,
}

/// `mend repair <file>`. Returns the session result.
pub async fn run_repair(config: &Config, args: RepairArgs) -> Result<RepairResult> {
    let file = args
        .file
        .canonicalize()
        .with_context(|| format!("Cannot open {}", args.file.display()))?;
    let root = config
        .project
        .root
        .canonicalize()
        .unwrap_or_else(|_| config.project.root.clone());

    let mut options = RepairOptions::from_config(config);
    if let Some(entry) = args.entry {
        options.entry = entry;
    }
    if let Some(rounds) = args.rounds {
        options.max_rounds = rounds;
    }
    options.extra_context = args.context;
    options.preferred_paths = args.prefer;

    let artifact = LuaArtifact::new(file, config.repair.exec_timeout_secs);
    let proposer = create_proposer(&config.fixer)?;
    let applier = EditApplier::new(root, config.backup_dir());

    let retriever = if config.embedding.is_enabled() {
        match create_provider(&config.embedding) {
            Ok(provider) => Some(Retriever::from_config(config, provider)),
            Err(e) => {
                eprintln!("Warning: could not create embedding provider: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut session = RepairSession::new(&artifact, proposer.as_ref(), &applier, options);
    if let Some(r) = retriever.as_ref() {
        session = session.with_retriever(r);
    }
    let result = session.run().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_repair_result(&result);
    }
    Ok(result)
}

fn print_repair_result(result: &RepairResult) {
    for record in &result.history {
        println!(
            "round {}: {} error: {}",
            record.round, record.error.kind, record.error.message
        );
        println!(
            "  edits: {} proposed, {} applied",
            record.fix.edits_proposed,
            record.fix.applied()
        );
        for w in &record.warnings {
            println!("  warning: {}", w.message);
        }
    }

    match result.stop_reason {
        StopReason::Succeeded => {
            println!(
                "ok after {} round(s), entry '{}'",
                result.rounds,
                result.entry.as_deref().unwrap_or("-")
            );
            if let Some(out) = &result.out {
                println!("out: {}", out);
            }
        }
        StopReason::Exhausted | StopReason::NoProgress => {
            let why = if result.stop_reason == StopReason::Exhausted {
                "round budget exhausted"
            } else {
                "no edits applied"
            };
            println!("failed after {} round(s): {}", result.rounds, why);
            if let Some(err) = &result.error {
                println!("last error: {}", err);
            }
            if result.rolled_back {
                println!("original content restored");
            }
        }
    }
    println!("session: {}", result.session_id);
}
