//! The bounded repair loop.
//!
//! A [`RepairSession`] alternates between validating the artifact and
//! asking the fix service for edits:
//!
//! ```text
//! round n:  reload ─▶ resolve entry ─▶ execute ──ok──▶ Succeeded
//!              │            │              │
//!              └────────────┴── failure ───┘
//!                           │
//!                  read file, retrieve context,
//!                  propose edits, apply, record
//!                           │
//!            0 edits applied ──▶ NoProgress
//!            n == max_rounds ──▶ Exhausted
//!            otherwise       ──▶ round n + 1
//! ```
//!
//! Nothing escapes [`RepairSession::run`]: every failure of the artifact,
//! the retriever, the fix service or the file system ends up in the
//! returned [`RepairResult`].

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::Instrument;

use crate::artifact::{Artifact, Failure, ReloadToken, Validation};
use crate::config::Config;
use crate::edits::EditApplier;
use crate::fixer::{FixProposer, FixRequest};
use crate::models::{Chunk, EditOutcome, Warning, WarningKind};
use crate::search::Retriever;

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub max_rounds: u32,
    /// Preferred entry-point name.
    pub entry: String,
    /// Excerpts to retrieve per round; 0 disables retrieval.
    pub top_k: usize,
    pub extra_context: Option<String>,
    pub preferred_paths: Vec<String>,
    /// Restore the original file content when the session fails.
    pub rollback_on_failure: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            entry: "main".to_string(),
            top_k: 8,
            extra_context: None,
            preferred_paths: Vec::new(),
            rollback_on_failure: false,
        }
    }
}

impl RepairOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_rounds: config.repair.max_rounds,
            entry: config.repair.entry.clone(),
            top_k: config.search.top_k,
            extra_context: None,
            preferred_paths: Vec::new(),
            rollback_on_failure: config.repair.rollback_on_failure,
        }
    }
}

/// What the fix step did in one round.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundFix {
    pub edits_proposed: usize,
    pub outcomes: Vec<EditOutcome>,
}

impl RoundFix {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }
}

/// One failed round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round: u32,
    pub error: Failure,
    pub fix: RoundFix,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    /// Ran out of rounds.
    Exhausted,
    /// A round applied no edits.
    NoProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub ok: bool,
    /// Rounds attempted, including the successful one.
    pub rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<Value>,
    /// Last captured failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: Vec<RoundRecord>,
    pub stop_reason: StopReason,
    pub session_id: String,
    pub rolled_back: bool,
    /// Session-level warnings (snapshotting or restoring the target).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

enum RoundStep {
    Passed { entry: String, out: Value },
    Failed(RoundRecord),
}

/// One repair attempt over one artifact.
pub struct RepairSession<'a> {
    artifact: &'a dyn Artifact,
    proposer: &'a dyn FixProposer,
    applier: &'a EditApplier,
    retriever: Option<&'a Retriever>,
    options: RepairOptions,
    token: ReloadToken,
    session_id: String,
}

impl<'a> RepairSession<'a> {
    pub fn new(
        artifact: &'a dyn Artifact,
        proposer: &'a dyn FixProposer,
        applier: &'a EditApplier,
        options: RepairOptions,
    ) -> Self {
        Self {
            artifact,
            proposer,
            applier,
            retriever: None,
            options,
            token: ReloadToken::default(),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Attach a retriever so fix requests carry related code.
    pub fn with_retriever(mut self, retriever: &'a Retriever) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run(mut self) -> RepairResult {
        let span = tracing::info_span!(
            "repair",
            session = %self.session_id,
            path = %self.artifact.path().display()
        );
        async move {
            let mut result = RepairResult {
                ok: false,
                rounds: 0,
                entry: None,
                out: None,
                error: None,
                history: Vec::new(),
                stop_reason: StopReason::Exhausted,
                session_id: self.session_id.clone(),
                rolled_back: false,
                warnings: Vec::new(),
            };

            if self.options.max_rounds == 0 {
                result.error = Some("no rounds attempted".to_string());
                return result;
            }

            let original = if self.options.rollback_on_failure {
                match std::fs::read_to_string(self.artifact.path()) {
                    Ok(content) => Some(content),
                    Err(e) => {
                        result.warnings.push(Warning::new(
                            WarningKind::Target,
                            Some(&self.display_path()),
                            format!("cannot snapshot for rollback: {}", e),
                        ));
                        None
                    }
                }
            } else {
                None
            };

            for round in 1..=self.options.max_rounds {
                result.rounds = round;
                let step = self
                    .round(round)
                    .instrument(tracing::info_span!("round", round))
                    .await;

                match step {
                    RoundStep::Passed { entry, out } => {
                        tracing::info!(round, entry = %entry, "artifact passed");
                        result.ok = true;
                        result.entry = Some(entry);
                        result.out = Some(out);
                        result.error = None;
                        result.stop_reason = StopReason::Succeeded;
                        return result;
                    }
                    RoundStep::Failed(record) => {
                        let applied = record.fix.applied();
                        result.error = Some(record.error.message.clone());
                        result.history.push(record);
                        if applied == 0 {
                            tracing::warn!(round, "no edits applied, stopping");
                            result.stop_reason = StopReason::NoProgress;
                            break;
                        }
                    }
                }
            }

            if result.stop_reason == StopReason::Exhausted {
                tracing::warn!(rounds = result.rounds, "round budget exhausted");
            }

            if let Some(content) = original {
                match std::fs::write(self.artifact.path(), content) {
                    Ok(()) => {
                        tracing::info!("restored original content");
                        result.rolled_back = true;
                    }
                    Err(e) => result.warnings.push(Warning::new(
                        WarningKind::Target,
                        Some(&self.display_path()),
                        format!("rollback failed: {}", e),
                    )),
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn round(&mut self, round: u32) -> RoundStep {
        self.token = self.token.next();

        let failure = match self.artifact.validate(&self.options.entry, self.token).await {
            Validation::Passed { entry, out } => return RoundStep::Passed { entry, out },
            Validation::Failed(failure) => failure,
        };
        tracing::info!(kind = %failure.kind, message = %failure.message, "validation failed");

        let mut warnings = Vec::new();
        let file_path = self.display_path();

        let file_content = match std::fs::read_to_string(self.artifact.path()) {
            Ok(content) => content,
            Err(e) => {
                warnings.push(Warning::new(
                    WarningKind::Target,
                    Some(&file_path),
                    format!("cannot read target: {}", e),
                ));
                String::new()
            }
        };

        let excerpts = self.retrieve(&failure.message, &mut warnings).await;

        let request = FixRequest {
            query: failure.message.clone(),
            file_path,
            file_content,
            extra_context: self.options.extra_context.clone(),
            preferred_paths: self.options.preferred_paths.clone(),
            excerpts,
        };

        let edits = match self.proposer.propose(&request).await {
            Ok(proposal) => {
                for note in proposal.notes {
                    warnings.push(Warning::new(WarningKind::Proposal, None, note));
                }
                proposal.edits
            }
            Err(e) => {
                tracing::warn!(error = %e, "fix proposal failed");
                warnings.push(Warning::new(
                    WarningKind::Proposal,
                    None,
                    format!("{:#}", e),
                ));
                Vec::new()
            }
        };

        let report = self.applier.apply(&edits);
        warnings.extend(report.warnings);
        tracing::info!(
            proposed = edits.len(),
            applied = report.outcomes.iter().filter(|o| o.ok).count(),
            "fix step done"
        );

        RoundStep::Failed(RoundRecord {
            round,
            error: failure,
            fix: RoundFix {
                edits_proposed: edits.len(),
                outcomes: report.outcomes,
            },
            warnings,
        })
    }

    /// Related chunks for `query`, preferred paths first.
    async fn retrieve(&self, query: &str, warnings: &mut Vec<Warning>) -> Vec<Chunk> {
        let Some(retriever) = self.retriever else {
            return Vec::new();
        };
        if self.options.top_k == 0 {
            return Vec::new();
        }

        match retriever.search(query, self.options.top_k).await {
            Ok(hits) => {
                let (mut preferred, rest): (Vec<Chunk>, Vec<Chunk>) = hits
                    .into_iter()
                    .map(|h| h.chunk)
                    .partition(|c| self.options.preferred_paths.iter().any(|p| p == &c.file_path));
                preferred.extend(rest);
                preferred
            }
            Err(e) => {
                tracing::warn!(error = %e, "context retrieval failed");
                warnings.push(Warning::new(
                    WarningKind::Retrieval,
                    None,
                    format!("{:#}", e),
                ));
                Vec::new()
            }
        }
    }

    /// The artifact path as edits should address it: relative to the
    /// applier root when it lies inside it.
    fn display_path(&self) -> String {
        let path = self.artifact.path();
        relative_to(path, self.applier.root())
            .unwrap_or_else(|| path.display().to_string())
    }
}

fn relative_to(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FailureKind;
    use crate::fixer::FixProposal;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Passes once `content` of the file equals `good`.
    struct FileMatch {
        path: PathBuf,
        good: String,
        tokens: Mutex<Vec<ReloadToken>>,
    }

    #[async_trait]
    impl Artifact for FileMatch {
        fn path(&self) -> &Path {
            &self.path
        }

        async fn validate(&self, entry: &str, token: ReloadToken) -> Validation {
            self.tokens.lock().unwrap().push(token);
            let content = std::fs::read_to_string(&self.path).unwrap_or_default();
            if content == self.good {
                Validation::Passed {
                    entry: entry.to_string(),
                    out: json!("fixed"),
                }
            } else {
                Validation::Failed(Failure::new(FailureKind::Runtime, "still broken"))
            }
        }
    }

    /// Replies with a fixed list of edits on every call.
    struct Canned(Vec<Value>);

    #[async_trait]
    impl FixProposer for Canned {
        async fn propose(&self, _request: &FixRequest) -> Result<FixProposal> {
            Ok(FixProposal {
                edits: self.0.clone(),
                notes: Vec::new(),
            })
        }
    }

    struct Down;

    #[async_trait]
    impl FixProposer for Down {
        async fn propose(&self, _request: &FixRequest) -> Result<FixProposal> {
            anyhow::bail!("connection refused")
        }
    }

    fn setup(initial: &str, good: &str) -> (TempDir, FileMatch, EditApplier) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mod.lua");
        std::fs::write(&path, initial).unwrap();
        let artifact = FileMatch {
            path,
            good: good.to_string(),
            tokens: Mutex::new(Vec::new()),
        };
        let applier = EditApplier::new(tmp.path(), tmp.path().join(".backups"));
        (tmp, artifact, applier)
    }

    #[tokio::test]
    async fn test_success_without_edits() {
        let (_tmp, artifact, applier) = setup("good", "good");
        let proposer = Canned(Vec::new());
        let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
            .run()
            .await;
        assert!(result.ok);
        assert_eq!(result.rounds, 1);
        assert_eq!(result.out, Some(json!("fixed")));
        assert!(result.history.is_empty());
        assert_eq!(result.stop_reason, StopReason::Succeeded);
    }

    #[tokio::test]
    async fn test_fixed_in_second_round() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(vec![
            json!({"path": "mod.lua", "strategy": "replace_file", "new_content": "good"}),
        ]);
        let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
            .run()
            .await;

        assert!(result.ok);
        assert_eq!(result.rounds, 2);
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.history[0].fix.applied(), 1);
        let tokens = artifact.tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
    }

    #[tokio::test]
    async fn test_zero_edits_stops_early() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(Vec::new());
        let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
            .run()
            .await;

        assert!(!result.ok);
        assert_eq!(result.rounds, 1);
        assert_eq!(result.stop_reason, StopReason::NoProgress);
        assert_eq!(result.error.as_deref(), Some("still broken"));
    }

    #[tokio::test]
    async fn test_invalid_edits_count_as_no_progress() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(vec![json!({"path": "mod.lua", "strategy": "rewrite"})]);
        let result = RepairSession::new(&artifact, &proposer, &applier, RepairOptions::default())
            .run()
            .await;
        assert_eq!(result.stop_reason, StopReason::NoProgress);
        assert_eq!(result.history[0].fix.edits_proposed, 1);
        assert_eq!(result.history[0].fix.applied(), 0);
    }

    #[tokio::test]
    async fn test_exhausts_round_budget() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(vec![
            json!({"path": "mod.lua", "strategy": "replace_file", "new_content": "still bad"}),
        ]);
        let options = RepairOptions {
            max_rounds: 3,
            ..RepairOptions::default()
        };
        let result = RepairSession::new(&artifact, &proposer, &applier, options)
            .run()
            .await;

        assert!(!result.ok);
        assert_eq!(result.rounds, 3);
        assert_eq!(result.history.len(), 3);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
        let rounds: Vec<u32> = result.history.iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_rounds() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(Vec::new());
        let options = RepairOptions {
            max_rounds: 0,
            ..RepairOptions::default()
        };
        let result = RepairSession::new(&artifact, &proposer, &applier, options)
            .run()
            .await;
        assert!(!result.ok);
        assert_eq!(result.rounds, 0);
        assert_eq!(result.error.as_deref(), Some("no rounds attempted"));
        assert!(artifact.tokens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proposer_error_becomes_warning() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let result = RepairSession::new(&artifact, &Down, &applier, RepairOptions::default())
            .run()
            .await;

        assert!(!result.ok);
        assert_eq!(result.stop_reason, StopReason::NoProgress);
        let warning = &result.history[0].warnings[0];
        assert_eq!(warning.kind, WarningKind::Proposal);
        assert!(warning.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_rollback_restores_original() {
        let (_tmp, artifact, applier) = setup("bad", "good");
        let proposer = Canned(vec![
            json!({"path": "mod.lua", "strategy": "replace_file", "new_content": "worse"}),
        ]);
        let options = RepairOptions {
            max_rounds: 2,
            rollback_on_failure: true,
            ..RepairOptions::default()
        };
        let result = RepairSession::new(&artifact, &proposer, &applier, options)
            .run()
            .await;

        assert!(!result.ok);
        assert!(result.rolled_back);
        assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), "bad");
    }

    #[test]
    fn test_result_serialises_snake_case() {
        let result = RepairResult {
            ok: false,
            rounds: 0,
            entry: None,
            out: None,
            error: Some("no rounds attempted".to_string()),
            history: Vec::new(),
            stop_reason: StopReason::NoProgress,
            session_id: "s".to_string(),
            rolled_back: false,
            warnings: Vec::new(),
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["stop_reason"], json!("no_progress"));
        assert!(v.get("out").is_none());
    }
}
