//! Fix proposals from a chat-completion service.
//!
//! The repair loop describes a failure in a [`FixRequest`] and gets back a
//! [`FixProposal`]: a list of raw edit objects. Edits stay as JSON values
//! here; [`crate::edits::EditApplier`] validates them one by one so a single
//! malformed edit cannot discard the rest.
//!
//! The service is asked for a JSON object of the form:
//!
//! ```json
//! {"edits": [
//!   {"path": "mod.lua", "strategy": "replace_file", "new_content": "..."},
//!   {"path": "mod.lua", "strategy": "replace_range", "startLine": 3, "endLine": 4, "new_text": "..."}
//! ]}
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::FixerConfig;
use crate::embedding::send_with_retry;
use crate::models::Chunk;

/// Everything the fix service is told about one failed round.
#[derive(Debug, Clone, Default)]
pub struct FixRequest {
    /// The captured failure message.
    pub query: String,
    /// Path of the artifact, as the edits should address it.
    pub file_path: String,
    /// Current content of the artifact.
    pub file_content: String,
    pub extra_context: Option<String>,
    pub preferred_paths: Vec<String>,
    /// Related code retrieved from the index, best first.
    pub excerpts: Vec<Chunk>,
}

#[derive(Debug, Clone, Default)]
pub struct FixProposal {
    pub edits: Vec<Value>,
    /// Problems with the response that did not amount to an error.
    pub notes: Vec<String>,
}

#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose(&self, request: &FixRequest) -> Result<FixProposal>;
}

const SYSTEM_PROMPT: &str = "You repair a single Lua 5.4 module that failed to load or run. \
Reply with ONLY a JSON object {\"edits\": [...]}. Each edit is either \
{\"path\": string, \"strategy\": \"replace_file\", \"new_content\": string} or \
{\"path\": string, \"strategy\": \"replace_range\", \"startLine\": integer, \"endLine\": integer, \"new_text\": string}. \
Line numbers are 1-based and inclusive. Keep the module's exported functions. \
Reply {\"edits\": []} if you cannot propose a fix.";

/// Render retrieved chunks as labelled blocks.
pub fn format_excerpts(excerpts: &[Chunk]) -> String {
    excerpts
        .iter()
        .map(|c| {
            format!(
                "--- {}:{}-{} ({}) ---\n{}",
                c.file_path, c.start_line, c.end_line, c.name, c.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn number_lines(content: &str) -> String {
    content
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The user message for one request.
pub fn build_prompt(request: &FixRequest) -> String {
    let mut prompt = format!(
        "File: {}\n\nError:\n{}\n\nCurrent content (line numbers are not part of the file):\n{}\n",
        request.file_path,
        request.query,
        number_lines(&request.file_content)
    );

    if !request.preferred_paths.is_empty() {
        prompt.push_str(&format!(
            "\nPrefer changes to: {}\n",
            request.preferred_paths.join(", ")
        ));
    }
    if let Some(extra) = request.extra_context.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nAdditional context:\n{}\n", extra));
    }
    if !request.excerpts.is_empty() {
        prompt.push_str(&format!(
            "\nRelated code:\n{}\n",
            format_excerpts(&request.excerpts)
        ));
    }
    prompt
}

/// Pull the edit list out of a model reply.
///
/// Tolerates Markdown fences and prose around the JSON object. Returns
/// `None` when no `{"edits": [...]}` object can be found.
pub fn parse_fix_response(text: &str) -> Option<Vec<Value>> {
    let trimmed = strip_code_fence(text.trim());

    let parsed = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end < start {
            return None;
        }
        serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
    })?;

    parsed.get("edits")?.as_array().cloned()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// ─── Wire types ──────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Fix proposer backed by an OpenAI-compatible or Ollama chat endpoint.
///
/// The OpenAI key is read from `OPENAI_API_KEY` when a request is made, so
/// a session whose artifact already passes never needs one.
pub struct ChatProposer {
    provider: String,
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl ChatProposer {
    pub fn new(config: &FixerConfig) -> Result<Self> {
        let url = match (config.url.clone(), config.provider.as_str()) {
            (Some(url), _) => url,
            (None, "openai") => "https://api.openai.com".to_string(),
            (None, "ollama") => "http://localhost:11434".to_string(),
            (None, other) => bail!("Unknown fixer provider: {}", other),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider: config.provider.clone(),
            model: config.model.clone(),
            url,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }

    fn messages(&self, request: &FixRequest) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: build_prompt(request),
            },
        ]
    }

    async fn call_openai(&self, request: &FixRequest) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.messages(request),
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        });
        let req = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body);

        let json = send_with_retry(req, self.max_retries, "OpenAI").await?;
        let response: OpenAiChatResponse = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Invalid OpenAI chat response: {}", e))?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI chat response: no choices"))
    }

    async fn call_ollama(&self, request: &FixRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.messages(request),
            "stream": false,
            "format": "json",
            "options": {"temperature": self.temperature},
        });
        let req = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body);

        let json = send_with_retry(req, self.max_retries, "Ollama").await?;
        let response: OllamaChatResponse = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Invalid Ollama chat response: {}", e))?;
        Ok(response.message.content)
    }
}

#[async_trait]
impl FixProposer for ChatProposer {
    async fn propose(&self, request: &FixRequest) -> Result<FixProposal> {
        let reply = match self.provider.as_str() {
            "ollama" => self.call_ollama(request).await?,
            _ => self.call_openai(request).await?,
        };

        match parse_fix_response(&reply) {
            Some(edits) => {
                tracing::debug!(edits = edits.len(), "fix proposal received");
                Ok(FixProposal {
                    edits,
                    notes: Vec::new(),
                })
            }
            None => {
                tracing::warn!("fix service reply contained no edit list");
                Ok(FixProposal {
                    edits: Vec::new(),
                    notes: vec!["fix service reply contained no {\"edits\": [...]} object".to_string()],
                })
            }
        }
    }
}

/// Build the configured proposer.
pub fn create_proposer(config: &FixerConfig) -> Result<Box<dyn FixProposer>> {
    match config.provider.as_str() {
        "openai" | "ollama" => Ok(Box::new(ChatProposer::new(config)?)),
        other => bail!("Unknown fixer provider: {}", other),
    }
}
