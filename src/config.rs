//! TOML configuration for `mend`.
//!
//! Every section is optional; a missing section takes its defaults. The
//! loaded [`Config`] is validated before it is returned, so downstream
//! code can trust numeric ranges and provider names.
//!
//! ```toml
//! [project]
//! root = "."
//!
//! [index]
//! max_chunk_chars = 4000
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [fixer]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [repair]
//! max_rounds = 5
//! entry = "main"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub fixer: FixerConfig,
    #[serde(default)]
    pub repair: RepairConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Snapshot location. Relative paths resolve against the project root.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            extensions: default_extensions(),
            exclude_dirs: default_exclude_dirs(),
            exclude_globs: Vec::new(),
            max_chunk_chars: default_max_chunk_chars(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["js", "mjs", "cjs", "jsx", "ts", "tsx", "py", "rs", "lua"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_exclude_dirs() -> Vec<String> {
    [".git", "node_modules", "target", "dist", "build", ".mend"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_chunk_chars() -> usize {
    4000
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// `"exact"` or `"accelerated"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            top_k: default_top_k(),
        }
    }
}

fn default_backend() -> String {
    "exact".to_string()
}
fn default_top_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixerConfig {
    /// `"openai"` or `"ollama"`.
    #[serde(default = "default_fixer_provider")]
    pub provider: String,
    #[serde(default = "default_fixer_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_fixer_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fixer_timeout")]
    pub timeout_secs: u64,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            provider: default_fixer_provider(),
            model: default_fixer_model(),
            url: None,
            temperature: 0.0,
            max_retries: default_fixer_retries(),
            timeout_secs: default_fixer_timeout(),
        }
    }
}

fn default_fixer_provider() -> String {
    "openai".to_string()
}
fn default_fixer_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_fixer_retries() -> u32 {
    3
}
fn default_fixer_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepairConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    #[serde(default)]
    pub rollback_on_failure: bool,
    /// Where pre-edit copies go. Defaults to `<tmp>/code-mender-backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            entry: default_entry(),
            exec_timeout_secs: default_exec_timeout(),
            rollback_on_failure: false,
            backup_dir: None,
        }
    }
}

fn default_max_rounds() -> u32 {
    5
}
fn default_entry() -> String {
    "main".to_string()
}
fn default_exec_timeout() -> u64 {
    30
}

impl Config {
    /// Defaults rooted at `root`, for commands run without a config file.
    pub fn minimal(root: &Path) -> Self {
        Self {
            project: ProjectConfig {
                root: root.to_path_buf(),
            },
            ..Self::default()
        }
    }

    /// Absolute (or as-given) snapshot location.
    pub fn snapshot_path(&self) -> PathBuf {
        match &self.index.snapshot_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.project.root.join(p),
            None => self.project.root.join(".mend").join("index.json"),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.repair
            .backup_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("code-mender-backups"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // A relative project root is relative to the config file, not the cwd.
    if config.project.root.is_relative() {
        if let Some(dir) = path.parent() {
            config.project.root = dir.join(&config.project.root);
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.max_chunk_chars == 0 {
        bail!("index.max_chunk_chars must be > 0");
    }
    if config.index.extensions.is_empty() {
        bail!("index.extensions must not be empty");
    }

    if config.search.top_k == 0 {
        bail!("search.top_k must be >= 1");
    }
    match config.search.backend.as_str() {
        "exact" | "accelerated" => {}
        other => bail!(
            "Unknown search backend: '{}'. Must be exact or accelerated.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.fixer.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown fixer provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    if config.repair.entry.trim().is_empty() {
        bail!("repair.entry must not be empty");
    }

    Ok(())
}

/// Write a commented starter config to `path`.
pub fn scaffold_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Config already exists: {}", path.display());
    }

    let template = r#"# code-mender configuration

[project]
root = "."

[index]
# snapshot_path = ".mend/index.json"
# extensions = ["js", "mjs", "cjs", "jsx", "ts", "tsx", "py", "rs", "lua"]
# exclude_dirs = [".git", "node_modules", "target", "dist", "build", ".mend"]
# exclude_globs = ["**/*.min.js"]
max_chunk_chars = 4000

[embedding]
# disabled | openai | ollama | local
provider = "disabled"
# model = "text-embedding-3-small"
# dims = 1536

[search]
# exact | accelerated
backend = "exact"
top_k = 8

[fixer]
# openai | ollama
provider = "openai"
model = "gpt-4o-mini"

[repair]
max_rounds = 5
entry = "main"
exec_timeout_secs = 30
rollback_on_failure = false
"#;

    std::fs::write(path, template)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("mend.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.repair.max_rounds, 5);
        assert_eq!(cfg.repair.entry, "main");
        assert_eq!(cfg.search.backend, "exact");
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.project.root, tmp.path().join("."));
    }

    #[test]
    fn test_snapshot_path_defaults_under_root() {
        let cfg = Config::minimal(Path::new("/work/app"));
        assert_eq!(
            cfg.snapshot_path(),
            PathBuf::from("/work/app/.mend/index.json")
        );
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "[embedding]\nprovider = \"openai\"\n");
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"), "got: {}", err);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "[search]\nbackend = \"hnsw\"\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "[search]\ntop_k = 0\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_scaffold_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mend.toml");
        scaffold_config(&path).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.index.max_chunk_chars, 4000);
        assert!(scaffold_config(&path).is_err());
    }
}
