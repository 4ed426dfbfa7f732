//! The artifact under repair: a Lua 5.4 module run in a sandboxed VM.
//!
//! Validating an artifact is three steps, each of which can fail:
//!
//! 1. **Reload**: read the file and evaluate it in a brand-new VM. The
//!    chunk's return value is the export table; a returned function is the
//!    default export; a chunk that returns nothing exports its global
//!    `exports` table.
//! 2. **Resolve** an entry point: the configured name, then `default`,
//!    then the first function by ascending key.
//! 3. **Execute** it with no arguments under an instruction-count deadline.
//!
//! All VM work happens on a blocking thread. Each reload is tagged with a
//! [`ReloadToken`] supplied by the caller so repeated loads of the same
//! path are never confused with each other in logs or error messages.

use async_trait::async_trait;
use mlua::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::lua_runtime::{lua_value_to_json, register_host_apis};

/// Distinct tag for one load of an artifact. Issued by the repair session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct ReloadToken(u64);

impl ReloadToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ReloadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which validation step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The file could not be read or evaluated.
    Load,
    /// Loaded, but nothing callable is exported.
    MissingEntryPoint,
    /// The entry point raised an error or hit the deadline.
    Runtime,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Load => "load",
            FailureKind::MissingEntryPoint => "missing_entry_point",
            FailureKind::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one reload-resolve-execute pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Passed { entry: String, out: Value },
    Failed(Failure),
}

/// Something the repair loop can validate and edit.
#[async_trait]
pub trait Artifact: Send + Sync {
    /// File the fix service is shown and edits are expected to target.
    fn path(&self) -> &Path;

    /// Load fresh from disk, resolve `entry` and run it.
    async fn validate(&self, entry: &str, token: ReloadToken) -> Validation;
}

/// Result of entry-point resolution.
pub enum EntryPoint {
    Found { name: String, function: LuaFunction },
    NotFound,
}

/// Table key of a fallback candidate. Names sort before array indices;
/// indices sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum CallableKey {
    Name(String),
    Index(i64),
}

impl std::fmt::Display for CallableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallableKey::Name(name) => f.write_str(name),
            CallableKey::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Pick the function to run from a module's exports.
pub fn resolve_entry_point(exports: &LuaValue, preferred: &str) -> EntryPoint {
    match exports {
        LuaValue::Function(f) => EntryPoint::Found {
            name: "default".to_string(),
            function: f.clone(),
        },
        LuaValue::Table(t) => {
            for key in [preferred, "default"] {
                if let Ok(LuaValue::Function(f)) = t.get::<LuaValue>(key) {
                    return EntryPoint::Found {
                        name: key.to_string(),
                        function: f,
                    };
                }
            }

            let mut callables: Vec<(CallableKey, LuaFunction)> = t
                .pairs::<LuaValue, LuaValue>()
                .filter_map(|pair| pair.ok())
                .filter_map(|(k, v)| {
                    let LuaValue::Function(f) = v else {
                        return None;
                    };
                    let key = match k {
                        LuaValue::String(s) => CallableKey::Name(s.to_str().ok()?.to_string()),
                        LuaValue::Integer(i) => CallableKey::Index(i),
                        _ => return None,
                    };
                    Some((key, f))
                })
                .collect();
            callables.sort_by(|a, b| a.0.cmp(&b.0));

            match callables.into_iter().next() {
                Some((key, function)) => EntryPoint::Found {
                    name: key.to_string(),
                    function,
                },
                None => EntryPoint::NotFound,
            }
        }
        _ => EntryPoint::NotFound,
    }
}

/// A freshly evaluated module and the VM that owns it.
struct LoadedModule {
    // Keeps the VM alive for the lifetime of `exports`.
    _lua: Lua,
    exports: LuaValue,
}

/// A Lua module file on disk.
pub struct LuaArtifact {
    path: PathBuf,
    exec_timeout_secs: u64,
}

impl LuaArtifact {
    pub fn new(path: impl Into<PathBuf>, exec_timeout_secs: u64) -> Self {
        Self {
            path: path.into(),
            exec_timeout_secs,
        }
    }
}

#[async_trait]
impl Artifact for LuaArtifact {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn validate(&self, entry: &str, token: ReloadToken) -> Validation {
        let path = self.path.clone();
        let entry = entry.to_string();
        let timeout_secs = self.exec_timeout_secs;

        match tokio::task::spawn_blocking(move || {
            validate_blocking(&path, &entry, token, timeout_secs)
        })
        .await
        {
            Ok(validation) => validation,
            Err(e) => Validation::Failed(Failure::new(
                FailureKind::Runtime,
                format!("validation task failed: {}", e),
            )),
        }
    }
}

fn validate_blocking(path: &Path, entry: &str, token: ReloadToken, timeout_secs: u64) -> Validation {
    let module = match reload(path, token, timeout_secs) {
        Ok(m) => m,
        Err(message) => return Validation::Failed(Failure::new(FailureKind::Load, message)),
    };

    let (name, function) = match resolve_entry_point(&module.exports, entry) {
        EntryPoint::Found { name, function } => (name, function),
        EntryPoint::NotFound => {
            return Validation::Failed(Failure::new(
                FailureKind::MissingEntryPoint,
                format!(
                    "{} exports no '{}' function, no default export and no other function",
                    path.display(),
                    entry
                ),
            ))
        }
    };
    tracing::debug!(path = %path.display(), %token, entry = %name, "resolved entry point");

    match execute(&function) {
        Ok(out) => Validation::Passed { entry: name, out },
        Err(message) => Validation::Failed(Failure::new(FailureKind::Runtime, message)),
    }
}

/// Evaluate the file in a new VM and return its exports.
fn reload(path: &Path, token: ReloadToken, timeout_secs: u64) -> Result<LoadedModule, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    let lua = Lua::new();

    // Set up timeout via instruction hook; covers both load and execute.
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "artifact timed out after {} seconds",
                    timeout_secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    let sandbox_root = path.parent().unwrap_or_else(|| Path::new("."));
    let script_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    register_host_apis(&lua, &script_name, sandbox_root)
        .map_err(|e| format!("failed to set up Lua runtime: {}", e))?;

    let returned: LuaValue = lua
        .load(&source)
        .set_name(format!("@{}#{}", path.display(), token))
        .eval()
        .map_err(|e| e.to_string())?;

    let exports = match returned {
        LuaValue::Nil => lua
            .globals()
            .get::<LuaValue>("exports")
            .map_err(|e| e.to_string())?,
        other => other,
    };

    tracing::debug!(path = %path.display(), %token, "reloaded artifact");
    Ok(LoadedModule { _lua: lua, exports })
}

/// Call `function` with no arguments and convert its return value.
fn execute(function: &LuaFunction) -> Result<Value, String> {
    let result: LuaValue = function.call(()).map_err(|e| e.to_string())?;
    match lua_value_to_json(result) {
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::warn!(error = %e, "entry point result is not representable as JSON");
            Ok(Value::Null)
        }
    }
}
