//! Sandboxed Lua 5.4 VM setup for artifacts under repair.
//!
//! Every reload gets a fresh VM configured by [`register_host_apis`]. Host
//! functions are synchronous; the VM itself runs on a blocking thread (see
//! [`crate::artifact`]).
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `fs` | `read` (sandboxed to the artifact's directory) |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed from globals.

use mlua::prelude::*;
use std::path::Path;

/// Nesting limit when converting Lua tables to JSON (guards cyclic tables).
const MAX_JSON_DEPTH: usize = 64;

/// Sandbox the globals and register every host module.
///
/// `script_name` prefixes log lines; `sandbox_root` confines `fs.read`.
pub(crate) fn register_host_apis(
    lua: &Lua,
    script_name: &str,
    sandbox_root: &Path,
) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_env_api(lua)?;
    register_log_api(lua, script_name)?;
    register_fs_api(lua, sandbox_root)?;
    Ok(())
}

/// Remove dangerous standard library functions from the Lua globals.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| LuaError::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| LuaError::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = script_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

fn register_fs_api(lua: &Lua, sandbox_root: &Path) -> LuaResult<()> {
    let fs = lua.create_table()?;
    let root = sandbox_root
        .canonicalize()
        .unwrap_or_else(|_| sandbox_root.to_path_buf());

    // fs.read(path) → string
    fs.set(
        "read",
        lua.create_function(move |_lua, path: String| {
            let target = root.join(&path);
            let canonical = target
                .canonicalize()
                .map_err(|e| LuaError::external(anyhow::anyhow!("fs.read: {}: {}", path, e)))?;
            if !canonical.starts_with(&root) {
                return Err(LuaError::external(anyhow::anyhow!(
                    "fs.read: path escapes sandbox: {}",
                    path
                )));
            }
            std::fs::read_to_string(&canonical)
                .map_err(|e| LuaError::external(anyhow::anyhow!("fs.read: {}: {}", path, e)))
        })?,
    )?;

    lua.globals().set("fs", fs)?;
    Ok(())
}

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
///
/// Functions, userdata and threads become `null`. A table with a non-empty
/// array part is encoded as an array, anything else as an object with
/// stringified keys.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    to_json_at_depth(value, 0)
}

fn to_json_at_depth(value: LuaValue, depth: usize) -> LuaResult<serde_json::Value> {
    if depth > MAX_JSON_DEPTH {
        return Err(LuaError::external(anyhow::anyhow!(
            "value nested deeper than {} levels",
            MAX_JSON_DEPTH
        )));
    }
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(to_json_at_depth(v, depth + 1)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key = match k {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        LuaValue::Boolean(b) => b.to_string(),
                        _ => continue,
                    };
                    map.insert(key, to_json_at_depth(v, depth + 1)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
