//! # code-mender
//!
//! Automatic repair of a Lua module: validate it, and while it fails, ask a
//! fix service for edits, apply them and try again, for a bounded number of
//! rounds. Fix requests are enriched with related code found through a
//! semantic index of the project.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │  chunk   │──▶│   index   │──▶│   search     │
//! │  (parse) │   │embed+save │   │ exact / flat │
//! └──────────┘   └───────────┘   └──────┬───────┘
//!                                       │ excerpts
//!   ┌──────────┐   failure   ┌──────────▼───────┐   edits   ┌─────────┐
//!   │ artifact │────────────▶│      repair      │──────────▶│  edits  │
//!   │  (Lua)   │◀────────────│  bounded rounds  │◀──────────│ applier │
//!   └──────────┘   reload    └────────┬─────────┘           └─────────┘
//!                                     │ request
//!                                ┌────▼────┐
//!                                │  fixer  │
//!                                └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Function-level chunk extraction |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Snapshot build, load and save |
//! | [`search`] | Exact and accelerated similarity search |
//! | [`lua_runtime`] | Sandboxed Lua VM setup |
//! | [`artifact`] | Reload, entry-point resolution and execution |
//! | [`edits`] | Edit application with backups |
//! | [`fixer`] | Fix-proposal service client |
//! | [`repair`] | The repair loop |
//! | [`commands`] | CLI command handlers |

pub mod artifact;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod edits;
pub mod embedding;
pub mod fixer;
pub mod index;
pub mod lua_runtime;
pub mod models;
pub mod repair;
pub mod search;
