//! # code-mender CLI (`mend`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mend init` | Write a starter `mend.toml` |
//! | `mend index build` | Rebuild the embedding index snapshot |
//! | `mend index status` | Show snapshot metadata |
//! | `mend search "<query>"` | Rank indexed code against a query |
//! | `mend apply <edits.json>` | Apply an edit list to files |
//! | `mend repair <file>` | Run the repair loop on a Lua module |
//!
//! ## Examples
//!
//! ```bash
//! mend init
//! mend index build --config ./mend.toml
//! mend search "parse config file" --limit 5
//! mend repair src/report.lua --entry main --rounds 3 --json
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use code_mender::commands::{self, RepairArgs};
use code_mender::config::{self, Config};

/// code-mender: validate a Lua module and let a fix service repair it.
///
/// All commands accept `--config`. Without a config file, defaults rooted
/// at the current directory are used.
#[derive(Parser)]
#[command(name = "mend", version, about = "Automatic repair loop for Lua modules, backed by a semantic code index")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./mend.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented starter config to the `--config` path.
    Init,

    /// Build or inspect the embedding index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search the index.
    ///
    /// Builds the snapshot first if it is missing or was built for another
    /// root or model.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results (defaults to `search.top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Apply an edit list from a JSON file.
    ///
    /// The file holds `{"edits": [...]}` or a bare array. Exits non-zero if
    /// any edit was rejected.
    Apply {
        /// Path to the edits file.
        edits: PathBuf,
    },

    /// Repair a Lua module until its entry point runs cleanly.
    Repair {
        /// The module to validate and repair.
        file: PathBuf,

        /// Entry point name (defaults to `repair.entry`).
        #[arg(long)]
        entry: Option<String>,

        /// Maximum rounds (defaults to `repair.max_rounds`).
        #[arg(long)]
        rounds: Option<u32>,

        /// Extra context passed to the fix service.
        #[arg(long)]
        context: Option<String>,

        /// Paths the fix service should prefer to edit. Repeatable.
        #[arg(long = "prefer")]
        prefer: Vec<String>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Scan, chunk and embed the project, then write the snapshot.
    Build,
    /// Show the snapshot's metadata, or that none exists.
    Status,
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::minimal(Path::new(".")))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("code_mender=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Init = cli.command {
        commands::run_init(&cli.config)?;
        return Ok(());
    }

    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::Index { action } => match action {
            IndexAction::Build => commands::run_index_build(&cfg).await?,
            IndexAction::Status => commands::run_index_status(&cfg)?,
        },
        Commands::Search { query, limit } => {
            commands::run_search(&cfg, &query, limit).await?;
        }
        Commands::Apply { edits } => {
            if !commands::run_apply(&cfg, &edits)? {
                std::process::exit(1);
            }
        }
        Commands::Repair {
            file,
            entry,
            rounds,
            context,
            prefer,
            json,
        } => {
            let args = RepairArgs {
                file,
                entry,
                rounds,
                context,
                prefer,
                json,
            };
            let result = commands::run_repair(&cfg, args).await?;
            if !result.ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
