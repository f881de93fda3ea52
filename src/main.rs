mod io;
mod logging;
mod lsp;

use clap::{Parser, Subcommand};
use logging::{LogConfig, init_logging};
use lsp::{CursorPosition, ServerConfig, ServerRegistry};

use std::path::{Path, PathBuf};
use tracing::info;

/// CLI arguments for the language server bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root passed to language servers (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Path to a JSON file with server configurations (defaults to built-ins)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides LSP_BRIDGE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: OneShot,
}

/// One-shot queries against the language server for a scope
#[derive(Subcommand, Debug)]
enum OneShot {
    /// Completion items at a cursor position
    Completions(QueryArgs),
    /// Hover contents at a cursor position
    Hover(QueryArgs),
    /// Definition location(s) for the symbol at a cursor position
    Definition(QueryArgs),
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
    /// Editor scope name, e.g. source.js.jsx
    #[arg(long, value_name = "SCOPE")]
    scope: String,

    /// Absolute path of the file being queried
    #[arg(long, value_name = "FILE")]
    file: PathBuf,

    /// Zero-based cursor row
    #[arg(long)]
    row: u32,

    /// Zero-based cursor column
    #[arg(long)]
    column: u32,
}

/// Load server configurations from a JSON file, or fall back to built-ins
fn load_configs(path: Option<&Path>) -> Result<Vec<ServerConfig>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let configs: Vec<ServerConfig> = serde_json::from_str(&contents)?;
            info!(
                "Loaded {} server configurations from {}",
                configs.len(),
                path.display()
            );
            Ok(configs)
        }
        None => Ok(lsp::default_configs()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let workspace_root = match args.root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    let configs = load_configs(args.config.as_deref())?;
    let registry = ServerRegistry::with_configs(configs, Some(workspace_root));

    let query = match &args.command {
        OneShot::Completions(q) | OneShot::Hover(q) | OneShot::Definition(q) => q,
    };

    let Some(client) = registry.resolve(&query.scope).await? else {
        eprintln!("No enabled language server configured for scope {}", query.scope);
        std::process::exit(2);
    };

    let position = CursorPosition {
        row: query.row,
        column: query.column,
    };

    let output = match &args.command {
        OneShot::Completions(q) => {
            serde_json::to_string_pretty(&client.completions(&q.file, position).await)?
        }
        OneShot::Hover(q) => serde_json::to_string_pretty(&client.hover(&q.file, position).await)?,
        OneShot::Definition(q) => {
            serde_json::to_string_pretty(&client.definition(&q.file, position).await)?
        }
    };
    println!("{output}");

    registry.stop_all().await;
    Ok(())
}
