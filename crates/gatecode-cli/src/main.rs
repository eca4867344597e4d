//! Gatecode CLI
//!
//! Command-line interface for gatecode - single-use access codes kept in
//! sync across devices.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use gatecode_core::{Config, SyncEngine};

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Environment variable holding the log filter
const LOG_ENV: &str = "GATECODE_LOG";

#[derive(Parser)]
#[command(name = "gatecode")]
#[command(about = "Gatecode - single-use access codes synced across devices")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (overrides GATECODE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random codes
    #[command(alias = "gen")]
    Generate {
        /// How many codes to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Add a custom code
    #[command(alias = "add")]
    Create {
        /// The code to add
        code: String,
    },
    /// Redeem a code
    #[command(alias = "redeem")]
    Verify {
        /// The code to redeem
        code: String,
    },
    /// List codes
    #[command(alias = "ls")]
    List {
        /// Only unused codes
        #[arg(long, conflicts_with = "used")]
        unused: bool,
        /// Only used codes
        #[arg(long)]
        used: bool,
    },
    /// Delete a code by id
    #[command(alias = "rm")]
    Delete {
        /// Local record id (see `gatecode list`)
        id: u64,
    },
    /// Delete all codes
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Export unused codes as a shareable string
    Export,
    /// Import codes from an export string (`-` reads stdin)
    Import {
        /// Export string
        blob: String,
    },
    /// Show device, sync and code status
    Status,
    /// Stay connected and print changes as they happen
    Watch,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

impl Commands {
    /// Whether the command changes the code set
    fn is_write(&self) -> bool {
        matches!(
            self,
            Commands::Generate { .. }
                | Commands::Create { .. }
                | Commands::Verify { .. }
                | Commands::Delete { .. }
                | Commands::Clear { .. }
                | Commands::Import { .. }
        )
    }
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands don't need the engine
    if let Commands::Config { command } = &cli.command {
        match command {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output)?,
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key.clone(), value.clone(), config_path, &output)?
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let engine = SyncEngine::open(config)?;
    let state = engine.start().await;
    debug!("Engine started in state {}", state);

    let is_write = cli.command.is_write();
    let result = run(&engine, cli.command, &output).await;

    // Give the remote the change before we exit
    if is_write {
        if let Err(e) = engine.flush().await {
            warn!("Changes saved locally but not pushed: {}", e);
            if !output.is_quiet() {
                eprintln!("⚠ Changes saved locally; they will sync next time: {}", e);
            }
        }
    }

    engine.stop().await;

    match result {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) => Err(e),
    }
}

/// Dispatch a command; `Ok(false)` means a clean run that should still exit non-zero
async fn run(engine: &SyncEngine, command: Commands, output: &Output) -> Result<bool> {
    match command {
        Commands::Generate { count } => commands::code::generate(engine, count, output).await?,
        Commands::Create { code } => commands::code::create(engine, code, output).await?,
        Commands::Verify { code } => return commands::code::verify(engine, code, output).await,
        Commands::List { unused, used } => {
            commands::code::list(engine, unused, used, output).await?
        }
        Commands::Delete { id } => commands::code::delete(engine, id, output).await?,
        Commands::Clear { yes } => commands::code::clear(engine, yes, output).await?,
        Commands::Export => commands::code::export(engine, output).await?,
        Commands::Import { blob } => commands::code::import(engine, blob, output).await?,
        Commands::Status => commands::status::show(engine, output).await?,
        Commands::Watch => commands::watch::run(engine, output).await?,
        Commands::Config { .. } => unreachable!(), // Handled in main
    }
    Ok(true)
}

/// Initialize logging
///
/// Filter comes from GATECODE_LOG (default: info for our crates). Logs go
/// to `config.log_file` when set, stderr otherwise.
fn init_logging(config: &Config) {
    let env_filter = std::env::var(LOG_ENV)
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("gatecode_core=warn,gatecode_cli=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore error if already initialized
    match config.log_file {
        Some(ref log_path) => match File::create(log_path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(file).try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
