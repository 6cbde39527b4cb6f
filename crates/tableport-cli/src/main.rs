//! tableport CLI - create, append to and inspect tables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tableport_core::config::LogFormat;
use tableport_core::{CommitError, Config, LoaderError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Catalog or table loader error
    LoaderError = 2,
    /// Commit conflict after all retries
    CommitConflict = 3,
    /// Commit outcome unknown, the table must be checked before retrying
    CommitIndeterminate = 4,
    /// Storage error (S3, filesystem)
    StorageError = 5,
    /// Invalid records or data files
    WriteError = 6,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Convert an error to an exit code.
    fn from_error(error: &anyhow::Error) -> Self {
        use tableport_core::Error;

        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) | Some(Error::Serialization(_)) => ExitCode::ConfigError,
            Some(Error::Loader(LoaderError::NotOpen(_))) => ExitCode::RuntimeError,
            Some(Error::Loader(_)) => ExitCode::LoaderError,
            Some(Error::Commit(CommitError::Conflict { .. })) => ExitCode::CommitConflict,
            Some(Error::Commit(CommitError::Indeterminate { .. })) => {
                ExitCode::CommitIndeterminate
            }
            Some(Error::Commit(_)) | Some(Error::Write(_)) => ExitCode::WriteError,
            Some(Error::Storage(_)) | Some(Error::Io(_)) => ExitCode::StorageError,
            Some(Error::Metadata(_)) => ExitCode::RuntimeError,
            None => {
                let error_str = error.to_string().to_lowercase();
                if error_str.contains("config") || error_str.contains("toml") {
                    ExitCode::ConfigError
                } else {
                    ExitCode::RuntimeError
                }
            }
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "tableport")]
#[command(about = "Create, append to and inspect open format tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configured table
    Create {
        /// JSON file with the table schema
        #[arg(long)]
        schema: PathBuf,

        /// JSON file with partition fields, e.g. [{"column": "ts", "transform": "day"}]
        #[arg(long)]
        partition_spec: Option<PathBuf>,
    },

    /// Append JSON-lines records as one snapshot
    Append {
        /// JSON-lines file, one object per record
        #[arg(long)]
        records: PathBuf,

        /// Override the configured branch
        #[arg(long)]
        branch: Option<String>,

        /// Skip the append if this key was already committed to the branch
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// List the snapshots of a branch or tag
    Snapshots {
        /// Branch or tag
        #[arg(long = "ref", default_value = "main")]
        ref_name: String,
    },

    /// List the live data files of a branch or tag
    Files {
        /// Branch or tag
        #[arg(long = "ref", default_value = "main")]
        ref_name: String,
    },

    /// Print the serialized table loader for remote workers
    EncodeLoader,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log settings come from the config when it parses, JSON otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.as_ref().map_or("info", |m| m.log_level.as_str())),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Create {
            schema,
            partition_spec,
        } => {
            commands::create::run(&config, &schema, partition_spec.as_deref()).await?;
        }

        Commands::Append {
            records,
            branch,
            idempotency_key,
        } => {
            commands::append::run(&config, &records, branch, idempotency_key).await?;
        }

        Commands::Snapshots { ref_name } => {
            commands::inspect::snapshots(&config, &ref_name).await?;
        }

        Commands::Files { ref_name } => {
            commands::inspect::files(&config, &ref_name).await?;
        }

        Commands::EncodeLoader => {
            let loader = config.table_loader()?;
            println!("{}", String::from_utf8(loader.to_bytes()?)?);
        }

        Commands::Validate => {
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("tableport.toml"));
    Ok(Config::from_file(&path)?)
}
