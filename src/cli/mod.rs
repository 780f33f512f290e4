//! # CLI Module
//!
//! Command-line interface for running and inspecting the log pipeline.
//!
//! ## Commands
//!
//! ### Pipeline Operations
//! - `start`: Ship every line read from stdin as a log record until EOF or Ctrl+C
//! - `emit`: Ship a single record and exit once it is persisted
//! - `provision`: Create the log schema and table, then exit
//!
//! ### Inspection
//! - `recent`: Print the newest persisted records
//!
//! ### Configuration
//! - `validate-env`: Check the `LOGVAULT_*` environment variables
//! - `env-example`: Print an example `.env` file
//!
//! ## Usage Example
//!
//! ```bash
//! export LOGVAULT_DB_URL=sqlite://logvault.db
//!
//! # Create the log table
//! logvault provision
//!
//! # Ship an application's output
//! ./my-service 2>&1 | logvault start --category my-service
//!
//! # Look at what arrived
//! logvault recent --limit 50
//! ```

use crate::connection::{EnvConnectionSource, resolve};
use crate::database::{ProvisionReport, SinkTarget, SqlSink, StoredLog};
use crate::env::{self, AppConfig, DB_URL_VAR};
use crate::error::PipelineError;
use crate::logging::init_tracing;
use crate::pipeline::{LogPipeline, PipelineHandle};
use crate::provision::SchemaProvisioner;
use crate::record::{LogLevel, LogRecord};
use crate::shutdown::ShutdownCoordinator;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Extra time allowed for the final flush beyond one attempt timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

///////////////////////////////////////////////////////////////////////////////
//****                        Private Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Parser)]
#[command(name = "logvault")]
#[command(about = "Asynchronous batched log shipping to a SQL sink")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

///////////////////////////////////////////////////////////////////////////////
//****                         Private Types                             ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Subcommand)]
enum Commands {
    /// Ship stdin lines to the sink until EOF or Ctrl+C
    #[command(name = "start")]
    Start {
        #[arg(long, default_value = "stdin", help = "Category stored with every line")]
        category: String,
    },
    /// Create the log schema and table if they are missing
    #[command(name = "provision")]
    Provision,
    /// Show the newest persisted records
    #[command(name = "recent")]
    Recent {
        #[arg(long, default_value_t = 20, help = "Number of records to show")]
        limit: u32,
        #[arg(long, help = "Print records as JSON lines")]
        json: bool,
    },
    /// Ship a single record
    #[command(name = "emit")]
    Emit {
        #[arg(long, default_value = "information", value_parser = parse_level)]
        level: LogLevel,
        #[arg(long, default_value = "cli")]
        category: String,
        #[arg(long)]
        message: String,
        #[arg(long, help = "Exception or error details")]
        exception: Option<String>,
    },
    /// Validate environment configuration
    #[command(name = "validate-env")]
    ValidateEnv,
    /// Print an example environment file
    #[command(name = "env-example")]
    EnvExample,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse the command line and run the selected command
pub async fn parse_cli_commands() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { category } => {
            let config = env::get_config();
            start(&config, category).await?;
        }
        Commands::Provision => {
            let config = env::get_config();
            init_tracing(&config.log_level, None);
            config.log_notes();
            let report = provision(&config).await?;
            println!(
                "Log table {} ready (schema created: {}, table created: {})",
                report.target, report.schema_created, report.table_created
            );
        }
        Commands::Recent { limit, json } => {
            let config = env::get_config();
            init_tracing(&config.log_level, None);
            config.log_notes();
            let logs = recent(&config, limit).await?;
            print_logs(&logs, json)?;
        }
        Commands::Emit {
            level,
            category,
            message,
            exception,
        } => {
            let config = env::get_config();
            let mut record = LogRecord::new(level, category, message);
            if let Some(exception) = exception {
                record = record.with_exception(exception);
            }
            emit(&config, record).await?;
            println!("Record persisted");
        }
        Commands::ValidateEnv => {
            init_tracing(env::DEFAULT_LOG_FILTER, None);
            let result = env::validate_environment();
            env::print_validation_results(&result);
            if result.is_err() {
                std::process::exit(1);
            }
        }
        Commands::EnvExample => {
            print!("{}", env::generate_env_example());
        }
    }

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

fn parse_level(value: &str) -> Result<LogLevel, String> {
    value.parse()
}

fn connection_source() -> EnvConnectionSource {
    EnvConnectionSource::new(DB_URL_VAR)
}

fn shutdown_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.attempt_timeout_seconds) + SHUTDOWN_GRACE
}

/// Start the pipeline with process events shipped alongside explicit records
async fn start_pipeline(
    config: &AppConfig,
    coordinator: ShutdownCoordinator,
) -> Result<PipelineHandle, PipelineError> {
    let pipeline = LogPipeline::with_coordinator(config.sink_options(), coordinator);
    init_tracing(&config.log_level, Some(pipeline.emitter()));
    config.log_notes();
    pipeline.start(connection_source()).await
}

async fn start(config: &AppConfig, category: String) -> Result<(), PipelineError> {
    let coordinator = ShutdownCoordinator::new();
    let handle = start_pipeline(config, coordinator.clone()).await?;

    let signals = coordinator.clone();
    tokio::spawn(async move { signals.wait_for_shutdown_signal().await });

    info!(category = %category, "Shipping stdin to the log sink");
    let emitter = handle.emitter();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listener = coordinator.listener();
    let mut shipped: u64 = 0;

    loop {
        tokio::select! {
            _ = listener.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    emitter.log(LogLevel::Information, category.as_str(), line);
                    shipped += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    info!(shipped, "Input finished, flushing remaining records");
    let stats = handle.shutdown(shutdown_timeout(config)).await;
    info!(
        batches = stats.batches_committed,
        records = stats.records_committed,
        failed_attempts = stats.failed_attempts,
        "Log shipping stopped"
    );
    Ok(())
}

async fn emit(config: &AppConfig, record: LogRecord) -> Result<(), Box<dyn std::error::Error>> {
    let handle = start_pipeline(config, ShutdownCoordinator::new()).await?;
    handle.emitter().emit(record);

    let stats = handle.shutdown(shutdown_timeout(config)).await;
    if stats.records_committed == 0 {
        return Err(format!(
            "record was not persisted ({} failed attempts)",
            stats.failed_attempts
        )
        .into());
    }
    Ok(())
}

async fn provision(config: &AppConfig) -> Result<ProvisionReport, PipelineError> {
    let sink = SqlSink::new(config.sink_options().target()?);
    let source = connection_source();
    SchemaProvisioner::new(&source, &sink).provision().await
}

async fn recent(config: &AppConfig, limit: u32) -> Result<Vec<StoredLog>, PipelineError> {
    let target = SinkTarget::new(&config.schema_name, &config.table_name)?;
    let source = connection_source();
    let Some(connection_string) = resolve(&source).await else {
        return Err(PipelineError::ConnectionUnresolved);
    };
    SqlSink::new(target).recent_logs(&connection_string, limit).await
}

fn print_logs(logs: &[StoredLog], json: bool) -> Result<(), serde_json::Error> {
    if json {
        for log in logs {
            println!("{}", serde_json::to_string(log)?);
        }
        return Ok(());
    }

    if logs.is_empty() {
        println!("No log records found");
        return Ok(());
    }

    println!(
        "{:<25} | {:<11} | {:<24} | {:<50}",
        "Timestamp", "Level", "Category", "Message"
    );
    println!("{:-<120}", "");
    for log in logs {
        println!(
            "{:<25} | {:<11} | {:<24} | {:<50}",
            log.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            log.level,
            truncate(log.category.as_deref().unwrap_or(""), 24),
            log.message.as_deref().unwrap_or("")
        );
        if let Some(exception) = &log.exception {
            println!("{:<25}   Exception: {}", "", exception);
        }
    }
    Ok(())
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let mut shortened: String = value.chars().take(width.saturating_sub(3)).collect();
        shortened.push_str("...");
        shortened
    }
}
