// fundline-cli/src/lib.rs
// ============================================================================
// Module: Fundline CLI Library
// Description: Batch-worker commands behind the fundline binary.
// Purpose: Process sources, serve the admin surface, and sweep orphaned runs.
// Dependencies: fundline-{agents, config, core, server, store-sqlite}, clap
// ============================================================================

//! ## Overview
//! The worker exposes four entry points: process one source (or the next
//! due one), serve the admin surface, sweep orphaned runs, and validate the
//! host configuration. Exit codes are part of the contract: 0 success, 1
//! validation error, 2 partial failure, 3 unrecoverable error.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use fundline_agents::ConfiguredSourceAnalyzer;
use fundline_agents::HeuristicAnalysisAgent;
use fundline_agents::HttpFetchAgent;
use fundline_agents::HttpFetchConfig;
use fundline_agents::DatastoreStorageAgent;
use fundline_agents::ScoreThresholdFilter;
use fundline_config::FundlineConfig;
use fundline_core::Datastore;
use fundline_core::ErrorCategory;
use fundline_core::PipelineCoordinator;
use fundline_core::PipelineParts;
use fundline_core::ProcessOptions;
use fundline_core::ProcessOutcome;
use fundline_core::SourceId;
use fundline_core::SystemClock;
use fundline_core::runtime::ThreadWaiter;
use fundline_core::runtime::cleanup_orphaned_runs;
use fundline_core::time::Clock;
use fundline_server::AdminServerConfig;
use fundline_server::AppState;
use fundline_server::NoopMetrics;
use fundline_server::StderrAuditSink;
use fundline_store_sqlite::SqliteDatastore;
use fundline_store_sqlite::SqliteStoreConfig;

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

/// Exit code for success.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for validation errors.
pub const EXIT_VALIDATION: u8 = 1;
/// Exit code for partial failures.
pub const EXIT_PARTIAL: u8 = 2;
/// Exit code for unrecoverable errors.
pub const EXIT_UNRECOVERABLE: u8 = 3;

// ============================================================================
// SECTION: Command Line
// ============================================================================

/// Fundline batch worker and admin server.
#[derive(Debug, Parser)]
#[command(name = "fundline", version, about = "Funding-opportunity ingestion pipeline")]
pub struct Cli {
    /// Optional config path overriding FUNDLINE_CONFIG.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Worker subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process one source, or the next due one.
    Process {
        /// Source identifier (UUID) to process.
        #[arg(long, conflicts_with = "next_due")]
        source: Option<String>,
        /// Process the next-due active source instead.
        #[arg(long)]
        next_due: bool,
    },
    /// Serve the admin HTTP surface.
    Serve,
    /// Mark runs stuck past the timeout as failed.
    CleanupOrphans,
    /// Configuration tooling.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the host configuration and print the effective values.
    Validate,
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Runs the CLI and maps results to the exit-code contract.
#[must_use]
pub fn run(cli: Cli) -> ExitCode {
    ExitCode::from(run_code(cli))
}

/// Runs the CLI, returning the raw exit code for tests.
#[must_use]
pub fn run_code(cli: Cli) -> u8 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(message) => {
            emit(&message);
            return EXIT_VALIDATION;
        }
    };
    match cli.command {
        Command::Process {
            source,
            next_due,
        } => run_process(&config, source.as_deref(), next_due),
        Command::Serve => run_serve(&config),
        Command::CleanupOrphans => run_cleanup(&config),
        Command::Config {
            command: ConfigCommand::Validate,
        } => run_config_validate(&config),
    }
}

/// Loads the host configuration honoring the `--config` override.
fn load_config(cli: &Cli) -> Result<FundlineConfig, String> {
    let result = cli.config.as_ref().map_or_else(FundlineConfig::load, |path| {
        FundlineConfig::load_from(path)
    });
    result.map_err(|err| format!("{{\"status\":\"error\",\"error\":\"{err}\"}}"))
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Processes one source or the next due source.
fn run_process(config: &FundlineConfig, source: Option<&str>, next_due: bool) -> u8 {
    let Ok(datastore) = open_datastore(config) else {
        emit("{\"status\":\"error\",\"error\":\"datastore unavailable\"}");
        return EXIT_UNRECOVERABLE;
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let source_id = if next_due {
        match datastore.next_due_source(clock.now()) {
            Ok(Some(found)) => found.source_id,
            Ok(None) => {
                emit("{\"status\":\"idle\"}");
                return EXIT_SUCCESS;
            }
            Err(err) => {
                emit(&format!("{{\"status\":\"error\",\"error\":\"{err}\"}}"));
                return EXIT_UNRECOVERABLE;
            }
        }
    } else {
        let Some(raw) = source else {
            emit("{\"status\":\"error\",\"error\":\"--source or --next-due is required\"}");
            return EXIT_VALIDATION;
        };
        match SourceId::parse(raw) {
            Ok(source_id) => source_id,
            Err(err) => {
                emit(&format!("{{\"status\":\"error\",\"error\":\"{err}\"}}"));
                return EXIT_VALIDATION;
            }
        }
    };

    let Ok(coordinator) = build_coordinator(config, Arc::clone(&datastore), Arc::clone(&clock))
    else {
        emit("{\"status\":\"error\",\"error\":\"coordinator construction failed\"}");
        return EXIT_UNRECOVERABLE;
    };
    let outcome = coordinator.process_source(&source_id, &ProcessOptions::default());
    let rendered = serde_json::to_string(&outcome)
        .unwrap_or_else(|_| "{\"status\":\"error\"}".to_string());
    emit(&rendered);
    match outcome {
        ProcessOutcome::Completed(_) => EXIT_SUCCESS,
        ProcessOutcome::Failed(failure) => failure_exit(&datastore, &failure),
    }
}

/// Serves the admin surface until interrupted.
fn run_serve(config: &FundlineConfig) -> u8 {
    let Ok(datastore) = open_datastore(config) else {
        emit("{\"status\":\"error\",\"error\":\"datastore unavailable\"}");
        return EXIT_UNRECOVERABLE;
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let Ok(coordinator) = build_coordinator(config, Arc::clone(&datastore), Arc::clone(&clock))
    else {
        emit("{\"status\":\"error\",\"error\":\"coordinator construction failed\"}");
        return EXIT_UNRECOVERABLE;
    };
    let Ok(bind_addr) = config.server.bind_addr.parse() else {
        emit("{\"status\":\"error\",\"error\":\"server.bind_addr is not a socket address\"}");
        return EXIT_VALIDATION;
    };
    let state = AppState {
        datastore,
        coordinator: Arc::new(coordinator),
        clock,
        metrics: Arc::new(NoopMetrics),
        audit: Arc::new(StderrAuditSink::default()),
        config: Arc::new(AdminServerConfig {
            pipeline_version: config.pipeline.version.clone(),
            similarity_threshold: config.server.similarity_threshold,
            orphan_timeout_ms: config.pipeline.run_timeout_ms,
        }),
    };
    let Ok(runtime) = tokio::runtime::Runtime::new() else {
        emit("{\"status\":\"error\",\"error\":\"tokio runtime construction failed\"}");
        return EXIT_UNRECOVERABLE;
    };
    match runtime.block_on(fundline_server::serve(state, bind_addr)) {
        Ok(()) => EXIT_SUCCESS,
        Err(message) => {
            emit(&format!("{{\"status\":\"error\",\"error\":\"{message}\"}}"));
            EXIT_UNRECOVERABLE
        }
    }
}

/// Sweeps orphaned runs.
fn run_cleanup(config: &FundlineConfig) -> u8 {
    let Ok(datastore) = open_datastore(config) else {
        emit("{\"status\":\"error\",\"error\":\"datastore unavailable\"}");
        return EXIT_UNRECOVERABLE;
    };
    let clock = SystemClock;
    match cleanup_orphaned_runs(datastore.as_ref(), clock.now(), config.pipeline.run_timeout_ms) {
        Ok(cleaned) => {
            emit(&format!("{{\"status\":\"ok\",\"cleaned\":{cleaned}}}"));
            EXIT_SUCCESS
        }
        Err(err) => {
            emit(&format!("{{\"status\":\"error\",\"error\":\"{err}\"}}"));
            EXIT_UNRECOVERABLE
        }
    }
}

/// Prints the validated effective configuration.
fn run_config_validate(config: &FundlineConfig) -> u8 {
    match serde_json::to_string_pretty(config) {
        Ok(rendered) => {
            emit(&rendered);
            EXIT_SUCCESS
        }
        Err(err) => {
            emit(&format!("{{\"status\":\"error\",\"error\":\"{err}\"}}"));
            EXIT_UNRECOVERABLE
        }
    }
}

// ============================================================================
// SECTION: Wiring
// ============================================================================

/// Opens the configured SQLite datastore.
fn open_datastore(config: &FundlineConfig) -> Result<Arc<dyn Datastore>, ()> {
    let store_config = SqliteStoreConfig {
        path: config.storage.path.clone(),
        busy_timeout_ms: config.storage.busy_timeout_ms,
    };
    SqliteDatastore::open(&store_config)
        .map(|store| Arc::new(store) as Arc<dyn Datastore>)
        .map_err(|_| ())
}

/// Builds the coordinator with the default agent wiring.
fn build_coordinator(
    config: &FundlineConfig,
    datastore: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
) -> Result<PipelineCoordinator, ()> {
    let fetch_config = HttpFetchConfig {
        allow_http: config.http.allow_http,
        timeout_ms: config.http.timeout_ms,
        max_response_bytes: config.http.max_response_bytes,
        user_agent: config.http.user_agent.clone(),
        capture_raw_responses: true,
    };
    let raw_store: Arc<dyn fundline_core::interfaces::RawResponseStore> = datastore.clone();
    let opportunity_store: Arc<dyn fundline_core::interfaces::OpportunityStore> =
        datastore.clone();
    let extractor = HttpFetchAgent::new(fetch_config, Some(raw_store), Arc::clone(&clock))
        .map_err(|_| ())?;
    let parts = PipelineParts {
        store: Arc::clone(&datastore),
        analyzer: Arc::new(ConfiguredSourceAnalyzer::heuristic()),
        extractor: Arc::new(extractor),
        analysis: Arc::new(HeuristicAnalysisAgent),
        filter: Arc::new(ScoreThresholdFilter::default()),
        storage: Arc::new(DatastoreStorageAgent::new(opportunity_store, Arc::clone(&clock))),
        clock,
        waiter: Arc::new(ThreadWaiter),
    };
    Ok(PipelineCoordinator::new(parts, config.pipeline_config()))
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Maps a run failure to the partial/unrecoverable/validation contract.
fn failure_exit(
    datastore: &Arc<dyn Datastore>,
    failure: &fundline_core::RunFailure,
) -> u8 {
    if failure.category == ErrorCategory::ValidationError {
        return EXIT_VALIDATION;
    }
    let partially_processed = failure
        .run_id
        .as_ref()
        .and_then(|run_id| datastore.load_run(run_id).ok().flatten())
        .is_some_and(|run| run.totals.opportunities_processed > 0);
    if partially_processed {
        EXIT_PARTIAL
    } else {
        EXIT_UNRECOVERABLE
    }
}

/// Writes one line to stdout without the denied print macros.
fn emit(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
}
