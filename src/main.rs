//! testgrid CLI - run browser test plans on a simulated worker grid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testgrid::config::{self, Config, StoreConfig};
use testgrid::driver::{ElementState, MemoryDriver};
use testgrid::events::{MultiSink, TracingSink};
use testgrid::model::{Suite, TestDefinition, TestResult, TestStatus};
use testgrid::orchestrator::Orchestrator;
use testgrid::report::{self, ConsoleReporter, JUnitReport, Summary};
use testgrid::store::{FileStore, MemoryStore, Store};

const DEFAULT_CONFIG_PATH: &str = "testgrid.toml";

#[derive(Parser)]
#[command(name = "testgrid")]
#[command(about = "Browser test orchestration on an autoscaled worker pool", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: testgrid.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests and suites of a JSON plan
    Run {
        /// Plan file: { "tests": [...], "suites": [...] }
        plan: PathBuf,

        /// Override the maximum number of workers
        #[arg(short, long, visible_alias = "max-workers")]
        parallel: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate,

    /// Write a commented default configuration file
    Init {
        /// Print to stdout instead of writing the file
        #[arg(long)]
        stdout: bool,
    },
}

/// Contents of a plan file.
#[derive(Debug, Deserialize)]
struct Plan {
    #[serde(default)]
    tests: Vec<TestDefinition>,

    #[serde(default)]
    suites: Vec<Suite>,

    /// Elements seeded into every simulated page.
    #[serde(default)]
    elements: HashMap<String, ElementState>,

    /// Create unknown elements on first use instead of failing.
    #[serde(default = "default_lenient")]
    lenient: bool,
}

fn default_lenient() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            plan,
            parallel,
            junit,
        } => run_plan(cli.config.as_deref(), &plan, parallel, junit, cli.verbose).await,
        Commands::Validate => validate_config(cli.config.as_deref()),
        Commands::Init { stdout } => init_config(cli.config.as_deref(), stdout),
    }
}

/// Loads the given config file, or `testgrid.toml` when present, or the
/// defaults.
fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::load_config(default)
            } else {
                info!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
                Ok(Config::default())
            }
        }
    }
}

fn load_plan(path: &Path) -> Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse plan file: {}", path.display()))
}

async fn run_plan(
    config_path: Option<&Path>,
    plan_path: &Path,
    parallel_override: Option<usize>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    if let Some(parallel) = parallel_override {
        let parallel = parallel.max(1);
        config.pool.max_workers = parallel;
        config.pool.min_workers = config.pool.min_workers.min(parallel);
    }
    config::validate(&config)?;

    let plan = load_plan(plan_path)?;
    let total = plan.tests.len() + plan.suites.iter().map(|s| s.tests.len()).sum::<usize>();
    info!(
        "Loaded {} tests and {} suites from {}",
        plan.tests.len(),
        plan.suites.len(),
        plan_path.display()
    );

    let store: Arc<dyn Store> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::File { dir } => Arc::new(FileStore::new(dir.clone())),
    };
    let driver = if plan.lenient {
        MemoryDriver::lenient()
    } else {
        MemoryDriver::new()
    }
    .with_elements(plan.elements);

    let reporter = Arc::new(ConsoleReporter::new(verbose));
    let events = MultiSink::new()
        .with_sink(reporter.clone())
        .with_sink(TracingSink);
    let orchestrator = Orchestrator::builder(Arc::new(driver))
        .config(&config)
        .store(store)
        .events(Arc::new(events))
        .build();

    let started = Instant::now();
    orchestrator.start().await;
    reporter.start(total);

    let mut suite_runs = Vec::new();
    for suite in plan.suites {
        let name = suite.name.clone();
        match orchestrator.start_suite(suite) {
            Ok(handle) => suite_runs.push(handle),
            Err(e) => warn!("Suite {} rejected: {}", name, e),
        }
    }

    let mut results: Vec<TestResult> = Vec::new();
    let mut rejected = 0;
    let submissions = orchestrator.submit_batch(plan.tests.clone()).await;
    for (test, submission) in plan.tests.iter().zip(submissions) {
        let outcome = match submission {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => results.push(match outcome.result {
                Some(result) => result,
                None => TestResult::unexecuted(
                    &outcome.test,
                    outcome.test.status,
                    outcome.test.error.clone(),
                ),
            }),
            Err(e) => {
                warn!("Test {} was not run: {}", test.name, e);
                rejected += 1;
                results.push(TestResult::unexecuted(
                    test,
                    TestStatus::Failed,
                    Some(e.to_string()),
                ));
            }
        }
    }

    let mut suites = Vec::new();
    for run in suite_runs {
        suites.push(run.await.context("Suite task failed")?);
    }

    reporter.finish();
    let flaky = orchestrator.engine().retries().stats().flaky_tests;
    orchestrator.shutdown().await;

    let mut all_results = results.clone();
    all_results.extend(suites.iter().flat_map(|s| s.test_results.iter().cloned()));
    let summary = Summary::from_results(&all_results, flaky);
    report::print_summary(&summary, &suites, started.elapsed());

    if let Some(path) = junit_path {
        let junit = suites
            .iter()
            .fold(JUnitReport::new().with_tests("testgrid", &results), |report, suite| {
                report.with_suite(suite)
            });
        junit.write(&path)?;
    }

    let success = rejected == 0
        && summary.all_passed()
        && suites.iter().all(|s| s.status == TestStatus::Completed);
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    match resolve_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Queue max size: {}", config.queue.max_size);
            println!("  Queue timeout: {}s", config.queue.timeout_secs);
            println!(
                "  Workers: {}..{}",
                config.pool.min_workers, config.pool.max_workers
            );
            println!("  Idle timeout: {}s", config.pool.idle_timeout_secs);
            println!(
                "  Autoscaler: {}",
                if config.autoscaler.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            let store = match &config.store {
                StoreConfig::Memory => "memory".to_string(),
                StoreConfig::File { dir } => format!("file ({})", dir.display()),
            };
            println!("  Store: {}", store);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: Option<&Path>, stdout: bool) -> Result<()> {
    if stdout {
        print!("{}", config::DEFAULT_CONFIG);
        return Ok(());
    }

    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config::DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  testgrid run <plan.json>");
    Ok(())
}
