//! CLI command definitions for qa-forge.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::export::RESULTS_FILE;
use crate::llm::local::is_served;
use crate::llm::ChatClient;
use crate::metrics::export_metrics;
use crate::pipeline::config::REQUIRED_SECTIONS;
use crate::pipeline::{discover_documents, AppConfig, GpuDevices, PipelineOrchestrator, RunRequest};
use crate::scheduler::CancelToken;

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Number of input files `doctor` lists as a sample.
const DOCTOR_SAMPLE_FILES: usize = 3;

/// QA pair generator for semiconductor display text.
#[derive(Parser)]
#[command(name = "qa-forge")]
#[command(about = "Generate scored question/answer pairs from domain text on local GPU model servers")]
#[command(version)]
#[command(
    long_about = "qa-forge cleans and segments domain documents, generates question/answer pairs on one model server per GPU device, scores them and keeps those above a quality threshold.\n\nExample usage:\n  qa-forge run --input data/texts --output data/output --model qwq_32 --gpu-devices 0,1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the generation pipeline over an input directory.
    Run(RunArgs),

    /// Check configuration, directories and model servers without generating.
    Doctor(DoctorArgs),
}

/// Arguments for `qa-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON or YAML config file (defaults to ./config.json if present).
    #[arg(short = 'c', long, env = "QAFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of input documents.
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Directory for result files.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Model name, resolved through the config's model registry.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Documents per batch.
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Comma-separated GPU device ids, e.g. "0,1".
    #[arg(short = 'g', long)]
    pub gpu_devices: Option<String>,

    /// Minimum quality score for a pair to be kept, in [0, 1].
    #[arg(short = 't', long)]
    pub threshold: Option<f64>,

    /// Per-batch generation timeout in seconds.
    #[arg(long)]
    pub batch_timeout: Option<u64>,

    /// How many times a failed batch's documents are re-batched.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Skip writing rejected pairs to rejected_qa.jsonl.
    #[arg(long)]
    pub no_rejected_log: bool,

    /// Write Prometheus metrics in text format to this file after the run.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `qa-forge doctor`.
#[derive(Parser, Debug)]
pub struct DoctorArgs {
    /// Path to a JSON or YAML config file (defaults to ./config.json if present).
    #[arg(short = 'c', long, env = "QAFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip probing the model servers.
    #[arg(long)]
    pub offline: bool,

    /// Print the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Doctor(args) => run_doctor_command(args).await,
    }
}

/// Loads the config file (explicit, or `./config.json` if present, else
/// defaults) and applies environment overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => AppConfig::from_file(DEFAULT_CONFIG_FILE)?,
        None => {
            info!("No config file found, using defaults");
            AppConfig::default()
        }
    };
    Ok(config.apply_env()?)
}

// ============================================================================
// Run Command Implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct RunOutput {
    status: &'static str,
    run_id: String,
    output_dir: String,
    documents: usize,
    processed: usize,
    failed: usize,
    generated: usize,
    accepted: usize,
    acceptance_rate: f64,
    cancelled: bool,
    duration_secs: f64,
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(input) = &args.input {
        config.paths.input_dir = input.clone();
    }
    if let Some(output) = &args.output {
        config.paths.output_dir = output.clone();
    }
    if let Some(model) = &args.model {
        config.models.default_model = model.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(devices) = &args.gpu_devices {
        config = config.with_gpu_devices(devices.clone());
    }
    if let Some(threshold) = args.threshold {
        config = config.with_quality_threshold(threshold);
    }
    if let Some(secs) = args.batch_timeout {
        config = config.with_batch_timeout(Duration::from_secs(secs));
    }
    if let Some(retries) = args.retries {
        config = config.with_max_batch_retries(retries);
    }
    if args.no_rejected_log {
        config.processing.keep_rejected = false;
    }
    config.validate()?;

    let orchestrator = PipelineOrchestrator::from_config(&config);
    let request = RunRequest::from_config(config)?;
    let output_dir = request.output_dir.clone();

    let cancel = CancelToken::new();
    let ctrl_c_token = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight batches");
            ctrl_c_token.cancel();
        }
    });

    let outcome = orchestrator.run(request, &cancel).await;
    ctrl_c.abort();
    let result = outcome?;

    if let Some(path) = &args.metrics_file {
        std::fs::write(path, export_metrics())?;
        info!(path = %path.display(), "Metrics written");
    }

    let stats = &result.stats;
    if args.json {
        let output = RunOutput {
            status: if result.cancelled { "cancelled" } else { "completed" },
            run_id: result.run_id.to_string(),
            output_dir: output_dir.display().to_string(),
            documents: stats.documents_discovered,
            processed: stats.documents_processed,
            failed: stats.documents_failed,
            generated: stats.pairs_generated,
            accepted: stats.pairs_accepted,
            acceptance_rate: stats.acceptance_rate(),
            cancelled: result.cancelled,
            duration_secs: stats.duration.as_secs_f64(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if result.cancelled {
        println!("⚠ Run cancelled, partial results written");
    } else {
        println!("✓ Run completed");
    }
    println!("  Run id:     {}", result.run_id);
    println!("  Results:    {}", output_dir.join(RESULTS_FILE).display());
    println!(
        "  Documents:  {} discovered, {} processed, {} failed",
        stats.documents_discovered, stats.documents_processed, stats.documents_failed
    );
    println!(
        "  QA pairs:   {} generated, {} accepted ({:.1}%)",
        stats.pairs_generated,
        stats.pairs_accepted,
        stats.acceptance_rate() * 100.0
    );
    println!("  Duration:   {:.1}s", stats.duration.as_secs_f64());

    if !result.failures.is_empty() {
        println!("  Failures:");
        for failure in &result.failures {
            println!(
                "    {} [{}]: {}",
                failure.document.display(),
                failure.kind,
                failure.message
            );
        }
    }
    Ok(())
}

// ============================================================================
// Doctor Command Implementation
// ============================================================================

/// One pass/fail line of a doctor report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoctorCheck {
    pub category: &'static str,
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl DoctorCheck {
    fn pass(category: &'static str, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(category: &'static str, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Environment health report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DoctorCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Checks that every config section was present in the source file.
pub fn check_config_sections(config: &AppConfig) -> Vec<DoctorCheck> {
    let mut checks: Vec<DoctorCheck> = REQUIRED_SECTIONS
        .iter()
        .map(|section| {
            if config.missing_sections.iter().any(|m| m == section) {
                DoctorCheck::fail("config", *section, "section missing, defaults in use")
            } else {
                DoctorCheck::pass("config", *section, "present")
            }
        })
        .collect();

    checks.push(match config.validate() {
        Ok(()) => DoctorCheck::pass("config", "values", "valid"),
        Err(e) => DoctorCheck::fail("config", "values", e.to_string()),
    });
    checks
}

/// Checks the input and output directories.
pub fn check_directories(config: &AppConfig) -> Vec<DoctorCheck> {
    let input = &config.paths.input_dir;
    let output = &config.paths.output_dir;

    let input_check = if input.is_dir() {
        DoctorCheck::pass("directories", "input", input.display().to_string())
    } else {
        DoctorCheck::fail(
            "directories",
            "input",
            format!("{} does not exist", input.display()),
        )
    };

    let output_check = if output.is_dir() {
        DoctorCheck::pass("directories", "output", output.display().to_string())
    } else if output.exists() {
        DoctorCheck::fail(
            "directories",
            "output",
            format!("{} is not a directory", output.display()),
        )
    } else {
        DoctorCheck::pass(
            "directories",
            "output",
            format!("{} will be created", output.display()),
        )
    };

    vec![input_check, output_check]
}

/// Lists a few discoverable input files.
pub fn check_inputs(config: &AppConfig) -> Vec<DoctorCheck> {
    match discover_documents(&config.paths.input_dir, &config.processing.file_extensions) {
        Ok(files) if files.is_empty() => vec![DoctorCheck::fail(
            "inputs",
            "documents",
            format!(
                "no files with extensions [{}]",
                config.processing.file_extensions.join(", ")
            ),
        )],
        Ok(files) => {
            let mut checks = vec![DoctorCheck::pass(
                "inputs",
                "documents",
                format!("{} files found", files.len()),
            )];
            for file in files.iter().take(DOCTOR_SAMPLE_FILES) {
                checks.push(match std::fs::metadata(file) {
                    Ok(meta) if meta.len() > 0 => DoctorCheck::pass(
                        "inputs",
                        file.display().to_string(),
                        format!("{} bytes", meta.len()),
                    ),
                    Ok(_) => DoctorCheck::fail("inputs", file.display().to_string(), "empty file"),
                    Err(e) => DoctorCheck::fail("inputs", file.display().to_string(), e.to_string()),
                });
            }
            checks
        }
        Err(e) => vec![DoctorCheck::fail("inputs", "documents", e.to_string())],
    }
}

/// Checks the model server of every configured device.
pub async fn check_model_servers(config: &AppConfig) -> Vec<DoctorCheck> {
    let devices = match GpuDevices::parse(&config.processing.gpu_devices) {
        Ok(devices) => devices,
        Err(e) => return vec![DoctorCheck::fail("models", "gpu_devices", e.to_string())],
    };
    let served = config.models.resolve(&config.models.default_model);
    let timeout = Duration::from_secs(config.api.request_timeout_secs.min(10));

    let mut checks = Vec::with_capacity(devices.len());
    for (position, device) in devices.iter().enumerate() {
        let name = format!("device {}", device);
        let endpoint = config.api.endpoint_for(position);
        let client = match ChatClient::new(&endpoint, config.api.api_key.clone(), timeout) {
            Ok(client) => client,
            Err(e) => {
                checks.push(DoctorCheck::fail("models", name, e.to_string()));
                continue;
            }
        };
        checks.push(match client.list_models().await {
            Ok(models) => served_model_check(name, &endpoint, &served, &models),
            Err(e) => DoctorCheck::fail("models", name, format!("{}: {}", endpoint, e)),
        });
    }
    checks
}

/// Judges a server's model listing the same way loading does.
fn served_model_check(name: String, endpoint: &str, served: &str, models: &[String]) -> DoctorCheck {
    if is_served(models, served) {
        DoctorCheck::pass("models", name, format!("{} serves {}", endpoint, served))
    } else {
        DoctorCheck::fail(
            "models",
            name,
            format!("{} does not serve {} (available: {})", endpoint, served, models.join(", ")),
        )
    }
}

async fn run_doctor_command(args: DoctorArgs) -> anyhow::Result<()> {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let report = DoctorReport {
                checks: vec![DoctorCheck::fail("config", "file", e.to_string())],
            };
            print_doctor_report(&report, args.json)?;
            anyhow::bail!("configuration could not be loaded");
        }
    };

    let mut report = DoctorReport::default();
    report.checks.extend(check_config_sections(&config));
    report.checks.extend(check_directories(&config));
    report.checks.extend(check_inputs(&config));
    if !args.offline {
        report.checks.extend(check_model_servers(&config).await);
    }

    print_doctor_report(&report, args.json)?;
    let failed = report.failed().count();
    if failed > 0 {
        anyhow::bail!("{} doctor check(s) failed", failed);
    }
    Ok(())
}

fn print_doctor_report(report: &DoctorReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let mut category = "";
    for check in &report.checks {
        if check.category != category {
            category = check.category;
            println!("[{}]", category);
        }
        let mark = if check.passed { "✓" } else { "✗" };
        println!("  {} {}: {}", mark, check.name, check.detail);
    }
    Ok(())
}
