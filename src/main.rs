use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use reel_forge::config::{OverlayMode, ServiceConfig};
use reel_forge::job::{JobRunner, expand_request_paths};
use reel_forge::media::MediaProbe;
use reel_forge::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use reel_forge::observability::server::MetricsServer;
use reel_forge::plan::write_lock;
use reel_forge::request::JobRequest;
use reel_forge::validation::validate_request;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "reel-forge", &mut io::stdout());
        return Ok(());
    }

    configure_tracing(cli.otlp_endpoint.as_deref())?;
    let config = Arc::new(load_config(cli.config.as_deref(), cli.overlay_mode)?);

    let command_result = match cli.command {
        Commands::Render {
            requests,
            workers,
            output,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
        } => render(
            config,
            RenderOptions {
                requests,
                workers,
                output,
                print_metrics,
                metrics_json,
                metrics_prometheus,
                metrics_listen,
            },
        ),
        Commands::Plan { request, output } => plan_command(config, request, output),
        Commands::Validate { requests } => validate_command(requests),
        Commands::Probe { file } => probe_command(config, file),
        Commands::Sweep { max_age_secs } => sweep_command(config, max_age_secs),
        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                print!("{}", config.to_yaml()?);
                Ok(())
            }
        },
        Commands::Completions { .. } => Ok(()),
    };

    #[cfg(feature = "otel")]
    if cli.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "reel-forge")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn load_config(path: Option<&Path>, overlay_mode: Option<OverlayMode>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid REEL_FORGE_* environment override")?;
    if let Some(mode) = overlay_mode {
        config.overlay.mode = mode;
    }
    Ok(config)
}

struct RenderOptions {
    requests: Vec<String>,
    workers: usize,
    output: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn render(config: Arc<ServiceConfig>, options: RenderOptions) -> Result<()> {
    let paths = expand_request_paths(&options.requests)?;
    if paths.is_empty() {
        warn!("No request files resolved. Nothing to render.");
        return Ok(());
    }
    let requests = paths
        .iter()
        .map(|path| JobRequest::load(path))
        .collect::<Result<Vec<_>>>()?;

    let runner = JobRunner::new(config.clone());
    let recovered = runner
        .workspaces()
        .recover_stale(config.workspace.stale_after());
    if !recovered.removed.is_empty() {
        info!(removed = recovered.removed.len(), "Recovered stale workspaces");
    }

    let metrics_handle = runner.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &options.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &options.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let outcomes = runner.run_batch(requests, options.workers);

    let mut responses = Vec::with_capacity(outcomes.len());
    let mut failures = 0usize;
    for (path, outcome) in paths.iter().zip(&outcomes) {
        if !outcome.is_success() {
            failures += 1;
        }
        responses.push(serde_json::json!({
            "request": path.display().to_string(),
            "response": outcome.response(),
        }));
    }
    let report = serde_json::Value::Array(responses);
    match &options.output {
        Some(path) => {
            create_parent_dir(path)?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create response file: {}", path.display()))?;
            to_writer_pretty(file, &report)
                .with_context(|| format!("Failed to write responses: {}", path.display()))?;
            info!(file = %path.display(), "Responses written");
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    let snapshot = metrics_handle.snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &options.metrics_json {
        create_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &options.metrics_prometheus {
        create_parent_dir(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if failures > 0 {
        bail!("{failures} of {} job(s) failed", outcomes.len());
    }
    Ok(())
}

fn plan_command(config: Arc<ServiceConfig>, request_path: PathBuf, output: PathBuf) -> Result<()> {
    let request = JobRequest::load(&request_path)?;
    let runner = JobRunner::new(config);
    let plan = runner
        .dry_run(&request)
        .with_context(|| format!("Failed to plan {}", request_path.display()))?;
    create_parent_dir(&output)?;
    write_lock(&plan, &output)?;
    info!(
        lock = %output.display(),
        fingerprint = %plan.fingerprint(),
        duration_s = plan.effective_duration(),
        overlays = plan.overlay_count(),
        "Plan lock written"
    );
    Ok(())
}

fn validate_command(requests: Vec<String>) -> Result<()> {
    let paths = expand_request_paths(&requests)?;
    let mut failed = 0usize;
    for path in &paths {
        let request = JobRequest::load(path)?;
        let report = validate_request(&request);
        for warning in &report.warnings {
            warn!(file = %path.display(), "{warning}");
        }
        if report.is_ok() {
            info!(file = %path.display(), "Request validation passed");
        } else {
            failed += 1;
            for error_msg in &report.errors {
                error!(file = %path.display(), "{error_msg}");
            }
        }
    }
    if failed > 0 {
        bail!("Request validation failed for {failed} file(s)");
    }
    Ok(())
}

fn probe_command(config: Arc<ServiceConfig>, file: PathBuf) -> Result<()> {
    let runner = JobRunner::new(config);
    let probe = runner.executor();
    let duration = probe
        .probe_duration(&file)
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    let has_audio = probe.has_audio(&file)?;
    println!(
        "{}",
        serde_json::json!({
            "file": file.display().to_string(),
            "duration": duration,
            "hasAudio": has_audio,
        })
    );
    Ok(())
}

fn sweep_command(config: Arc<ServiceConfig>, max_age_secs: Option<u64>) -> Result<()> {
    let runner = JobRunner::new(config.clone());
    let max_age = max_age_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.workspace.stale_after());
    let report = runner.workspaces().recover_stale(max_age);
    for warning in &report.warnings {
        warn!(path = %warning.path.display(), reason = %warning.reason, "Cleanup warning");
    }
    info!(
        removed = report.removed.len(),
        kept = report.kept,
        warnings = report.warnings.len(),
        "Workspace sweep finished"
    );
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "reel-forge",
    version,
    about = "Short-form vertical video assembly: trim, crop, caption, score"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Service configuration (YAML).
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long = "overlay-mode", global = true, value_enum)]
    overlay_mode: Option<OverlayMode>,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one reel per request file.
    Render {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        requests: Vec<String>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Write the responses here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
    },
    /// Acquire and plan without encoding; write a plan lock.
    Plan {
        request: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Validate {
        #[arg(required = true)]
        requests: Vec<String>,
    },
    Probe {
        file: PathBuf,
    },
    /// Remove stale job workspaces.
    Sweep {
        #[arg(long = "max-age-secs")]
        max_age_secs: Option<u64>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Show,
}
