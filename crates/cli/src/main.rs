//! Batch runner for ComfyUI workflow templates.
//!
//! Runs one named template, or every template in the directory, against
//! a ComfyUI instance and prints the resulting `/view` URLs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use easel_comfyui::client::ws_url_from_api_url;
use easel_comfyui::events::JobEvent;
use easel_comfyui::monitor::MonitorStrategy;
use easel_core::inject::NumericOverrides;
use easel_pipeline::config::PipelineConfig;
use easel_pipeline::reference::{content_type_for, ReferenceMedia};
use easel_pipeline::runner::{JobRequest, JobResult, JobRunner, RunStatus};
use easel_pipeline::templates::template_file_name;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PROMPT: &str = "A small red fox sitting in fresh snow at dawn, soft golden \
    backlight, shallow depth of field, detailed fur, calm expression, clean composition.";

#[derive(Debug, Parser)]
#[command(name = "easel-cli", version, about = "Run ComfyUI workflow templates")]
struct Cli {
    /// Template to run, with or without `.json`. Runs every template when omitted.
    workflow: Option<String>,
    /// Prompt text. Defaults to a built-in prompt.
    prompt: Vec<String>,
    /// ComfyUI base URL (overrides `COMFYUI_URL`).
    #[arg(long)]
    server: Option<String>,
    /// Template directory (overrides `WORKFLOWS_DIR`).
    #[arg(long)]
    workflows_dir: Option<PathBuf>,
    /// Reference image to upload instead of searching the template directory.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// `poll` or `events` (overrides `MONITOR_STRATEGY`).
    #[arg(long)]
    strategy: Option<MonitorStrategy>,
    /// Give up on a job after this many seconds; `0` waits forever.
    #[arg(long)]
    max_wait_secs: Option<u64>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    frame_count: Option<u32>,
    #[arg(long)]
    frame_rate: Option<f64>,
    #[arg(long)]
    sampler_steps: Option<u32>,
    #[arg(long)]
    sampler_cfg: Option<f64>,
    #[arg(long)]
    sampling_shift: Option<f64>,
}

impl Cli {
    /// Apply command-line overrides on top of the environment config.
    fn pipeline_config(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(server) = &self.server {
            config.comfyui_url = server.trim_end_matches('/').to_string();
            config.comfyui_ws_url = ws_url_from_api_url(&config.comfyui_url);
        }
        if let Some(dir) = &self.workflows_dir {
            config.workflows_dir = dir.clone();
            config.assets_dir = dir.clone();
        }
        if let Some(strategy) = self.strategy {
            config.monitor.strategy = strategy;
        }
        if let Some(secs) = self.max_wait_secs {
            config.monitor.max_wait = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }

    fn overrides(&self) -> NumericOverrides {
        NumericOverrides {
            width: self.width,
            height: self.height,
            frame_count: self.frame_count,
            frame_rate: self.frame_rate,
            sampler_steps: self.sampler_steps,
            sampler_cfg: self.sampler_cfg,
            sampling_shift: self.sampling_shift,
        }
    }

    fn prompt_text(&self) -> String {
        if self.prompt.is_empty() {
            DEFAULT_PROMPT.to_string()
        } else {
            self.prompt.join(" ")
        }
    }
}

/// Per-template result line.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Produced(usize),
    NoOutput,
    Failed(String),
}

impl Outcome {
    fn from_result(result: &JobResult) -> Self {
        match result.status {
            RunStatus::Succeeded => Self::Produced(result.media.len()),
            RunStatus::NoOutputProduced => Self::NoOutput,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Produced(n) => write!(f, "{n} item(s)"),
            Self::NoOutput => f.write_str("no output"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The batch fails only when nothing succeeded.
fn all_failed(outcomes: &[(String, Outcome)]) -> bool {
    outcomes
        .iter()
        .all(|(_, outcome)| matches!(outcome, Outcome::Failed(_)))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel_cli=info,easel_pipeline=info,easel_comfyui=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("easel-cli error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.pipeline_config(PipelineConfig::from_env());
    let workflows_dir = config.workflows_dir.clone();
    let reference = cli.reference.as_deref().map(read_reference).transpose()?;
    let runner = JobRunner::new(config);

    let available = runner
        .templates()
        .list()
        .await
        .with_context(|| format!("Failed to read workflow directory {}", workflows_dir.display()))?;
    if available.is_empty() {
        eprintln!("No .json workflow templates found in {}", workflows_dir.display());
        return Ok(ExitCode::FAILURE);
    }

    let (templates, prompt) = match &cli.workflow {
        Some(name) => {
            let file_name = template_file_name(name)?;
            if !available.contains(&file_name) {
                eprintln!("Workflow '{file_name}' not found.");
                eprintln!("Available: {}", available.join(", "));
                return Ok(ExitCode::FAILURE);
            }
            println!("Running single workflow: {file_name}\n");
            (vec![file_name], cli.prompt_text())
        }
        None => {
            println!(
                "No workflow specified, running all {} workflows with the default prompt\n",
                available.len()
            );
            (available, DEFAULT_PROMPT.to_string())
        }
    };

    println!("Prompt:\n{prompt}\n");
    println!("{}", "-".repeat(60));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cancelling");
            ctrl_c_cancel.cancel();
        }
    });

    let printer = tokio::spawn(print_events(runner.subscribe()));

    let total = templates.len();
    let mut outcomes = Vec::with_capacity(total);
    for (index, template) in templates.into_iter().enumerate() {
        println!("[{}/{total}] {template}", index + 1);
        let request = JobRequest {
            template: template.clone(),
            prompt: prompt.clone(),
            overrides: cli.overrides(),
            reference: reference.clone(),
        };

        let outcome = match runner.run_job(request, &cancel).await {
            Ok(result) => {
                for (n, locator) in result.media.iter().enumerate() {
                    match runner.view_url(locator) {
                        Ok(url) => println!("   Item {}: {url}", n + 1),
                        Err(e) => tracing::warn!(file = %locator.filename, error = %e, "Cannot build view URL"),
                    }
                }
                Outcome::from_result(&result)
            }
            Err(e) => {
                println!("   Failed: {e}");
                Outcome::Failed(e.to_string())
            }
        };
        outcomes.push((template, outcome));
        println!("{}", "-".repeat(60));

        if cancel.is_cancelled() {
            break;
        }
    }
    printer.abort();

    println!("Summary:");
    for (template, outcome) in &outcomes {
        println!("   {template}: {outcome}");
    }

    if all_failed(&outcomes) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn read_reference(path: &Path) -> Result<ReferenceMedia> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read reference image {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    let content_type = file_name.as_deref().map(|n| content_type_for(n).to_string());
    Ok(ReferenceMedia {
        file_name,
        content_type,
        bytes,
    })
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::Queued { prompt_id } => println!("   queued as {prompt_id}"),
        JobEvent::Started { .. } => println!("   started"),
        JobEvent::Progress { value, max, percent, .. } => {
            println!("   progress {value}/{max} ({percent}%)");
        }
        JobEvent::Executing { node, .. } => println!("   executing node {node}"),
        JobEvent::Finished { state, .. } => println!("   finished: {state:?}"),
    }
}
