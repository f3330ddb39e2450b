use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use arrow_control::{
    Caller, ControlRuntime, Frame, RuntimeConfig, ScriptStep, ScriptedClassifier, SettingsPatch,
};
use arrow_telemetry::ControlEvent;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arrowctl", version, about = "Arrow robot control driver")]
struct Cli {
    /// Runtime configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validates a configuration file and prints a summary.
    Check,
    /// Prints the effective settings as JSON.
    Settings {
        /// Applies a JSON settings patch before printing.
        #[arg(long)]
        patch: Option<String>,
    },
    /// Replays a scripted classification session against the configured
    /// actuator backend.
    Replay(ReplayArgs),
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Model file; labels are read from `<stem>_labels.txt` beside it.
    #[arg(long)]
    model: PathBuf,
    /// JSON-lines script of `{label, confidence, delay_ms}` steps.
    #[arg(long)]
    script: PathBuf,
    #[arg(long, default_value = "replay-pilot")]
    session: String,
    #[arg(long, default_value_t = 32)]
    width: u32,
    #[arg(long, default_value_t = 32)]
    height: u32,
    /// Prints every control event once the replay ends.
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayStep {
    label: String,
    confidence: f64,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct ReplaySummary {
    frames: usize,
    executed: usize,
    rejected: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("arrow_control=info,arrowctl=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Check => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "settings": config.settings,
                    "actuator": config.actuator,
                    "watchdog": config.watchdog,
                    "telemetry": config.telemetry,
                    "model": config.model,
                }))?
            );
            println!("configuration ok");
            Ok(())
        }
        Commands::Settings { patch } => {
            let mut settings = config.settings;
            if let Some(raw) = patch {
                let patch: SettingsPatch =
                    serde_json::from_str(&raw).context("parsing settings patch")?;
                settings = patch.merged(&settings);
                settings.validate().context("patched settings are invalid")?;
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Replay(args) => {
            let runtime = Runtime::new().context("starting tokio runtime")?;
            let (summary, events) = runtime.block_on(run_replay(&config, &args))?;
            if args.events {
                for event in &events {
                    println!("{}", serde_json::to_string(event)?);
                }
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig::default()),
    }
}

fn read_script(path: &Path) -> Result<Vec<ReplayStep>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading replay script {}", path.display()))?;
    let mut steps = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: ReplayStep = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid step", path.display(), index + 1))?;
        steps.push(step);
    }
    if steps.is_empty() {
        bail!("replay script {} has no steps", path.display());
    }
    Ok(steps)
}

async fn run_replay(
    config: &RuntimeConfig,
    args: &ReplayArgs,
) -> Result<(ReplaySummary, Vec<ControlEvent>)> {
    let steps = read_script(&args.script)?;
    let labels = config.model.default_labels.clone();
    let classifier = Arc::new(
        ScriptedClassifier::new(
            labels.len(),
            steps
                .iter()
                .map(|step| ScriptStep::Label {
                    label: step.label.clone(),
                    confidence: step.confidence,
                })
                .collect(),
        )
        .with_default_labels(labels),
    );

    let runtime = ControlRuntime::from_config(config, classifier)?;
    runtime.start();
    let service = runtime.service();
    let pilot = Caller::pilot(args.session.clone());
    service.acquire_control(&pilot)?;
    let model = service.load_model(&pilot, &args.model).await?;
    if let Some(warning) = &model.warning {
        warn!("{warning}");
    }
    service.start_inference(&pilot)?;
    info!(model = %model.model, steps = steps.len(), "replay started");

    let frame = Frame::blank(args.width, args.height);
    let mut summary = ReplaySummary::default();
    for step in &steps {
        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
        summary.frames += 1;
        match service.submit_frame(&pilot, &frame).await {
            Ok(report) => {
                if report.command_executed {
                    summary.executed += 1;
                }
                println!("{}", serde_json::to_string(&report)?);
            }
            Err(err) => {
                summary.rejected += 1;
                warn!(family = err.family(), %err, "frame rejected");
            }
        }
    }

    service.stop_inference(&pilot)?;
    service.release_control(&pilot)?;
    println!("{}", serde_json::to_string(&service.status())?);
    runtime.shutdown().await;
    Ok((summary, runtime.events().snapshot()))
}
