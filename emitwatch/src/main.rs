#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use emitwatch_lib::ingest::VisibleRow;
use emitwatch_lib::{
    BatchSummary, Config, ConfigLoader, EmitKind, FileLogStore, Pipeline, PipelineEvent,
    PipelineHandle, SystemClock, WebSocketConnector, telemetry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "emitwatch")]
#[command(about = "Follow a live emit feed and render the ingested log")]
#[command(version)]
struct Cli {
    /// Configuration file layered above the system and user files
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// WebSocket endpoint of the emit feed
    #[arg(short, long, value_name = "URL")]
    endpoint: Option<String>,

    /// Directory of the durable log
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (human, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Categories to render, comma separated (default: the known categories)
    #[arg(short, long, value_delimiter = ',', value_name = "TYPE")]
    types: Vec<String>,

    /// Rows of the filtered log rendered after each batch
    #[arg(long, default_value_t = 10)]
    rows: usize,

    /// Output format for rendered lines (human, json)
    #[arg(short, long, value_name = "FORMAT")]
    #[arg(default_value = "human")]
    format: String,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Human,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown format: {other}"),
        }
    }
}

/// What the console renderer shows.
#[derive(Debug)]
struct View {
    selection: Vec<EmitKind>,
    rows: usize,
    format: OutputFormat,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Parse CLI arguments first so --help and --version never touch config
    let cli = Cli::parse();
    let format: OutputFormat = cli.format.parse()?;

    let mut loader = ConfigLoader::new("emitwatch");
    if let Some(ref path) = cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("Failed to load configuration")?;
    apply_overrides(&mut config, &cli);
    ConfigLoader::validate_config(&config).context("Invalid configuration")?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    telemetry::init_logging(&config.logging)?;

    let view = View {
        selection: selection_from(&cli.types),
        rows: cli.rows,
        format,
    };

    let store = FileLogStore::with_segment_max_bytes(
        config.store.path.clone(),
        config.store.segment_max_bytes,
    )
    .await
    .with_context(|| format!("Failed to open durable log at {}", config.store.path.display()))?;

    info!(
        endpoint = %config.connection.endpoint,
        store = %store.dir().display(),
        "Starting emitwatch"
    );

    let (handle, pipeline_task) = Pipeline::spawn(
        &config,
        Arc::new(WebSocketConnector),
        Arc::new(store),
        Arc::new(SystemClock::new()),
    );
    let mut events = handle.subscribe();

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            () = &mut shutdown_signal => {
                info!("Shutdown signal received; commencing graceful shutdown");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => render(&handle, &view, &event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Renderer fell behind, events skipped");
                }
                Err(RecvError::Closed) => {
                    warn!("Pipeline stopped unexpectedly");
                    break;
                }
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        debug!(error = %e, "Pipeline already stopped");
    }
    pipeline_task.await.context("Pipeline task failed")?;
    info!("emitwatch stopped");
    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(ref endpoint) = cli.endpoint {
        config.connection.endpoint.clone_from(endpoint);
    }
    if let Some(ref dir) = cli.store_dir {
        config.store.path.clone_from(dir);
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(ref log_format) = cli.log_format {
        config.logging.format.clone_from(log_format);
    }
}

fn selection_from(types: &[String]) -> Vec<EmitKind> {
    if types.is_empty() {
        return EmitKind::KNOWN.to_vec();
    }
    types
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(EmitKind::from)
        .collect()
}

async fn render(handle: &PipelineHandle, view: &View, event: &PipelineEvent) -> anyhow::Result<()> {
    if view.format == OutputFormat::Json {
        match *event {
            PipelineEvent::SeriesUpdated { .. } | PipelineEvent::FlashCleared { .. } => {}
            _ => println!("{}", serde_json::to_string(event)?),
        }
        if let PipelineEvent::BatchFlushed { .. } = *event {
            let rows = visible_rows(handle, view).await?;
            println!("{}", serde_json::to_string(&rows)?);
        }
        return Ok(());
    }

    match *event {
        PipelineEvent::StateChanged { state, attempt } => {
            if attempt > 0 {
                println!("connection: {state} (attempt {attempt})");
            } else {
                println!("connection: {state}");
            }
        }
        PipelineEvent::Hydrated { count } => println!("restored {count} entries"),
        PipelineEvent::BatchFlushed { ref summary } => {
            println!("{}", summary_line(summary));
            for row in visible_rows(handle, view).await? {
                println!("{}", row_line(&row));
            }
        }
        PipelineEvent::ViewCleared => println!("view cleared"),
        PipelineEvent::BatchRetracted { .. }
        | PipelineEvent::FlashCleared { .. }
        | PipelineEvent::SeriesUpdated { .. } => {
            debug!(event = ?event, "Presentation update");
        }
    }
    Ok(())
}

async fn visible_rows(handle: &PipelineHandle, view: &View) -> anyhow::Result<Vec<VisibleRow>> {
    let mut rows = handle.visible(view.selection.clone()).await?;
    rows.truncate(view.rows);
    Ok(rows)
}

fn summary_line(summary: &BatchSummary) -> String {
    let counts = &summary.counts;
    format!(
        "{} {}: {} new (wrong_direction={} plate_final={} ocr_raw={} speeding={})",
        clock_time(summary.ts_ms),
        summary.token,
        summary.count,
        counts.wrong_direction,
        counts.plate_final,
        counts.ocr_raw,
        counts.speeding,
    )
}

fn row_line(row: &VisibleRow) -> String {
    let record = &row.record;
    let marker = if row.flash.is_some() { '*' } else { ' ' };
    let mut line = format!(
        "{marker} {} {:<15} {}",
        clock_time(record.ts_ms),
        record.kind_str().unwrap_or("-"),
        record.text(),
    );
    if let Some(cam) = record.cam_id() {
        line.push_str(&format!(" cam={cam}"));
    }
    if let Some(pct) = record.confidence_pct() {
        line.push_str(&format!(" conf={pct:.0}%"));
    }
    line
}

fn clock_time(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map_or_else(|| ts_ms.to_string(), |t| t.format("%H:%M:%S%.3f").to_string())
}
