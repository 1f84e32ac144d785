use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use seamscale_core::arch::{Architecture, ModelResolver, NoiseLevel, Style, UpscaleConfig};
use seamscale_core::backend::InferenceBackend;
use seamscale_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use seamscale_core::event::PipelineEvent;
use seamscale_core::inference::{ModelCache, OrtLoader};
use seamscale_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use seamscale_core::pipeline::PipelineOrchestrator;
use seamscale_core::tensor::TensorBuffer;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "seamscale", about = "Tiled neural image upscaling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one image file.
    Upscale(UpscaleArgs),
    /// Print the tiling plan of every stage as JSON without running a model.
    Plan(PlanArgs),
}

#[derive(Args, Clone)]
struct ModelArgs {
    #[arg(long = "arch", default_value = "swin_unet", help = "swin_unet, cunet or real_esrgan")]
    architecture: Architecture,
    #[arg(long, default_value = "art", help = "art, art_scan or photo")]
    style: Style,
    #[arg(long, default_value = "none", allow_hyphen_values = true, help = "-1/none or 0..=3")]
    noise: NoiseLevel,
    #[arg(long, default_value_t = 2)]
    scale: usize,
    #[arg(long, help = "Requested tile size (defaults to the config file value)")]
    tile_size: Option<usize>,
    #[arg(long = "memory-budget-mb", help = "Cap on memory held by one tile in flight")]
    memory_budget_mb: Option<u64>,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image (png, jpeg or webp)")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (defaults to <input>_<arch>_<scale>x.png)")]
    output: Option<PathBuf>,
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long)]
    backend: Option<InferenceBackend>,
    #[arg(long)]
    models_dir: Option<PathBuf>,
    #[arg(long, help = "Print pipeline events as JSON lines on stdout")]
    json: bool,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[command(flatten)]
    model: ModelArgs,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &config, &resolved_data_dir).await,
        Commands::Plan(args) => run_plan(args, &config),
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// CLI flags win over the config file.
fn upscale_config(args: &ModelArgs, config: &AppConfig) -> UpscaleConfig {
    let memory_budget = args
        .memory_budget_mb
        .map(|mb| mb.saturating_mul(BYTES_PER_MB))
        .or_else(|| config.tiling.memory_budget_bytes());

    UpscaleConfig {
        architecture: args.architecture,
        style: args.style,
        noise: args.noise,
        scale: args.scale,
        tile_size: args.tile_size.unwrap_or(config.tiling.tile_size),
        blend_size: config.tiling.blend_size,
        memory_budget,
    }
}

fn default_output_path(input: &Path, config: &UpscaleConfig) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!(
        "{stem}_{}_{}x.png",
        config.architecture, config.scale
    ))
}

fn run_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    let upscale = upscale_config(&args.model, config);
    // Planning never loads a model.
    let cache = ModelCache::new(OrtLoader::default());
    let pipeline = PipelineOrchestrator::new(
        &upscale,
        cache,
        ModelResolver::new(config.paths.models_dir.clone()),
    )?;
    let plans = pipeline.plan_all(args.height, args.width)?;
    let json = serde_json::to_string_pretty(&plans).context("failed to serialize plans")?;
    println!("{json}");
    Ok(())
}

async fn run_upscale(args: UpscaleArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let upscale = upscale_config(&args.model, config);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, &upscale));
    let models_dir = args
        .models_dir
        .clone()
        .unwrap_or_else(|| resolve_relative_to(data_dir, &config.paths.models_dir));
    let loader = OrtLoader {
        backend: args.backend.unwrap_or(config.inference.backend),
        trt_cache_dir: Some(resolve_relative_to(data_dir, &config.inference.trt_cache_dir)),
    };

    let pipeline =
        PipelineOrchestrator::new(&upscale, ModelCache::new(loader), ModelResolver::new(models_dir))?;

    info!("Loading image: {}", args.input.display());
    let decoded = image::open(&args.input)
        .with_context(|| format!("failed to decode image: {}", args.input.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    let input = TensorBuffer::from_rgb8(decoded.as_raw(), width, height)?;

    info!(
        width,
        height,
        arch = %upscale.architecture,
        style = %upscale.style,
        noise = %upscale.noise,
        scale = upscale.scale,
        stages = pipeline.stages().len(),
        "Starting upscale"
    );

    let start = Instant::now();
    let json = args.json;
    let result = pipeline
        .spawn(input)
        .collect(|event| {
            if json {
                print_event_json(&event);
            } else {
                print_event(&event, start);
            }
        })
        .await;
    if !json {
        eprintln!();
    }
    let result = result.context("upscale failed")?;

    let pixels = result.to_rgb8()?;
    let out_width = u32::try_from(result.width()).context("output width overflows u32")?;
    let out_height = u32::try_from(result.height()).context("output height overflows u32")?;
    let image = image::RgbImage::from_raw(out_width, out_height, pixels)
        .context("output buffer does not match image dimensions")?;
    image
        .save(&output)
        .with_context(|| format!("failed to write image: {}", output.display()))?;

    info!(
        output = %output.display(),
        width = out_width,
        height = out_height,
        elapsed = %format_duration(start.elapsed().as_secs_f64()),
        "Upscale completed"
    );
    Ok(())
}

fn print_event_json(event: &PipelineEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!(%error, "failed to serialize pipeline event"),
    }
}

fn print_event(event: &PipelineEvent, start: Instant) {
    match event {
        PipelineEvent::Status { message } => info!("{message}"),
        PipelineEvent::Progress {
            stage,
            stage_index,
            stage_count,
            ratio,
            eta_seconds,
            ..
        } => {
            let line = render_progress(
                stage,
                *stage_index,
                *stage_count,
                *ratio,
                start.elapsed().as_secs_f64(),
                *eta_seconds,
            );
            eprint!("\r{line}    ");
        }
        PipelineEvent::StageDone {
            stage,
            width,
            height,
            ..
        } => {
            eprintln!();
            info!(stage = %stage, width, height, "Stage finished");
        }
        PipelineEvent::FatalError { message } => {
            eprintln!();
            warn!("{message}");
        }
        PipelineEvent::TileResult { .. } => {}
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(
    stage: &str,
    stage_index: usize,
    stage_count: usize,
    ratio: f64,
    elapsed: f64,
    eta_seconds: Option<f64>,
) -> String {
    let fraction = ratio.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    let eta = eta_seconds
        .map(|secs| format!(" | ETA: {}", format_duration(secs)))
        .unwrap_or_default();

    format!(
        "[{}] {:5.1}% | Stage {}/{} {} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        stage_index + 1,
        stage_count,
        stage,
        format_duration(elapsed),
        eta,
    )
}

#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.4), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }
}

#[cfg(test)]
mod progress_tests {
    use super::*;

    #[test]
    fn half_done_bar_with_eta() {
        let line = render_progress("noise1_scale2x", 0, 2, 0.5, 10.0, Some(10.0));
        assert_eq!(
            line,
            format!(
                "[{}{}]  50.0% | Stage 1/2 noise1_scale2x | Elapsed: 00:00:10 | ETA: 00:00:10",
                "█".repeat(15),
                "░".repeat(15)
            )
        );
    }

    #[test]
    fn ratio_is_clamped_and_eta_optional() {
        let line = render_progress("scale2x", 1, 2, 1.5, 0.0, None);
        assert!(line.starts_with(&format!("[{}]", "█".repeat(PROGRESS_BAR_WIDTH))));
        assert!(line.contains("100.0%"));
        assert!(!line.contains("ETA"));
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn model_args(cli: Cli) -> ModelArgs {
        match cli.command {
            Commands::Upscale(args) => args.model,
            Commands::Plan(args) => args.model,
        }
    }

    #[test]
    fn upscale_defaults() {
        let cli = Cli::try_parse_from(["seamscale", "upscale", "in.png"]).unwrap();
        let model = model_args(cli);
        assert_eq!(model.architecture, Architecture::SwinUnet);
        assert_eq!(model.style, Style::Art);
        assert_eq!(model.noise, NoiseLevel::None);
        assert_eq!(model.scale, 2);
        assert_eq!(model.tile_size, None);
    }

    #[test]
    fn negative_noise_sentinel_parses() {
        let cli = Cli::try_parse_from([
            "seamscale", "plan", "--width", "10", "--height", "10", "--noise", "-1",
        ])
        .unwrap();
        assert_eq!(model_args(cli).noise, NoiseLevel::None);
    }

    #[test]
    fn rejects_unknown_architecture() {
        let result = Cli::try_parse_from(["seamscale", "upscale", "in.png", "--arch", "nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_config_file() {
        let mut config = AppConfig::default();
        config.tiling.tile_size = 112;
        config.tiling.memory_budget_mb = Some(8);
        config.tiling.blend_size = 24;

        let cli = Cli::try_parse_from([
            "seamscale", "upscale", "in.png", "--arch", "cunet", "--noise", "2",
        ])
        .unwrap();
        let upscale = upscale_config(&model_args(cli), &config);
        assert_eq!(upscale.architecture, Architecture::Cunet);
        assert_eq!(upscale.noise, NoiseLevel::Level(2));
        assert_eq!(upscale.tile_size, 112);
        assert_eq!(upscale.memory_budget, Some(8 * BYTES_PER_MB));
        assert_eq!(upscale.blend_size, 24);

        let cli = Cli::try_parse_from([
            "seamscale", "upscale", "in.png", "--tile-size", "256", "--memory-budget-mb", "1",
        ])
        .unwrap();
        let upscale = upscale_config(&model_args(cli), &config);
        assert_eq!(upscale.tile_size, 256);
        assert_eq!(upscale.memory_budget, Some(BYTES_PER_MB));
    }

    #[test]
    fn default_output_sits_next_to_input() {
        let config = UpscaleConfig {
            architecture: Architecture::Cunet,
            scale: 4,
            ..UpscaleConfig::default()
        };
        let out = default_output_path(Path::new("/pics/cat.jpg"), &config);
        assert_eq!(out, PathBuf::from("/pics/cat_cunet_4x.png"));
    }
}
