use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use scout_buffer::prepare::{prepare_from_manifest, FrameFilter, PrepareConfig};
use scout_buffer::{doctor as buffer_doctor, CaptureBuffer};
use scout_ingest::log::ResultLog;
use scout_ingest::pipeline::{DepthSettings, StereoConfig};
use scout_ingest::storage::Storage;
use scout_ingest::{AppState, ServerConfig};
use scout_relay::{doctor as relay_doctor, HttpTransport, RelayConfig, RelayWorker, TokioClock};
use scout_stereo::{colormap, compute_disparity, open_image, DisparityMap, Intrinsics};
use scout_vision::{doctor as vision_doctor, InferenceEngine, ModelConfig, VisionConfig};

#[derive(Debug, Parser)]
#[command(name = "roadscout", version, about = "RoadScout - stereo capture relay and obstacle detection")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Buffer the frames listed in the GPS manifest.
    Prepare,
    /// Drain the buffer to the ingest endpoint.
    Relay {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the ingest endpoint.
    Serve,
    /// Disparity and depth previews for one stereo pair.
    Depth {
        left: PathBuf,
        right: Option<PathBuf>,
        /// Use a 16-bit disparity PNG instead of matching the pair.
        #[arg(long)]
        disparity: Option<PathBuf>,
        #[arg(long, default_value = "outputs")]
        out_dir: PathBuf,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    buffer: BufferCfg,
    prepare: Option<PrepareConfig>,
    relay: Option<RelayConfig>,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    camera: CameraCfg,
    #[serde(default)]
    stereo: StereoConfig,
    #[serde(default)]
    vision: VisionConfig,
    #[serde(default)]
    models: Vec<ModelConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct BufferCfg {
    dir: PathBuf,
}

impl Default for BufferCfg {
    fn default() -> Self {
        Self { dir: PathBuf::from("temp_buffer") }
    }
}

/// Explicit values override the built-in calibration; `camera_json` overrides both.
#[derive(Debug, Default, serde::Deserialize)]
struct CameraCfg {
    fx: Option<f64>,
    fy: Option<f64>,
    baseline: Option<f64>,
    camera_json: Option<PathBuf>,
}

impl CameraCfg {
    fn intrinsics(&self) -> Result<Intrinsics> {
        if let Some(path) = &self.camera_json {
            return Intrinsics::from_camera_json(path).context("camera.camera_json");
        }
        let d = Intrinsics::default();
        let k = Intrinsics {
            fx: self.fx.unwrap_or(d.fx),
            fy: self.fy.unwrap_or(d.fy),
            baseline: self.baseline.unwrap_or(d.baseline),
        };
        k.validate().context("[camera]")?;
        Ok(k)
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Prepare => prepare(&cfg)?,
        Command::Relay { once } => relay(&cfg, once).await?,
        Command::Serve => serve(&cfg).await?,
        Command::Depth { left, right, disparity, out_dir } => depth(&cfg, &left, right.as_deref(), disparity.as_deref(), &out_dir)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    buffer_doctor::check_buffer_dir(&cfg.buffer.dir)?;
    if let Some(p) = &cfg.prepare {
        buffer_doctor::check_layout(p).or_else(|e| {
            warn!("prepare inputs not ready: {:#}", e);
            Ok::<(), anyhow::Error>(())
        })?;
    }
    if let Some(r) = &cfg.relay {
        relay_doctor::check_relay(r)?;
    }

    let k = cfg.camera.intrinsics()?;
    info!("doctor: camera fx={} fy={} baseline={}m", k.fx, k.fy, k.baseline);
    cfg.stereo.sgbm.validate().context("[stereo.sgbm]")?;

    let present = vision_doctor::check_models(&cfg.models, &cfg.vision)?;
    scout_vision::loader_for(&cfg.vision)?;
    info!("doctor: {}/{} model weights present", present, cfg.models.len());

    info!("doctor: OK");
    Ok(())
}

fn prepare(cfg: &Config) -> Result<()> {
    let pc = cfg.prepare.as_ref().context("no [prepare] config section")?;
    let buffer = CaptureBuffer::open(&cfg.buffer.dir)
        .with_context(|| format!("open buffer {}", cfg.buffer.dir.display()))?;
    buffer.sweep_staging()?;

    let report = prepare_from_manifest(&buffer, pc, &FrameFilter::from_config(pc))?;
    println!(
        "buffered={} filtered={} already_buffered={} missing={} malformed_rows={}",
        report.buffered.len(),
        report.filtered,
        report.already_buffered,
        report.missing.len(),
        report.malformed_rows
    );
    Ok(())
}

async fn relay(cfg: &Config, once: bool) -> Result<()> {
    let rc = cfg.relay.as_ref().context("no [relay] config section")?;
    relay_doctor::check_relay(rc)?;
    let buffer = CaptureBuffer::open(&cfg.buffer.dir)
        .with_context(|| format!("open buffer {}", cfg.buffer.dir.display()))?;
    let transport = HttpTransport::new(rc)?;
    let mut worker = RelayWorker::new(buffer, transport, TokioClock, rc.interval(), rc.max_in_flight);

    if once {
        let r = worker.run_cycle().await;
        let h = worker.link_health();
        println!(
            "pending={} delivered={} retained={} unreadable={} rtt_ms={:?} quality={}%",
            r.pending,
            r.delivered.len(),
            r.retained.len(),
            r.unreadable.len(),
            h.rtt_ms,
            h.quality
        );
        anyhow::ensure!(!r.list_failed, "could not list {}", cfg.buffer.dir.display());
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal("relay").await;
        info!("relay: finishing current cycle");
        let _ = tx.send(true);
    });
    worker.run(rx).await;
    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    info!("serve: starting");
    cfg.stereo.sgbm.validate().context("[stereo.sgbm]")?;
    let intrinsics = cfg.camera.intrinsics()?;

    let storage = Storage::open(&cfg.server.storage_root)
        .with_context(|| format!("open storage {}", cfg.server.storage_root.display()))?;
    let loader = scout_vision::loader_for(&cfg.vision)?;
    let engine = InferenceEngine::load(&cfg.models, loader.as_ref(), storage.predicted_dir(), cfg.vision.cross_model_nms_iou)?;
    info!("serve: {} model(s) active: {:?}", engine.model_names().len(), engine.model_names());
    let log = ResultLog::open(&cfg.server.log_file)?;

    let depth = DepthSettings {
        intrinsics,
        stereo: cfg.stereo.clone(),
        save_preview: cfg.server.save_depth_preview,
    };
    let state = AppState::new(storage, log, Arc::new(engine), depth).with_upload_slots(cfg.server.max_concurrent_uploads);
    scout_ingest::serve(&cfg.server, state, shutdown_signal("serve")).await
}

/// Resolves on ctrl-c. Without a handler it never resolves, so the caller
/// keeps running until killed.
async fn shutdown_signal(component: &'static str) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("{}: shutdown requested", component),
        Err(e) => {
            warn!("{}: no ctrl-c handler ({}), run until killed", component, e);
            std::future::pending::<()>().await;
        }
    }
}

fn depth(cfg: &Config, left: &Path, right: Option<&Path>, disparity: Option<&Path>, out_dir: &Path) -> Result<()> {
    let k = cfg.camera.intrinsics()?;
    let disp = match (disparity, right) {
        (Some(png), _) => DisparityMap::from_png16(png)?,
        (None, Some(right)) => compute_disparity(&open_image(left)?, &open_image(right)?, &cfg.stereo.sgbm)?,
        (None, None) => anyhow::bail!("need a right image or --disparity"),
    };
    let depth = k.depth(&disp, cfg.stereo.mask_invalid_depth);

    std::fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let stem = left.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
    let disp_path = out_dir.join(format!("disparity_{}.png", stem));
    let depth_path = out_dir.join(format!("depth_{}.png", stem));
    colormap::disparity_preview(&disp).save(&disp_path).with_context(|| format!("write {}", disp_path.display()))?;
    colormap::depth_preview(&depth).save(&depth_path).with_context(|| format!("write {}", depth_path.display()))?;

    println!("valid disparity: {:.1}%", disp.valid_fraction() * 100.0);
    println!("{}", disp_path.display());
    println!("{}", depth_path.display());
    Ok(())
}
