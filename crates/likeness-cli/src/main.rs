use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use likeness_core::classifier::{Metric, StrategyKind, Threshold};
use likeness_core::realtime::{CancelToken, RealtimeLoop};
use likeness_core::{build_gallery, Dataset, Gallery};
use likeness_hw::Camera;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;
mod sinks;
mod sources;

use config::{Config, ExtractorKind};

#[derive(Parser)]
#[command(name = "likeness", about = "Closed-set face identification")]
struct Cli {
    /// TOML configuration file (default: $LIKENESS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over the file and the environment.
#[derive(Args)]
struct Overrides {
    #[arg(long, global = true)]
    extractor: Option<ExtractorKind>,
    #[arg(long, global = true)]
    strategy: Option<StrategyKind>,
    #[arg(long, global = true)]
    metric: Option<Metric>,
    #[arg(long, global = true)]
    k: Option<usize>,
    /// Accept distances up to this value
    #[arg(long, global = true, conflicts_with = "min_similarity")]
    max_distance: Option<f32>,
    /// Accept similarities from this value
    #[arg(long, global = true)]
    min_similarity: Option<f32>,
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Gallery artifact to write (train) or read
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.extractor {
            config.extractor = v;
        }
        if let Some(v) = self.strategy {
            config.classifier_strategy = v;
        }
        if let Some(v) = self.metric {
            config.distance_metric = Some(v);
        }
        if let Some(v) = self.k {
            config.k = v;
        }
        if let Some(v) = self.max_distance {
            config.accept_threshold = Some(Threshold::MaxDistance(v));
        }
        if let Some(v) = self.min_similarity {
            config.accept_threshold = Some(Threshold::MinSimilarity(v));
        }
        if let Some(v) = self.model_dir {
            config.model_dir = v;
        }
        if let Some(v) = self.gallery {
            config.gallery_path = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a gallery from a directory of per-identity image folders
    Train {
        /// Dataset root: one subdirectory per identity
        dataset: PathBuf,
        /// Use at most this many images per identity
        #[arg(long)]
        max_per_identity: Option<usize>,
    },
    /// Identify the face in each still image
    Identify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Run the realtime loop on a camera or a sequence of images
    Run {
        /// Camera index, /dev/videoN, image file or directory
        #[arg(long)]
        source: Option<String>,
        /// Write annotated frames here as PNG
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,
    },
    /// Summarize a gallery artifact
    Inspect,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Train {
            dataset,
            max_per_identity,
        } => {
            if max_per_identity.is_some() {
                config.max_per_identity = max_per_identity;
            }
            train(config, dataset).await
        }
        Commands::Identify { images } => identify(config, images).await,
        Commands::Run {
            source,
            output_dir,
            max_frames,
        } => {
            if let Some(source) = source {
                config.video_source = source;
            }
            run(config, output_dir, max_frames).await
        }
        Commands::Inspect => inspect(&config),
        Commands::Devices => {
            for device in Camera::list_devices() {
                println!("{}\t{}\t{} ({})", device.path, device.name, device.driver, device.bus);
            }
            Ok(())
        }
    }
}

async fn train(config: Config, dataset_root: PathBuf) -> Result<()> {
    config.validate()?;
    tracing::info!(dataset = %dataset_root.display(), extractor = ?config.extractor, "training");

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let dataset = Dataset::from_dir(&dataset_root, config.max_per_identity)
            .with_context(|| format!("scanning dataset {}", dataset_root.display()))?;
        let mut extractor = runtime::build_extractor(&config, true)?;
        let report = build_gallery(&mut extractor, &dataset)?;
        report.gallery.save(&config.gallery_path)?;
        Ok((report, config.gallery_path))
    })
    .await??;

    let (report, path) = report;
    println!(
        "{}",
        json!({
            "gallery": path,
            "extractor": report.gallery.extractor(),
            "identities": report.gallery.len(),
            "enrolled_samples": report.enrolled_samples,
            "absent_samples": report.absent_samples,
            "failed_samples": report.failed_samples,
            "excluded": report.excluded,
        })
    );
    Ok(())
}

async fn identify(config: Config, images: Vec<PathBuf>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut engine = runtime::build_engine(&config)?;
        for path in images {
            let line = match image::open(&path) {
                Ok(image) => match engine.identify(&image) {
                    Ok(found) => json!({ "path": path, "face": found }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "identification failed");
                        json!({ "path": path, "error": e.to_string() })
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable image");
                    json!({ "path": path, "error": e.to_string() })
                }
            };
            println!("{line}");
        }
        engine.shutdown();
        Ok(())
    })
    .await?
}

async fn run(config: Config, output_dir: Option<PathBuf>, max_frames: Option<u64>) -> Result<()> {
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current frame");
            on_signal.cancel();
        }
    });

    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut engine = runtime::build_engine(&config)?;
        let source = sources::open_source(&config.video_source, config.capture_width, config.capture_height)?;
        let mut sink = sinks::ReportSink::new(std::io::stdout(), output_dir, max_frames)?;
        let result = RealtimeLoop::new(&mut engine, cancel).run(source, &mut sink);
        engine.shutdown();
        Ok(result?)
    })
    .await??;

    eprintln!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn inspect(config: &Config) -> Result<()> {
    let gallery = Gallery::load(&config.gallery_path)
        .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?;
    let identities: Vec<_> = gallery
        .entries()
        .iter()
        .map(|e| json!({ "identity": e.identity(), "descriptors": e.descriptors().len() }))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "path": config.gallery_path,
            "extractor": gallery.extractor(),
            "dimension": gallery.dimension(),
            "created_at": gallery.created_at(),
            "identities": identities,
        }))?
    );
    Ok(())
}
