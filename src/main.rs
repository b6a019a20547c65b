use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use satscout::config::{load_config, DataConfig, ImageryConfig, ModelConfig};
use satscout::pipeline::{load_boundaries, Pipeline, RunParams};

/// Run the tile inference pipeline over every boundary in a GeoJSON file.
#[derive(Parser, Debug)]
#[command(name = "satscout", version, about)]
struct Cli {
    /// ISO 3166-1 alpha-3 country code, e.g. THA.
    #[arg(long = "iso")]
    iso_code: String,

    /// Boundary GeoJSON file (EPSG:4326); one run per polygon feature.
    #[arg(long)]
    boundary: PathBuf,

    /// Data configuration file (raster locations).
    #[arg(long)]
    data_config: PathBuf,

    /// Model configuration file (checkpoint, classes, image size).
    #[arg(long)]
    model_config: PathBuf,

    /// Imagery configuration file (tile pixel grid, image extension).
    #[arg(long)]
    imagery_config: PathBuf,

    /// Output root directory.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Only process the boundary with this shapeName.
    #[arg(long = "shapename")]
    shape_name: Option<String>,

    /// Grid step between tile sample points, meters.
    #[arg(long, default_value_t = 150.0)]
    spacing: f64,

    /// Tile half-side, meters.
    #[arg(long, default_value_t = 150.0)]
    buffer_size: f64,

    /// Detection half-side, meters.
    #[arg(long, default_value_t = 50.0)]
    cam_buffer_size: f64,

    /// Positive-class probability threshold.
    #[arg(long, default_value_t = 0.5)]
    threshold: f64,

    /// Minimum building pixel sum for a tile to be classified.
    #[arg(long, default_value_t = 5)]
    sum_threshold: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let data: DataConfig = load_config(&cli.data_config)?;
    let model: ModelConfig = load_config(&cli.model_config)?;
    let imagery: ImageryConfig = load_config(&cli.imagery_config)?;

    let params = RunParams {
        spacing: cli.spacing,
        buffer_size: cli.buffer_size,
        cam_buffer_size: cli.cam_buffer_size,
        threshold: cli.threshold,
        sum_threshold: cli.sum_threshold,
    };
    let pipeline = Pipeline::new(
        data,
        model,
        imagery,
        cli.iso_code.clone(),
        cli.output_dir,
        params,
    )?;

    let mut boundaries = load_boundaries(&cli.boundary)?;
    if let Some(wanted) = &cli.shape_name {
        boundaries.retain(|(name, _)| name == wanted);
        if boundaries.is_empty() {
            anyhow::bail!("no boundary named {wanted} in {}", cli.boundary.display());
        }
    }
    info!(
        iso = %cli.iso_code,
        boundaries = boundaries.len(),
        "starting run"
    );

    let mut total = 0usize;
    for (shape_name, polygon) in &boundaries {
        let detections = pipeline.run_shape(polygon, shape_name)?;
        total += detections.len();
    }
    info!(detections = total, "run complete");
    Ok(())
}
