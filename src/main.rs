use anyhow::{Context, Result};
use clap::Parser;
use peakfinder::core::{Connectivity, Pipeline, RunConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "peakfinder",
    version,
    about = "Tree crown segmentation and field-stem matching on UAV height rasters"
)]
struct Cli {
    /// JSON run configuration (fields not given keep their defaults)
    #[arg(long, short, value_name = "config.json")]
    config: Option<PathBuf>,

    /// Normalized height raster (nDSM)
    #[arg(long, value_name = "nDSM.tif")]
    ndsm: Option<PathBuf>,

    /// Surface model; with --dtm builds the nDSM first
    #[arg(long, value_name = "DSM.tif")]
    dsm: Option<PathBuf>,

    /// Terrain model (downloaded here unless --local-dtm)
    #[arg(long, value_name = "DTM.tif")]
    dtm: Option<PathBuf>,

    /// Use the terrain model on disk instead of downloading it
    #[arg(long)]
    local_dtm: bool,

    /// Only build the aligned terrain model and the nDSM
    #[arg(long)]
    ndsm_only: bool,

    /// Corner points CSV (plot,id,x,y)
    #[arg(long, value_name = "corners.csv")]
    corners: Option<PathBuf>,

    /// Stem CSV (plot,id,x,y,z) in plot-local coordinates
    #[arg(long, value_name = "stems.csv")]
    stems: Option<PathBuf>,

    /// Maximum stem-treetop distance for the assignment (m)
    #[arg(long)]
    max_distance: Option<f64>,

    /// Rescue radius for unmatched stems (m)
    #[arg(long)]
    radius: Option<f64>,

    /// Minimum crown area (pixels)
    #[arg(long)]
    min_area: Option<usize>,

    /// Use 8-connected crown growth
    #[arg(long)]
    eight_connected: bool,

    /// Skip crown segmentation
    #[arg(long)]
    no_segmentation: bool,

    /// Result table CSV
    #[arg(long, short, value_name = "results.csv")]
    output: Option<PathBuf>,

    /// Crown label GeoTIFF
    #[arg(long, value_name = "labels.tif")]
    labels: Option<PathBuf>,

    /// Run summary JSON
    #[arg(long, value_name = "summary.json")]
    summary: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("failed to load configuration {}", path.display()))?,
            None => RunConfig::default(),
        };

        if self.ndsm.is_some() {
            cfg.ndsm_path = self.ndsm;
        }
        if self.dsm.is_some() && self.dtm.is_some() {
            cfg.compute_ndsm = true;
        }
        if self.dsm.is_some() {
            cfg.dsm_path = self.dsm;
        }
        if self.dtm.is_some() {
            cfg.dtm_path = self.dtm;
        }
        if self.local_dtm {
            cfg.download_dtm = false;
        }
        if self.ndsm_only {
            cfg.ndsm_only = true;
        }
        if self.corners.is_some() {
            cfg.corners_csv = self.corners;
        }
        if self.stems.is_some() {
            cfg.stems_csv = self.stems;
        }
        if let Some(d) = self.max_distance {
            cfg.max_distance = d;
        }
        if let Some(r) = self.radius {
            cfg.radius_unmatched = r;
        }
        if let Some(a) = self.min_area {
            cfg.min_area_threshold = a;
        }
        if self.eight_connected {
            cfg.connectivity = Connectivity::Eight;
        }
        if self.no_segmentation {
            cfg.use_segmentation = false;
        }
        if self.output.is_some() {
            cfg.output_csv = self.output;
        }
        if self.labels.is_some() {
            cfg.labels_tif = self.labels;
        }
        if self.summary.is_some() {
            cfg.summary_json = self.summary;
        }
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Cli::parse().into_config()?;
    log::debug!("Treetop parameters: {:?}", cfg.treetop_params());
    log::debug!("Segmentation parameters: {:?}", cfg.segmentation_params());

    let ndsm_only = cfg.ndsm_only;
    let pipeline = Pipeline::new(cfg).context("invalid run configuration")?;
    if ndsm_only {
        pipeline.run_ndsm_only().context("nDSM preparation failed")?;
        return Ok(());
    }
    let result = pipeline.run().context("pipeline run failed")?;

    if let Some(h) = result.height_summary {
        log::info!(
            "Matched crown heights: n={} mean={:.2} median={:.2} min={:.2} max={:.2} std={:.2}",
            h.count,
            h.mean,
            h.median,
            h.min,
            h.max,
            h.std
        );
    }
    for bin in &result.histogram {
        log::info!("  {:>5.1}-{:<5.1} m: {}", bin.lower, bin.upper, bin.count);
    }
    Ok(())
}
