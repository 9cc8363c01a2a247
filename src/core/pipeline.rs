use crate::core::filters::Connectivity;
use crate::core::ndsm::{align_ground, compute_ndsm, Resampling};
use crate::core::point_match::{match_stems_to_treetops, process_unmatched_stems, MatchSource, PointMatch};
use crate::core::segment_match::match_stems_to_segments;
use crate::core::segmentation::{CrownSegmenter, SegmentationOutput, SegmentationParams, SubsetMode};
use crate::core::stats::{height_histogram, HeightSummary, HistogramBin, RunStats};
use crate::core::transform::{find_ground_lines, transform_stems};
use crate::core::treetops::{TreetopDetector, TreetopParams};
use crate::io::{self, Credentials, GeoTiff, WcsClient};
use crate::types::{
    CornerPoint, FieldStem, HeightRaster, LocalStem, MatchClass, MatchResult, PeakError, PeakResult, Pixel,
    ResultRow, Treetop,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run configuration; every field has a production default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // height raster preparation
    pub dsm_path: Option<PathBuf>,
    pub dtm_path: Option<PathBuf>,
    pub ndsm_path: Option<PathBuf>,
    /// Build the nDSM from `dsm_path` and `dtm_path` before processing
    pub compute_ndsm: bool,
    /// Only build the nDSM (and the aligned DTM); no field data is read
    pub ndsm_only: bool,
    /// Fetch the terrain model from the elevation service into `dtm_path`
    pub download_dtm: bool,
    pub buffer_m: f64,
    pub pixel_m: f64,
    pub resampling: Resampling,
    pub nodata: f64,
    pub wcs_user: Option<String>,
    #[serde(skip_serializing)]
    pub wcs_pass: Option<String>,
    pub wcs_timeout_secs: u64,

    // field records
    pub corners_csv: Option<PathBuf>,
    pub stems_csv: Option<PathBuf>,

    // treetop detector
    pub neighborhood_size: usize,
    pub min_height_threshold: f64,
    pub sigma: f64,

    // point matcher
    pub max_distance: f64,
    pub radius_unmatched: f64,

    // crown segmentation
    pub use_segmentation: bool,
    pub subset: SubsetMode,
    pub ground_threshold: f64,
    pub sigma_for_treetops: f64,
    pub sigma_for_segmentation: f64,
    pub min_distance: usize,
    pub threshold_abs: Option<f64>,
    pub exclude_border: bool,
    pub connectivity: Connectivity,
    pub compactness: f64,
    pub min_area_threshold: usize,

    // outputs
    pub histogram_bin_m: f64,
    pub output_csv: Option<PathBuf>,
    pub labels_tif: Option<PathBuf>,
    pub summary_json: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dsm_path: None,
            dtm_path: None,
            ndsm_path: None,
            compute_ndsm: false,
            ndsm_only: false,
            download_dtm: true,
            buffer_m: 2.0,
            pixel_m: 1.0,
            resampling: Resampling::Bilinear,
            nodata: -9999.0,
            wcs_user: None,
            wcs_pass: None,
            wcs_timeout_secs: 300,
            corners_csv: None,
            stems_csv: None,
            neighborhood_size: 100,
            min_height_threshold: 10.0,
            sigma: 2.0,
            max_distance: 2.0,
            radius_unmatched: 5.0,
            use_segmentation: true,
            subset: SubsetMode::default(),
            ground_threshold: 5.0,
            sigma_for_treetops: 10.0,
            sigma_for_segmentation: 1.0,
            min_distance: 5,
            threshold_abs: Some(5.0),
            exclude_border: true,
            connectivity: Connectivity::Four,
            compactness: 0.2,
            min_area_threshold: 1500,
            histogram_bin_m: 5.0,
            output_csv: None,
            labels_tif: None,
            summary_json: None,
        }
    }
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PeakResult<Self> {
        log::info!("Loading configuration from: {}", path.as_ref().display());
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    /// Reject parameter values no stage can work with.
    pub fn validate(&self) -> PeakResult<()> {
        let fail = |msg: &str| Err(PeakError::InvalidConfig(msg.to_string()));
        let non_negative = |v: f64| v >= 0.0;

        if self.neighborhood_size == 0 {
            return fail("neighborhood_size must be at least 1");
        }
        if !non_negative(self.sigma)
            || !non_negative(self.sigma_for_treetops)
            || !non_negative(self.sigma_for_segmentation)
        {
            return fail("smoothing sigmas must not be negative");
        }
        if !non_negative(self.max_distance) || !non_negative(self.radius_unmatched) {
            return fail("match distances must not be negative");
        }
        if !non_negative(self.compactness) {
            return fail("compactness must not be negative");
        }
        if !(self.pixel_m > 0.0) || !non_negative(self.buffer_m) {
            return fail("pixel_m must be positive and buffer_m non-negative");
        }
        if !(self.histogram_bin_m > 0.0) {
            return fail("histogram_bin_m must be positive");
        }
        if self.wcs_timeout_secs == 0 {
            return fail("wcs_timeout_secs must be positive");
        }
        match self.subset {
            SubsetMode::Center { size_m } if !(size_m > 0.0) => {
                return fail("subset size_m must be positive");
            }
            SubsetMode::FieldExtent { buffer_m } if !non_negative(buffer_m) => {
                return fail("subset buffer_m must not be negative");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn treetop_params(&self) -> TreetopParams {
        TreetopParams {
            sigma: self.sigma,
            neighborhood_size: self.neighborhood_size,
            min_height: self.min_height_threshold,
        }
    }

    pub fn segmentation_params(&self) -> SegmentationParams {
        SegmentationParams {
            ground_threshold: self.ground_threshold,
            sigma_for_treetops: self.sigma_for_treetops,
            sigma_for_segmentation: self.sigma_for_segmentation,
            min_distance: self.min_distance,
            threshold_abs: self.threshold_abs,
            exclude_border: self.exclude_border,
            connectivity: self.connectivity,
            compactness: self.compactness,
            min_area_threshold: self.min_area_threshold,
        }
    }
}

/// Serializable part of a run result
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stats: RunStats,
    pub height_summary: Option<HeightSummary>,
    pub histogram: Vec<HistogramBin>,
}

/// Everything a single run produces
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Consolidated table, sorted by (plot, stem id)
    pub rows: Vec<ResultRow>,
    pub stats: RunStats,
    /// Heights of crowns matched one-to-one
    pub height_summary: Option<HeightSummary>,
    pub histogram: Vec<HistogramBin>,
    pub stems: Vec<FieldStem>,
    pub treetops: Vec<Treetop>,
    pub point_matches: Vec<PointMatch>,
    pub segmentation: Option<SegmentationOutput>,
    /// Apexes on background cells
    pub unmatched_peaks: Vec<Pixel>,
}

impl RunResult {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            stats: self.stats.clone(),
            height_summary: self.height_summary,
            histogram: self.histogram.clone(),
        }
    }
}

/// Full-run orchestrator
pub struct Pipeline {
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> PeakResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// In-memory run over an nDSM and field records; no files are touched.
    pub fn process(
        &self,
        raster: &HeightRaster,
        corners: &[CornerPoint],
        local_stems: &[LocalStem],
    ) -> PeakResult<RunResult> {
        let cfg = &self.config;

        log::info!("Step 1: detecting treetops");
        let treetops = TreetopDetector::with_params(cfg.treetop_params()).detect_treetops(raster)?;

        log::info!("Step 2: ground lines and stem coordinates");
        let ground_lines = find_ground_lines(corners);
        let stems = transform_stems(local_stems, &ground_lines);

        log::info!("Step 3: point matching stems to treetops");
        let point_matches = match_stems_to_treetops(&stems, &treetops, cfg.max_distance)?;
        let point_matches = process_unmatched_stems(point_matches, &treetops, cfg.radius_unmatched);

        let (segment_results, segmentation, unmatched_peaks) = if cfg.use_segmentation {
            log::info!("Step 4: crown segmentation");
            let points: Vec<(f64, f64)> = corners
                .iter()
                .map(|c| (c.x, c.y))
                .chain(stems.iter().map(|s| (s.x, s.y)))
                .collect();
            let window = cfg.subset.window(raster, &points);
            let seg = CrownSegmenter::with_params(cfg.segmentation_params()).segment_window(raster, window)?;

            log::info!("Step 5: matching stems within crowns");
            let matched = match_stems_to_segments(&seg.labels, &seg.peaks, &stems, &seg.raster)?;
            (matched.results, Some(seg), matched.unmatched_peaks)
        } else {
            log::info!("Segmentation disabled, stems carry no crown height");
            let results = stems
                .iter()
                .map(|s| MatchResult::unmatched(*s, MatchClass::NoRegion))
                .collect();
            (results, None, Vec::new())
        };

        log::info!("Step 6: merging point heights into the result table");
        let pixel_heights: HashMap<(i64, i64), f64> = point_matches
            .iter()
            .filter_map(|m| Some((m.stem.key(), m.height()?)))
            .collect();
        let mut rows: Vec<ResultRow> = segment_results
            .iter()
            .map(|r| ResultRow::merge(r, pixel_heights.get(&r.stem.key()).copied()))
            .collect();
        rows.sort_by_key(|r| (r.plot, r.id));

        let point_matched = point_matches.iter().filter(|m| m.is_matched()).count();
        let count_class = |class: MatchClass| rows.iter().filter(|r| r.class == class).count();
        let stats = RunStats {
            stems_total: stems.len(),
            treetops_total: treetops.len(),
            point_matched,
            point_unmatched: point_matches.len() - point_matched,
            point_rescued: point_matches
                .iter()
                .filter(|m| m.source == Some(MatchSource::Rescue))
                .count(),
            segment_matched: count_class(MatchClass::Matched),
            segment_unmatched: count_class(MatchClass::Unmatched),
            segment_no_region: count_class(MatchClass::NoRegion),
            segments: segmentation.as_ref().map_or(0, |s| s.segment_count),
            peaks: segmentation.as_ref().map_or(0, |s| s.peaks.len()),
        };
        stats.log_summary();

        let matched_heights: Vec<f64> = rows
            .iter()
            .filter(|r| r.class == MatchClass::Matched)
            .filter_map(|r| r.height_segment)
            .collect();

        Ok(RunResult {
            rows,
            stats,
            height_summary: HeightSummary::from_heights(&matched_heights),
            histogram: height_histogram(&matched_heights, cfg.histogram_bin_m),
            stems,
            treetops,
            point_matches,
            segmentation,
            unmatched_peaks,
        })
    }

    /// Build the nDSM from the surface model and a local or downloaded terrain model.
    ///
    /// The terrain model resampled onto the surface grid is written next to
    /// `dtm_path` (see [`aligned_dtm_path`]), the nDSM to `ndsm_path`.
    pub fn prepare_height_raster(&self) -> PeakResult<HeightRaster> {
        let cfg = &self.config;
        let (Some(dsm_path), Some(dtm_path), Some(ndsm_path)) = (&cfg.dsm_path, &cfg.dtm_path, &cfg.ndsm_path) else {
            return Err(PeakError::InvalidConfig(
                "building the nDSM needs dsm_path, dtm_path and ndsm_path".to_string(),
            ));
        };

        let dsm = GeoTiff::read(dsm_path)?;

        if cfg.download_dtm {
            let credentials = Credentials::resolve(cfg.wcs_user.as_deref(), cfg.wcs_pass.as_deref())?;
            let bounds = io::wcs::service_bounds(&dsm, cfg.buffer_m)?;
            WcsClient::new(credentials)
                .with_timeout(Duration::from_secs(cfg.wcs_timeout_secs))
                .with_pixel_size(cfg.pixel_m)
                .download(bounds, dtm_path)?;
        }

        let dtm = GeoTiff::read(dtm_path)?;
        let aligned = align_ground(&dsm, &dtm, cfg.resampling, cfg.nodata)?;
        let ndsm = compute_ndsm(&dsm, &aligned, cfg.nodata)?;

        GeoTiff::write_heights(&aligned, aligned_dtm_path(dtm_path))?;
        GeoTiff::write_heights(&ndsm, ndsm_path)?;
        Ok(ndsm)
    }

    /// nDSM-only run: aligned DTM and nDSM are written, nothing else is read.
    pub fn run_ndsm_only(&self) -> PeakResult<HeightRaster> {
        log::info!("Building the nDSM only");
        let ndsm = self.prepare_height_raster()?;
        let valid = ndsm.data.iter().filter(|&&v| !ndsm.is_nodata(v)).count();
        log::info!("nDSM ready: {:?} cells, {} with a height", ndsm.shape(), valid);
        Ok(ndsm)
    }

    /// File-based run: prepare or load the nDSM, read field CSVs, process, write outputs.
    ///
    /// Outputs are staged next to their targets and moved into place only
    /// once all of them were written.
    pub fn run(&self) -> PeakResult<RunResult> {
        let cfg = &self.config;

        log::info!("Step 0: preparing the height raster");
        let raster = if cfg.compute_ndsm {
            self.prepare_height_raster()?
        } else {
            let path = cfg
                .ndsm_path
                .as_ref()
                .ok_or_else(|| PeakError::InvalidConfig("ndsm_path is required".to_string()))?;
            GeoTiff::read(path)?
        };

        let corners = match &cfg.corners_csv {
            Some(path) => io::read_corners_file(path)?,
            None => return Err(PeakError::InvalidConfig("corners_csv is required".to_string())),
        };
        let local_stems = match &cfg.stems_csv {
            Some(path) => io::read_stems_file(path)?,
            None => return Err(PeakError::InvalidConfig("stems_csv is required".to_string())),
        };

        let result = self.process(&raster, &corners, &local_stems)?;

        let mut staged = StagedOutputs::default();
        match self.write_outputs(&result, &mut staged) {
            Ok(()) => staged.commit()?,
            Err(e) => {
                staged.discard();
                return Err(e);
            }
        }

        Ok(result)
    }

    fn write_outputs(&self, result: &RunResult, staged: &mut StagedOutputs) -> PeakResult<()> {
        let cfg = &self.config;
        if let Some(path) = &cfg.output_csv {
            io::write_results_file(&result.rows, staged.stage(path))?;
        }
        if let (Some(path), Some(seg)) = (&cfg.labels_tif, &result.segmentation) {
            GeoTiff::write_labels(&seg.labels, &seg.raster.transform, &seg.raster.crs, staged.stage(path))?;
        }
        if let Some(path) = &cfg.summary_json {
            io::write_json_file(&result.summary(), staged.stage(path))?;
        }
        Ok(())
    }
}

/// `<dtm stem>_aligned_to_DSM.tif` in the directory of the terrain model.
pub fn aligned_dtm_path(dtm_path: &Path) -> PathBuf {
    let stem = dtm_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dtm".to_string());
    dtm_path.with_file_name(format!("{}_aligned_to_DSM.tif", stem))
}

/// Output files written under a temporary name, renamed together at the end
#[derive(Default)]
struct StagedOutputs {
    files: Vec<(PathBuf, PathBuf)>,
}

impl StagedOutputs {
    /// Temporary sibling of `target` (`results.csv` -> `results.partial.csv`).
    fn stage(&mut self, target: &Path) -> PathBuf {
        let stem = target
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match target.extension() {
            Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
            None => format!("{}.partial", stem),
        };
        let temp = target.with_file_name(name);
        self.files.push((temp.clone(), target.to_path_buf()));
        temp
    }

    fn commit(self) -> PeakResult<()> {
        for (temp, target) in &self.files {
            std::fs::rename(temp, target)?;
            log::info!("Wrote {}", target.display());
        }
        Ok(())
    }

    fn discard(self) {
        for (temp, _) in &self.files {
            if temp.exists() {
                if let Err(e) = std::fs::remove_file(temp) {
                    log::warn!("Could not remove {}: {}", temp.display(), e);
                }
            }
        }
    }
}
