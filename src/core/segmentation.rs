//! Marker-controlled crown segmentation.
//!
//! The height surface is cleaned against a ground threshold, smoothed twice
//! (once for apex detection, once for the flooding surface), and flooded from
//! the detected apexes over its Sobel gradient. Small crowns are dropped and
//! the survivors relabelled to a dense `1..=N` id range.

use crate::core::filters::{gaussian_smooth, maximum_filter, sobel, Connectivity};
use crate::types::{HeightRaster, LabelGrid, PeakError, PeakResult, Pixel, PixelWindow};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Crown segmentation parameters
#[derive(Debug, Clone)]
pub struct SegmentationParams {
    /// Cells at or below this height are treated as ground
    pub ground_threshold: f64,
    /// Smoothing (pixels) of the surface used for apex detection
    pub sigma_for_treetops: f64,
    /// Smoothing (pixels) of the surface used for flooding
    pub sigma_for_segmentation: f64,
    /// Minimum apex separation in pixels
    pub min_distance: usize,
    /// Apexes must be strictly above this height; `None` uses the ground threshold
    pub threshold_abs: Option<f64>,
    /// Reject apexes closer than `min_distance` to the raster edge
    pub exclude_border: bool,
    pub connectivity: Connectivity,
    /// Weight of the distance-to-seed term in the flooding priority
    pub compactness: f64,
    /// Crowns with fewer pixels are reset to background
    pub min_area_threshold: usize,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            ground_threshold: 5.0,
            sigma_for_treetops: 10.0,
            sigma_for_segmentation: 1.0,
            min_distance: 5,
            threshold_abs: Some(5.0),
            exclude_border: true,
            connectivity: Connectivity::Four,
            compactness: 0.2,
            min_area_threshold: 1500,
        }
    }
}

/// Spatial subset of the height raster handed to the segmentation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SubsetMode {
    /// Whole raster
    Full,
    /// Square window of `size_m` metres centred on the raster
    Center { size_m: f64 },
    /// Bounding box of the field points, grown by `buffer_m` metres
    FieldExtent { buffer_m: f64 },
}

impl Default for SubsetMode {
    fn default() -> Self {
        SubsetMode::Center { size_m: 200.0 }
    }
}

impl SubsetMode {
    /// Pixel window of `raster` selected by this mode.
    ///
    /// `points` are the projected field coordinates (only used by `FieldExtent`).
    pub fn window(&self, raster: &HeightRaster, points: &[(f64, f64)]) -> PixelWindow {
        let shape = raster.shape();
        let full = PixelWindow::full(shape);
        match *self {
            SubsetMode::Full => full,
            SubsetMode::Center { size_m } => {
                let (px, py) = raster.transform.pixel_size();
                let w = ((size_m / px).round() as isize).max(1);
                let h = ((size_m / py).round() as isize).max(1);
                let start_col = (shape.1 as isize / 2 - w / 2).max(0);
                let start_row = (shape.0 as isize / 2 - h / 2).max(0);
                PixelWindow::clipped(start_row, start_col, h, w, shape).unwrap_or(full)
            }
            SubsetMode::FieldExtent { buffer_m } => {
                if points.is_empty() {
                    log::warn!("No field points for the segmentation extent, using the full raster");
                    return full;
                }
                let mut b = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
                for &(x, y) in points {
                    b.0 = b.0.min(x);
                    b.1 = b.1.min(y);
                    b.2 = b.2.max(x);
                    b.3 = b.3.max(y);
                }
                let corners = [
                    (b.0 - buffer_m, b.1 - buffer_m),
                    (b.0 - buffer_m, b.3 + buffer_m),
                    (b.2 + buffer_m, b.1 - buffer_m),
                    (b.2 + buffer_m, b.3 + buffer_m),
                ];
                let mut rows = (f64::INFINITY, f64::NEG_INFINITY);
                let mut cols = (f64::INFINITY, f64::NEG_INFINITY);
                for (x, y) in corners {
                    let Some((r, c)) = raster.transform.invert(x, y) else {
                        return full;
                    };
                    rows = (rows.0.min(r), rows.1.max(r));
                    cols = (cols.0.min(c), cols.1.max(c));
                }
                let row_off = rows.0.round() as isize;
                let col_off = cols.0.round() as isize;
                let n_rows = (rows.1 - rows.0).round() as isize;
                let n_cols = (cols.1 - cols.0).round() as isize;
                PixelWindow::clipped(row_off, col_off, n_rows, n_cols, shape).unwrap_or_else(|| {
                    log::warn!("Field extent does not overlap the raster, using the full raster");
                    full
                })
            }
        }
    }
}

/// Segmentation result for one (possibly cropped) raster
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Dense crown ids, 0 = background
    pub labels: LabelGrid,
    /// Apex pixels used as markers, in marker-id order
    pub peaks: Vec<Pixel>,
    /// Height raster the labels refer to, with its own (window) transform
    pub raster: HeightRaster,
    /// Number of crowns (largest label)
    pub segment_count: usize,
}

/// Flooding queue entry; the heap pops the lowest (priority, age) first
#[derive(Debug)]
struct FloodItem {
    priority: f64,
    age: u64,
    index: Pixel,
    source: Pixel,
}

impl PartialEq for FloodItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for FloodItem {}

impl PartialOrd for FloodItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.age.cmp(&self.age))
    }
}

/// Local maxima of `image` at least `min_distance` apart.
///
/// Peaks are strictly above `threshold`, equal to the maximum of their
/// `(2 * min_distance + 1)` window and, with `exclude_border`, at least
/// `min_distance` cells from every edge. Accepted greedily by descending
/// height (ties by row, then column); a later candidate within Chebyshev
/// distance `min_distance` of an accepted peak is dropped.
pub fn peak_local_max(
    image: &Array2<f64>,
    min_distance: usize,
    threshold: f64,
    exclude_border: bool,
) -> Vec<Pixel> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    let local_max = maximum_filter(image, 2 * min_distance + 1);

    let is_max = |r: usize, c: usize| {
        let v = image[[r, c]];
        !v.is_nan() && v == local_max[[r, c]]
    };

    // a constant image has no peaks
    if (0..rows).all(|r| (0..cols).all(|c| is_max(r, c) || image[[r, c]].is_nan())) {
        return Vec::new();
    }

    let border = if exclude_border { min_distance } else { 0 };
    let mut candidates: Vec<(Pixel, f64)> = Vec::new();
    for r in 0..rows {
        if r < border || r + border >= rows {
            continue;
        }
        for c in 0..cols {
            if c < border || c + border >= cols {
                continue;
            }
            let v = image[[r, c]];
            if is_max(r, c) && v > threshold {
                candidates.push(((r, c), v));
            }
        }
    }

    // stable sort keeps row-major order among equal heights
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut accepted: Vec<Pixel> = Vec::new();
    for ((r, c), _) in candidates {
        let too_close = accepted
            .iter()
            .any(|&(ar, ac)| r.abs_diff(ar).max(c.abs_diff(ac)) <= min_distance);
        if !too_close {
            accepted.push((r, c));
        }
    }
    accepted
}

/// Priority flooding from labelled markers over `surface`, restricted to `mask`.
///
/// A pixel is labelled when it is popped; its priority is the surface value
/// plus `compactness` times its euclidean distance to the seed that reached it.
pub fn compact_watershed(
    surface: &Array2<f64>,
    markers: &LabelGrid,
    mask: &Array2<bool>,
    connectivity: Connectivity,
    compactness: f64,
) -> LabelGrid {
    let shape = surface.dim();
    let mut output: LabelGrid = Array2::zeros(shape);
    let mut heap = BinaryHeap::new();
    let mut age: u64 = 0;

    for ((r, c), &id) in markers.indexed_iter() {
        if id == 0 || !mask[[r, c]] {
            continue;
        }
        output[[r, c]] = id;
        heap.push(FloodItem {
            priority: surface[[r, c]],
            age,
            index: (r, c),
            source: (r, c),
        });
        age += 1;
    }

    while let Some(item) = heap.pop() {
        if item.index != item.source {
            if output[item.index] != 0 {
                continue;
            }
            output[item.index] = output[item.source];
        }

        for n in connectivity.neighbours(item.index, shape) {
            if !mask[n] || output[n] != 0 {
                continue;
            }
            let dr = n.0 as f64 - item.source.0 as f64;
            let dc = n.1 as f64 - item.source.1 as f64;
            age += 1;
            heap.push(FloodItem {
                priority: surface[n] + compactness * dr.hypot(dc),
                age,
                index: n,
                source: item.source,
            });
        }
    }

    output
}

/// Reset labels covering fewer than `min_area` pixels to 0.
pub fn remove_small_regions(labels: &mut LabelGrid, min_area: usize) -> usize {
    let max_label = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut area = vec![0usize; max_label + 1];
    for &l in labels.iter() {
        area[l as usize] += 1;
    }
    let mut removed = 0;
    for (label, &count) in area.iter().enumerate().skip(1) {
        if count > 0 && count < min_area {
            removed += 1;
            log::debug!("Removing crown {} ({} px)", label, count);
        }
    }
    if removed > 0 {
        labels.mapv_inplace(|l| {
            if l != 0 && area[l as usize] < min_area {
                0
            } else {
                l
            }
        });
    }
    removed
}

/// Map surviving labels onto `1..=N`, keeping their ascending order.
pub fn relabel_sequential(labels: &mut LabelGrid) -> usize {
    let max_label = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut present = vec![false; max_label + 1];
    for &l in labels.iter() {
        present[l as usize] = true;
    }
    let mut forward = vec![0u32; max_label + 1];
    let mut next = 0u32;
    for (label, &p) in present.iter().enumerate().skip(1) {
        if p {
            next += 1;
            forward[label] = next;
        }
    }
    labels.mapv_inplace(|l| forward[l as usize]);
    next as usize
}

/// Crown segmentation processor
pub struct CrownSegmenter {
    params: SegmentationParams,
}

impl CrownSegmenter {
    pub fn new() -> Self {
        Self {
            params: SegmentationParams::default(),
        }
    }

    pub fn with_params(params: SegmentationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    fn validate(&self) -> PeakResult<()> {
        let p = &self.params;
        if p.sigma_for_treetops < 0.0 || p.sigma_for_segmentation < 0.0 {
            return Err(PeakError::InvalidConfig(
                "segmentation sigmas must not be negative".to_string(),
            ));
        }
        if !(p.compactness >= 0.0) {
            return Err(PeakError::InvalidConfig(
                "compactness must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Segment a sub-window of `raster`; the output carries the window transform.
    pub fn segment_window(&self, raster: &HeightRaster, window: PixelWindow) -> PeakResult<SegmentationOutput> {
        log::debug!("Segmentation window: {:?}", window);
        self.segment(&raster.crop(window))
    }

    /// Segment the whole raster into crowns.
    pub fn segment(&self, raster: &HeightRaster) -> PeakResult<SegmentationOutput> {
        self.validate()?;
        let p = &self.params;
        let shape = raster.shape();

        log::info!("Segmenting crowns on a {:?} raster", shape);
        log::debug!("Segmentation parameters: {:?}", p);

        // Step 1: ground and nodata cells become 0
        let cleaned = raster.data.mapv(|v| {
            if raster.is_nodata(v) || v <= p.ground_threshold {
                0.0
            } else {
                v
            }
        });

        // Step 2-3: two smoothing passes, flooding cost
        let for_peaks = gaussian_smooth(&cleaned, p.sigma_for_treetops);
        let for_segments = gaussian_smooth(&cleaned, p.sigma_for_segmentation);
        let gradient = sobel(&for_segments);

        // Step 4: markers
        let threshold = p.threshold_abs.unwrap_or(p.ground_threshold);
        let peaks = peak_local_max(&for_peaks, p.min_distance, threshold, p.exclude_border);
        if peaks.is_empty() {
            log::warn!("No crown apex above {:.2} found", threshold);
        }
        let mut markers: LabelGrid = Array2::zeros(shape);
        for (i, &px) in peaks.iter().enumerate() {
            markers[px] = i as u32 + 1;
        }

        // Step 5: flooding restricted to non-ground cells
        let mask = cleaned.mapv(|v| v > 0.0);
        let mut labels = compact_watershed(&gradient, &markers, &mask, p.connectivity, p.compactness);

        // Step 6-7
        let removed = remove_small_regions(&mut labels, p.min_area_threshold);
        let segment_count = relabel_sequential(&mut labels);

        log::info!(
            "Segmentation: {} apexes, {} crowns ({} below {} px removed)",
            peaks.len(),
            segment_count,
            removed,
            p.min_area_threshold
        );

        Ok(SegmentationOutput {
            labels,
            peaks,
            raster: raster.clone(),
            segment_count,
        })
    }
}

impl Default for CrownSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use std::collections::BTreeSet;

    /// Cones of height 20 and 18 centred on (10, 8) and (10, 22)
    fn two_cones() -> HeightRaster {
        let data = Array2::from_shape_fn((21, 31), |(r, c)| {
            let cone = |cr: f64, cc: f64, h: f64| {
                let d = ((r as f64 - cr).powi(2) + (c as f64 - cc).powi(2)).sqrt();
                (h - 2.0 * d).max(0.0)
            };
            cone(10.0, 8.0, 20.0).max(cone(10.0, 22.0, 18.0))
        });
        HeightRaster::new(data, GeoTransform::north_up(0.0, 21.0, 1.0), None, String::new())
    }

    fn params(min_area: usize) -> SegmentationParams {
        SegmentationParams {
            ground_threshold: 5.0,
            sigma_for_treetops: 1.0,
            sigma_for_segmentation: 0.5,
            min_distance: 3,
            threshold_abs: Some(5.0),
            exclude_border: true,
            connectivity: Connectivity::Four,
            compactness: 0.2,
            min_area_threshold: min_area,
        }
    }

    #[test]
    fn test_two_crowns() {
        let raster = two_cones();
        let out = CrownSegmenter::with_params(params(10)).segment(&raster).unwrap();

        assert_eq!(out.peaks, vec![(10, 8), (10, 22)]);
        assert_eq!(out.segment_count, 2);
        assert_eq!(out.labels[[10, 8]], 1);
        assert_eq!(out.labels[[10, 22]], 2);

        let ids: BTreeSet<u32> = out.labels.iter().copied().filter(|&l| l > 0).collect();
        assert_eq!(ids, (1..=2).collect());

        // ground cells never receive a label
        for ((r, c), &l) in out.labels.indexed_iter() {
            if raster.data[[r, c]] <= 5.0 {
                assert_eq!(l, 0, "ground cell ({}, {}) labelled", r, c);
            }
        }
    }

    #[test]
    fn test_small_crowns_removed() {
        let out = CrownSegmenter::with_params(params(10_000)).segment(&two_cones()).unwrap();
        assert_eq!(out.segment_count, 0);
        assert!(out.labels.iter().all(|&l| l == 0));
        assert_eq!(out.peaks.len(), 2);
    }

    #[test]
    fn test_stem_in_removed_crown_has_no_region() {
        use crate::core::segment_match::match_stems_to_segments;
        use crate::types::{FieldStem, MatchClass};

        // the 18 m crown covers fewer cells than the threshold, the 20 m one more
        let raster = two_cones();
        let out = CrownSegmenter::with_params(params(150)).segment(&raster).unwrap();
        assert_eq!(out.segment_count, 1);
        assert_eq!(out.labels[[10, 8]], 1);
        assert_eq!(out.labels[[10, 22]], 0);

        let stems = [
            FieldStem { plot: 1, id: 1001, x: 8.5, y: 10.5 },
            FieldStem { plot: 1, id: 1002, x: 22.5, y: 10.5 },
        ];
        let matched = match_stems_to_segments(&out.labels, &out.peaks, &stems, &out.raster).unwrap();
        assert_eq!(matched.results[0].class, MatchClass::Matched);
        assert_eq!(matched.results[0].height, Some(20.0));
        assert_eq!(matched.results[1].class, MatchClass::NoRegion);
        assert_eq!(matched.results[1].height, None);
        assert_eq!(matched.unmatched_peaks, vec![(10, 22)]);
    }

    #[test]
    fn test_flat_ground_is_empty_result() {
        let raster = HeightRaster::new(
            Array2::from_elem((10, 10), 2.0),
            GeoTransform::north_up(0.0, 10.0, 1.0),
            None,
            String::new(),
        );
        let out = CrownSegmenter::with_params(params(1)).segment(&raster).unwrap();
        assert!(out.peaks.is_empty());
        assert_eq!(out.segment_count, 0);
    }

    #[test]
    fn test_peak_spacing_prefers_row_major_on_ties() {
        let mut img = Array2::zeros((9, 9));
        img[[4, 3]] = 10.0;
        img[[4, 4]] = 10.0;
        img[[1, 7]] = 8.0;
        let peaks = peak_local_max(&img, 2, 5.0, false);
        assert_eq!(peaks, vec![(4, 3), (1, 7)]);
    }

    #[test]
    fn test_peak_border_exclusion() {
        let mut img = Array2::zeros((9, 9));
        img[[1, 4]] = 10.0;
        img[[5, 5]] = 9.0;
        assert_eq!(peak_local_max(&img, 2, 1.0, true), vec![(5, 5)]);
        assert_eq!(peak_local_max(&img, 2, 1.0, false), vec![(1, 4), (5, 5)]);
    }

    #[test]
    fn test_relabel_keeps_order() {
        let mut labels = ndarray::arr2(&[[0u32, 3, 3], [7, 7, 0], [9, 0, 0]]);
        let removed = remove_small_regions(&mut labels, 2);
        assert_eq!(removed, 1);
        let n = relabel_sequential(&mut labels);
        assert_eq!(n, 2);
        assert_eq!(labels, ndarray::arr2(&[[0u32, 1, 1], [2, 2, 0], [0, 0, 0]]));
    }

    #[test]
    fn test_watershed_respects_mask() {
        let surface = Array2::zeros((3, 5));
        let mut markers = Array2::zeros((3, 5));
        markers[[1, 0]] = 1;
        let mut mask = Array2::from_elem((3, 5), true);
        for r in 0..3 {
            mask[[r, 2]] = false;
        }
        let out = compact_watershed(&surface, &markers, &mask, Connectivity::Eight, 0.0);
        assert!(out.column(1).iter().all(|&l| l == 1));
        assert!(out.column(3).iter().all(|&l| l == 0));
    }

    #[test]
    fn test_compactness_moves_boundary_to_nearer_seed() {
        // cheap corridor from the left seed, costly cells in front of the right seed
        let mut surface = Array2::zeros((1, 11));
        surface[[0, 8]] = 5.0;
        surface[[0, 9]] = 5.0;
        let mut markers = Array2::zeros((1, 11));
        markers[[0, 0]] = 1;
        markers[[0, 10]] = 2;
        let mask = Array2::from_elem((1, 11), true);

        let loose = compact_watershed(&surface, &markers, &mask, Connectivity::Four, 0.0);
        assert_eq!(loose.row(0).to_vec(), vec![1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2]);

        let compact = compact_watershed(&surface, &markers, &mask, Connectivity::Four, 2.0);
        assert_eq!(compact.row(0).to_vec(), vec![1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_center_window() {
        let raster = two_cones();
        let w = SubsetMode::Center { size_m: 10.0 }.window(&raster, &[]);
        assert_eq!(w, PixelWindow { row_off: 5, col_off: 10, rows: 10, cols: 10 });
        let out = CrownSegmenter::with_params(params(1)).segment_window(&raster, w).unwrap();
        assert_eq!(out.raster.transform.pixel_center(0, 0), raster.transform.pixel_center(5, 10));
    }

    #[test]
    fn test_field_extent_window() {
        let raster = two_cones();
        // x in [5, 9], y in [11, 15] -> rows 6..10, cols 5..9 before buffering
        let w = SubsetMode::FieldExtent { buffer_m: 1.0 }.window(&raster, &[(5.0, 15.0), (9.0, 11.0)]);
        assert_eq!(w, PixelWindow { row_off: 5, col_off: 4, rows: 6, cols: 6 });
        let none = SubsetMode::FieldExtent { buffer_m: 1.0 }.window(&raster, &[(500.0, 500.0)]);
        assert_eq!(none, PixelWindow::full(raster.shape()));
    }
}
