use serde::Serialize;

/// Summary of a set of tree heights
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeightSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std: f64,
}

impl HeightSummary {
    /// `None` when there is no finite height.
    pub fn from_heights(heights: &[f64]) -> Option<Self> {
        let mut values: Vec<f64> = heights.iter().copied().filter(|h| h.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

        Some(Self {
            count: n,
            mean,
            median,
            min: values[0],
            max: values[n - 1],
            std: var.sqrt(),
        })
    }
}

/// Height class `[lower, upper)`; the last class also holds `upper`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Fixed-width height classes from 0 up to the tallest height.
///
/// Negative and non-finite heights are ignored.
pub fn height_histogram(heights: &[f64], bin_width: f64) -> Vec<HistogramBin> {
    let values: Vec<f64> = heights
        .iter()
        .copied()
        .filter(|h| h.is_finite() && *h >= 0.0)
        .collect();
    if values.is_empty() || !(bin_width > 0.0) {
        return Vec::new();
    }
    let max = values.iter().copied().fold(0.0, f64::max);
    let n_bins = ((max / bin_width).ceil() as usize).max(1);

    let mut bins: Vec<HistogramBin> = (0..n_bins)
        .map(|i| HistogramBin {
            lower: i as f64 * bin_width,
            upper: (i + 1) as f64 * bin_width,
            count: 0,
        })
        .collect();
    for v in values {
        let idx = ((v / bin_width).floor() as usize).min(n_bins - 1);
        bins[idx].count += 1;
    }
    bins
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub stems_total: usize,
    pub treetops_total: usize,
    pub point_matched: usize,
    pub point_unmatched: usize,
    pub point_rescued: usize,
    pub segment_matched: usize,
    pub segment_unmatched: usize,
    pub segment_no_region: usize,
    pub segments: usize,
    pub peaks: usize,
}

impl RunStats {
    pub fn log_summary(&self) {
        log::info!(
            "Stems: {}, treetops: {}, crowns: {}, apexes: {}",
            self.stems_total,
            self.treetops_total,
            self.segments,
            self.peaks
        );
        log::info!(
            "Point matching: {} matched ({} rescued), {} unmatched",
            self.point_matched,
            self.point_rescued,
            self.point_unmatched
        );
        log::info!(
            "Segment matching: {} matched, {} unmatched, {} without crown",
            self.segment_matched,
            self.segment_unmatched,
            self.segment_no_region
        );
    }
}
