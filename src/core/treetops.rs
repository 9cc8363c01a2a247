use crate::core::filters::{gaussian_smooth, label_components, maximum_filter, Connectivity};
use crate::types::{HeightRaster, PeakError, PeakResult, Treetop, TreetopCandidate};
use ndarray::Array2;

/// Treetop detection parameters
#[derive(Debug, Clone)]
pub struct TreetopParams {
    /// Gaussian smoothing strength in pixels
    pub sigma: f64,
    /// Side of the square local-maximum window in pixels
    pub neighborhood_size: usize,
    /// Candidates must be strictly above this height
    pub min_height: f64,
}

impl Default for TreetopParams {
    fn default() -> Self {
        Self {
            sigma: 2.0,
            neighborhood_size: 100,
            min_height: 10.0,
        }
    }
}

/// Whole-image local-maxima treetop detector
pub struct TreetopDetector {
    params: TreetopParams,
}

impl TreetopDetector {
    pub fn new() -> Self {
        Self {
            params: TreetopParams::default(),
        }
    }

    pub fn with_params(params: TreetopParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TreetopParams {
        &self.params
    }

    /// Detect candidate apexes on the raster.
    ///
    /// A cell is a candidate when its smoothed value equals the maximum of its
    /// window and exceeds `min_height`. Touching candidates (plateaus) form one
    /// 4-connected blob, represented by its first pixel in row-major order.
    pub fn detect(&self, raster: &HeightRaster) -> PeakResult<Vec<TreetopCandidate>> {
        log::info!("Detecting treetops on a {:?} raster", raster.shape());
        log::debug!("Treetop parameters: {:?}", self.params);

        if self.params.neighborhood_size == 0 {
            return Err(PeakError::InvalidConfig(
                "neighborhood_size must be at least 1".to_string(),
            ));
        }
        if self.params.sigma < 0.0 {
            return Err(PeakError::InvalidConfig("sigma must not be negative".to_string()));
        }

        let smoothed = gaussian_smooth(&raster.masked(), self.params.sigma);
        let local_max = maximum_filter(&smoothed, self.params.neighborhood_size);

        let mask: Array2<bool> = ndarray::Zip::from(&smoothed)
            .and(&local_max)
            .map_collect(|&v, &m| !v.is_nan() && v == m && v > self.params.min_height);

        let (labels, count) = label_components(&mask, Connectivity::Four);

        let mut representative: Vec<Option<(usize, usize)>> = vec![None; count];
        for ((row, col), &label) in labels.indexed_iter() {
            if label == 0 {
                continue;
            }
            let slot = &mut representative[label as usize - 1];
            if slot.is_none() {
                *slot = Some((row, col));
            }
        }

        let candidates: Vec<TreetopCandidate> = representative
            .into_iter()
            .flatten()
            .map(|(row, col)| TreetopCandidate {
                row,
                col,
                position: Some(raster.transform.pixel_center(row, col)),
                height: Some(smoothed[[row, col]]),
            })
            .collect();

        log::info!("Found {} treetop candidates", candidates.len());
        Ok(candidates)
    }

    /// Detect and convert to projected treetops for the point matcher.
    pub fn detect_treetops(&self, raster: &HeightRaster) -> PeakResult<Vec<Treetop>> {
        Ok(self
            .detect(raster)?
            .into_iter()
            .filter_map(|c| {
                let (x, y) = c.position?;
                Some(Treetop {
                    x,
                    y,
                    height: c.height?,
                })
            })
            .collect())
    }
}

impl Default for TreetopDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;

    fn params(size: usize, min_height: f64) -> TreetopParams {
        TreetopParams {
            sigma: 0.0,
            neighborhood_size: size,
            min_height,
        }
    }

    fn raster(data: Array2<f64>) -> HeightRaster {
        HeightRaster::new(data, GeoTransform::north_up(100.0, 200.0, 1.0), Some(-9999.0), String::new())
    }

    #[test]
    fn test_two_separated_peaks() {
        let mut data = Array2::from_elem((10, 10), 1.0);
        data[[2, 2]] = 15.0;
        data[[7, 7]] = 12.0;
        let detector = TreetopDetector::with_params(params(3, 10.0));
        let tops = detector.detect(&raster(data)).unwrap();
        assert_eq!(tops.len(), 2);
        assert_eq!((tops[0].row, tops[0].col), (2, 2));
        assert_eq!(tops[0].position, Some((102.5, 197.5)));
        assert_eq!(tops[1].height, Some(12.0));
    }

    #[test]
    fn test_height_threshold_is_strict() {
        let mut data = Array2::zeros((5, 5));
        data[[2, 2]] = 10.0;
        let detector = TreetopDetector::with_params(params(3, 10.0));
        assert!(detector.detect(&raster(data)).unwrap().is_empty());
    }

    #[test]
    fn test_plateau_yields_first_pixel() {
        let mut data = Array2::zeros((6, 6));
        for r in 2..4 {
            for c in 1..4 {
                data[[r, c]] = 20.0;
            }
        }
        let detector = TreetopDetector::with_params(params(3, 5.0));
        let tops = detector.detect(&raster(data)).unwrap();
        assert_eq!(tops.len(), 1);
        assert_eq!((tops[0].row, tops[0].col), (2, 1));
    }

    #[test]
    fn test_nodata_never_candidate() {
        let mut data = Array2::from_elem((5, 5), 3.0);
        data[[0, 0]] = -9999.0;
        data[[4, 4]] = 50.0;
        let detector = TreetopDetector::with_params(params(9, 1.0));
        let tops = detector.detect_treetops(&raster(data)).unwrap();
        assert_eq!(tops.len(), 1);
        assert_eq!(tops[0].height, 50.0);
    }

    #[test]
    fn test_zero_window_rejected() {
        let detector = TreetopDetector::with_params(params(0, 1.0));
        assert!(detector.detect(&raster(Array2::zeros((3, 3)))).is_err());
    }
}
