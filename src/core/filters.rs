//! Raster filters shared by the treetop detector and the crown segmentation.
//!
//! All filters use the *nearest* edge policy: cells outside the grid take the
//! value of the closest edge cell. NaN marks missing data; smoothing and
//! maximum filters skip missing cells and keep them missing in the output.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Pixel neighbourhood used for region growing and component labelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// Edge neighbours only
    Four,
    /// Edge and diagonal neighbours
    Eight,
}

impl Connectivity {
    const FOUR: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
    const EIGHT: [(isize, isize); 8] = [
        (-1, -1),
        (-1, 0),
        (-1, 1),
        (0, -1),
        (0, 1),
        (1, -1),
        (1, 0),
        (1, 1),
    ];

    pub fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &Self::FOUR,
            Connectivity::Eight => &Self::EIGHT,
        }
    }

    /// In-bounds neighbours of (row, col) for a grid of `shape`.
    pub fn neighbours(
        self,
        (row, col): (usize, usize),
        shape: (usize, usize),
    ) -> impl Iterator<Item = (usize, usize)> {
        self.offsets().iter().filter_map(move |&(dr, dc)| {
            let r = row as isize + dr;
            let c = col as isize + dc;
            if r < 0 || c < 0 || r >= shape.0 as isize || c >= shape.1 as isize {
                None
            } else {
                Some((r as usize, c as usize))
            }
        })
    }
}

#[inline]
fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

/// Normalised, truncated 1D Gaussian kernel (radius = round(4 sigma)).
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let ksum: f64 = kernel.iter().sum();
    kernel.iter().map(|v| v / ksum).collect()
}

/// One separable convolution pass, within each row or (`along_cols`) each column.
fn convolve_axis(image: &Array2<f64>, kernel: &[f64], along_cols: bool) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let radius = (kernel.len() / 2) as isize;
    let mut out = image.clone();

    for r in 0..rows {
        for c in 0..cols {
            if image[[r, c]].is_nan() {
                continue;
            }
            let mut sum = 0.0;
            let mut wsum = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let d = k as isize - radius;
                let v = if along_cols {
                    image[[clamp_index(r as isize + d, rows), c]]
                } else {
                    image[[r, clamp_index(c as isize + d, cols)]]
                };
                if !v.is_nan() {
                    sum += v * w;
                    wsum += w;
                }
            }
            if wsum > 0.0 {
                out[[r, c]] = sum / wsum;
            }
        }
    }
    out
}

/// Gaussian smoothing (2D separable). `sigma` in pixels; `sigma <= 0` is a no-op.
pub fn gaussian_smooth(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 || image.is_empty() {
        return image.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let tmp = convolve_axis(image, &kernel, false);
    convolve_axis(&tmp, &kernel, true)
}

fn max_axis(image: &Array2<f64>, before: isize, after: isize, along_cols: bool) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let mut out = Array2::from_elem((rows, cols), f64::NAN);
    for r in 0..rows {
        for c in 0..cols {
            let mut best = f64::NAN;
            for d in -before..=after {
                let v = if along_cols {
                    let rr = r as isize + d;
                    if rr < 0 || rr >= rows as isize {
                        continue;
                    }
                    image[[rr as usize, c]]
                } else {
                    let cc = c as isize + d;
                    if cc < 0 || cc >= cols as isize {
                        continue;
                    }
                    image[[r, cc as usize]]
                };
                if !v.is_nan() && (best.is_nan() || v > best) {
                    best = v;
                }
            }
            out[[r, c]] = best;
        }
    }
    out
}

/// Square maximum filter of side `size`.
///
/// For even sizes the window extends one cell further before the centre than
/// after it. Clipping the window at the edges gives the same maxima as
/// edge replication.
pub fn maximum_filter(image: &Array2<f64>, size: usize) -> Array2<f64> {
    let size = size.max(1) as isize;
    let before = size / 2;
    let after = size - 1 - before;
    let tmp = max_axis(image, before, after, false);
    max_axis(&tmp, before, after, true)
}

/// Sobel gradient magnitude, `sqrt((gx^2 + gy^2) / 2)` with kernels scaled by 1/4.
pub fn sobel(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let mut out = Array2::zeros((rows, cols));
    if rows == 0 || cols == 0 {
        return out;
    }
    let at = |r: isize, c: isize| image[[clamp_index(r, rows), clamp_index(c, cols)]];

    for r in 0..rows as isize {
        for c in 0..cols as isize {
            let gx = (at(r - 1, c + 1) + 2.0 * at(r, c + 1) + at(r + 1, c + 1)
                - at(r - 1, c - 1)
                - 2.0 * at(r, c - 1)
                - at(r + 1, c - 1))
                / 4.0;
            let gy = (at(r + 1, c - 1) + 2.0 * at(r + 1, c) + at(r + 1, c + 1)
                - at(r - 1, c - 1)
                - 2.0 * at(r - 1, c)
                - at(r - 1, c + 1))
                / 4.0;
            out[[r as usize, c as usize]] = ((gx * gx + gy * gy) / 2.0).sqrt();
        }
    }
    out
}

/// Label connected `true` regions; returns the label grid and region count.
///
/// Labels are assigned 1..=n in row-major order of each region's first pixel.
pub fn label_components(mask: &Array2<bool>, connectivity: Connectivity) -> (Array2<u32>, usize) {
    let shape = mask.dim();
    let mut labels = Array2::<u32>::zeros(shape);
    let mut next: u32 = 0;
    let mut queue = VecDeque::new();

    for r in 0..shape.0 {
        for c in 0..shape.1 {
            if !mask[[r, c]] || labels[[r, c]] != 0 {
                continue;
            }
            next += 1;
            labels[[r, c]] = next;
            queue.push_back((r, c));
            while let Some(px) = queue.pop_front() {
                for n in connectivity.neighbours(px, shape) {
                    if mask[n] && labels[n] == 0 {
                        labels[n] = next;
                        queue.push_back(n);
                    }
                }
            }
        }
    }

    (labels, next as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gaussian_preserves_constant() {
        let img = Array2::from_elem((7, 9), 4.0);
        let out = gaussian_smooth(&img, 1.5);
        for v in out.iter() {
            assert_relative_eq!(*v, 4.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gaussian_spreads_spike_symmetrically() {
        let mut img = Array2::zeros((9, 9));
        img[[4, 4]] = 10.0;
        let out = gaussian_smooth(&img, 1.0);
        assert!(out[[4, 4]] < 10.0);
        assert!(out[[4, 4]] > out[[4, 5]]);
        assert_relative_eq!(out[[4, 3]], out[[4, 5]], epsilon = 1e-12);
        assert_relative_eq!(out[[3, 4]], out[[5, 4]], epsilon = 1e-12);
        assert_relative_eq!(out.sum(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gaussian_keeps_nan_missing() {
        let mut img = Array2::from_elem((5, 5), 2.0);
        img[[2, 2]] = f64::NAN;
        let out = gaussian_smooth(&img, 1.0);
        assert!(out[[2, 2]].is_nan());
        assert_relative_eq!(out[[2, 1]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_maximum_filter_window() {
        let mut img = Array2::zeros((5, 5));
        img[[0, 0]] = 7.0;
        let out = maximum_filter(&img, 3);
        assert_eq!(out[[1, 1]], 7.0);
        assert_eq!(out[[2, 2]], 0.0);
        // even window reaches one cell further back
        let out = maximum_filter(&img, 4);
        assert_eq!(out[[2, 2]], 7.0);
        assert_eq!(out[[1, 3]], 0.0);
    }

    #[test]
    fn test_sobel_flat_and_ramp() {
        let flat = Array2::from_elem((4, 4), 3.0);
        assert!(sobel(&flat).iter().all(|v| *v == 0.0));

        let ramp = Array2::from_shape_fn((5, 5), |(_, c)| c as f64);
        let g = sobel(&ramp);
        // interior: gx = 2 * 4 / 4 = 2, gy = 0
        assert_relative_eq!(g[[2, 2]], (4.0f64 / 2.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_label_components_connectivity() {
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[0, 0]] = true;
        mask[[1, 1]] = true;
        mask[[2, 2]] = true;
        let (_, n4) = label_components(&mask, Connectivity::Four);
        assert_eq!(n4, 3);
        let (labels, n8) = label_components(&mask, Connectivity::Eight);
        assert_eq!(n8, 1);
        assert_eq!(labels[[2, 2]], 1);
    }
}
