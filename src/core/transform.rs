use crate::types::{CornerPoint, FieldStem, GroundLine, LocalStem};
use std::collections::BTreeMap;

impl GroundLine {
    /// Unit vector along the baseline and its left-hand perpendicular.
    ///
    /// `None` for a zero-length baseline.
    pub fn basis(&self) -> Option<((f64, f64), (f64, f64))> {
        let gx = self.lower_right.0 - self.lower_left.0;
        let gy = self.lower_right.1 - self.lower_left.1;
        let len = gx.hypot(gy);
        if len == 0.0 || !len.is_finite() {
            return None;
        }
        let unit = (gx / len, gy / len);
        Some((unit, (-unit.1, unit.0)))
    }

    /// Projected coordinate of a plot-local (x, y).
    pub fn to_projected(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (u, p) = self.basis()?;
        Some((
            self.lower_left.0 + x * u.0 + y * p.0,
            self.lower_left.1 + x * u.1 + y * p.1,
        ))
    }
}

/// Baseline per plot from its two lowest corners.
///
/// Corners are ranked by projected Y, then X; the lowest two are ordered by X
/// into (lower-left, lower-right). Plots with fewer than two corners are left out.
pub fn find_ground_lines(corners: &[CornerPoint]) -> BTreeMap<i64, GroundLine> {
    let mut by_plot: BTreeMap<i64, Vec<&CornerPoint>> = BTreeMap::new();
    for corner in corners {
        by_plot.entry(corner.plot).or_default().push(corner);
    }

    let mut lines = BTreeMap::new();
    for (plot, mut points) in by_plot {
        if points.len() < 2 {
            log::warn!("Plot {}: only {} corner point, skipped", plot, points.len());
            continue;
        }
        points.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
        let (mut a, mut b) = (points[0], points[1]);
        if b.x < a.x {
            std::mem::swap(&mut a, &mut b);
        }
        lines.insert(
            plot,
            GroundLine {
                lower_left: (a.x, a.y),
                lower_right: (b.x, b.y),
            },
        );
    }

    log::debug!("Ground lines for {} plots", lines.len());
    lines
}

/// Plot-local stems mapped into the projected system of their plot's baseline.
///
/// Stems of plots without a usable baseline are dropped. Input order is kept.
pub fn transform_stems(stems: &[LocalStem], ground_lines: &BTreeMap<i64, GroundLine>) -> Vec<FieldStem> {
    let mut dropped = 0usize;
    let out: Vec<FieldStem> = stems
        .iter()
        .filter_map(|s| {
            let projected = ground_lines.get(&s.plot).and_then(|gl| gl.to_projected(s.x, s.y));
            if projected.is_none() {
                dropped += 1;
            }
            let (x, y) = projected?;
            Some(FieldStem {
                plot: s.plot,
                id: s.id,
                x,
                y,
            })
        })
        .collect();

    if dropped > 0 {
        log::warn!("{} stems dropped (plot without a usable ground line)", dropped);
    }
    log::info!("Transformed {} stems to projected coordinates", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn corner(plot: i64, id: i64, x: f64, y: f64) -> CornerPoint {
        CornerPoint { plot, id, x, y }
    }

    #[test]
    fn test_axis_aligned_baseline() {
        let lines = find_ground_lines(&[corner(1, 101, 0.0, 0.0), corner(1, 102, 10.0, 0.0)]);
        let stems = transform_stems(
            &[LocalStem { plot: 1, id: 1, x: 5.0, y: 2.0, z: 0.0 }],
            &lines,
        );
        assert_eq!(stems.len(), 1);
        assert_relative_eq!(stems[0].x, 5.0);
        assert_relative_eq!(stems[0].y, 2.0);
    }

    #[test]
    fn test_lowest_two_corners_ordered_by_x() {
        let corners = [
            corner(3, 10001, 110.0, 205.0),
            corner(3, 10002, 100.0, 200.0),
            corner(3, 10003, 100.0, 230.0),
            corner(3, 10004, 130.0, 235.0),
        ];
        let gl = find_ground_lines(&corners)[&3];
        assert_eq!(gl.lower_left, (100.0, 200.0));
        assert_eq!(gl.lower_right, (110.0, 205.0));
    }

    #[test]
    fn test_rotated_baseline() {
        let gl = GroundLine {
            lower_left: (10.0, 10.0),
            lower_right: (10.0, 20.0),
        };
        // baseline points north: local y points west
        let (x, y) = gl.to_projected(3.0, 2.0).unwrap();
        assert_relative_eq!(x, 8.0, epsilon = 1e-12);
        assert_relative_eq!(y, 13.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_plots_skipped() {
        let corners = [
            corner(1, 10001, 0.0, 0.0),
            corner(2, 10001, 5.0, 5.0),
            corner(2, 10002, 5.0, 5.0),
        ];
        let lines = find_ground_lines(&corners);
        assert!(!lines.contains_key(&1));
        let stems = [
            LocalStem { plot: 1, id: 1000, x: 1.0, y: 1.0, z: 0.0 },
            LocalStem { plot: 2, id: 1001, x: 1.0, y: 1.0, z: 0.0 },
        ];
        assert!(transform_stems(&stems, &lines).is_empty());
    }
}
