use crate::types::{FieldStem, HeightRaster, LabelGrid, MatchClass, MatchResult, PeakError, PeakResult, Pixel};
use std::collections::BTreeMap;

/// Segment matcher output
#[derive(Debug, Clone)]
pub struct SegmentMatchOutput {
    /// One result per input stem, in input order
    pub results: Vec<MatchResult>,
    /// Peaks on background, not attached to any stem
    pub unmatched_peaks: Vec<Pixel>,
}

impl SegmentMatchOutput {
    pub fn count(&self, class: MatchClass) -> usize {
        self.results.iter().filter(|r| r.class == class).count()
    }
}

/// Assign stems to crowns.
///
/// Stems and peaks are grouped by the crown they fall on. A crown holding
/// exactly one stem and one peak is a match; its height is the tallest raster
/// cell inside the crown and the treetop sits on that cell. All stems of any
/// other crown are unmatched. Stems outside the grid or on background get
/// `NoRegion`. `raster` must cover the same grid as `labels`.
pub fn match_stems_to_segments(
    labels: &LabelGrid,
    peaks: &[Pixel],
    stems: &[FieldStem],
    raster: &HeightRaster,
) -> PeakResult<SegmentMatchOutput> {
    if labels.dim() != raster.shape() {
        return Err(PeakError::ShapeMismatch {
            surface: raster.shape(),
            ground: labels.dim(),
        });
    }

    // crown -> number of peaks
    let mut peaks_by_label: BTreeMap<u32, usize> = BTreeMap::new();
    let mut unmatched_peaks = Vec::new();
    for &px in peaks {
        match labels.get(px).copied().unwrap_or(0) {
            0 => unmatched_peaks.push(px),
            label => *peaks_by_label.entry(label).or_default() += 1,
        }
    }

    // crown -> stem indices
    let mut stems_by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    let mut results: Vec<MatchResult> = stems
        .iter()
        .map(|s| MatchResult::unmatched(*s, MatchClass::NoRegion))
        .collect();
    for (i, stem) in stems.iter().enumerate() {
        let label = raster
            .pixel_of(stem.x, stem.y)
            .map_or(0, |px| labels[px]);
        if label != 0 {
            stems_by_label.entry(label).or_default().push(i);
        }
    }

    // crowns eligible for a one-to-one match
    let mut apex: BTreeMap<u32, Option<(Pixel, f64)>> = BTreeMap::new();
    for (&label, members) in &stems_by_label {
        if members.len() == 1 && peaks_by_label.get(&label) == Some(&1) {
            apex.insert(label, None);
        } else {
            for &i in members {
                results[i].class = MatchClass::Unmatched;
            }
        }
    }

    // tallest valid cell per eligible crown, first in row-major order on ties
    if !apex.is_empty() {
        for (px, &label) in labels.indexed_iter() {
            let Some(best) = apex.get_mut(&label) else {
                continue;
            };
            let Some(h) = raster.value(px.0, px.1) else {
                continue;
            };
            if best.map_or(true, |(_, bh)| h > bh) {
                *best = Some((px, h));
            }
        }
    }

    for (label, best) in &apex {
        let i = stems_by_label[label][0];
        match best {
            Some(((row, col), h)) => {
                results[i].treetop = Some(raster.transform.pixel_center(*row, *col));
                results[i].height = Some(*h);
                results[i].class = MatchClass::Matched;
            }
            None => {
                log::warn!("Crown {} has no valid height, stem left unmatched", label);
                results[i].class = MatchClass::Unmatched;
            }
        }
    }

    let out = SegmentMatchOutput {
        results,
        unmatched_peaks,
    };
    log::info!(
        "Segment matching: {} matched, {} unmatched, {} without crown",
        out.count(MatchClass::Matched),
        out.count(MatchClass::Unmatched),
        out.count(MatchClass::NoRegion)
    );
    log::debug!("{} peaks on background", out.unmatched_peaks.len());
    Ok(out)
}
