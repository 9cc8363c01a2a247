use crate::core::assignment;
use crate::types::{FieldStem, PeakResult, Treetop};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Which pass produced a point match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchSource {
    /// Global minimum-distance assignment
    Assignment,
    /// Isolated-candidate rescue
    Rescue,
}

/// One stem and the treetop it was paired with, if any
#[derive(Debug, Clone, PartialEq)]
pub struct PointMatch {
    pub stem: FieldStem,
    pub treetop: Option<Treetop>,
    /// Index of the treetop in the detector output
    pub treetop_index: Option<usize>,
    pub source: Option<MatchSource>,
}

impl PointMatch {
    fn unmatched(stem: FieldStem) -> Self {
        Self {
            stem,
            treetop: None,
            treetop_index: None,
            source: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.treetop.is_some()
    }

    pub fn height(&self) -> Option<f64> {
        self.treetop.map(|t| t.height)
    }
}

#[inline]
fn distance(stem: &FieldStem, top: &Treetop) -> f64 {
    (stem.x - top.x).hypot(stem.y - top.y)
}

/// Pair stems with treetops minimising the total matched distance.
///
/// Only pairs within `max_distance` are eligible. Stems and treetops without
/// any eligible partner are left out of the solve. Inside the reduced problem
/// ineligible pairs carry a penalty larger than any feasible total, so the
/// solve first maximises the number of eligible pairs; penalised pairs are
/// discarded. Returns one entry per stem, in input order.
pub fn match_stems_to_treetops(
    stems: &[FieldStem],
    treetops: &[Treetop],
    max_distance: f64,
) -> PeakResult<Vec<PointMatch>> {
    log::info!(
        "Matching {} stems to {} treetops (max distance {:.2})",
        stems.len(),
        treetops.len(),
        max_distance
    );

    let mut matches: Vec<PointMatch> = stems.iter().copied().map(PointMatch::unmatched).collect();

    let eligible = |s: &FieldStem, t: &Treetop| distance(s, t) <= max_distance;
    let rows: Vec<usize> = (0..stems.len())
        .filter(|&i| treetops.iter().any(|t| eligible(&stems[i], t)))
        .collect();
    let cols: Vec<usize> = (0..treetops.len())
        .filter(|&j| stems.iter().any(|s| eligible(s, &treetops[j])))
        .collect();

    if rows.is_empty() {
        log::warn!("No stem has a treetop within {:.2}", max_distance);
        return Ok(matches);
    }
    log::debug!("Reduced assignment problem: {} x {}", rows.len(), cols.len());

    let mut feasible = Array2::from_elem((rows.len(), cols.len()), false);
    let mut cost = Array2::zeros((rows.len(), cols.len()));
    let mut max_cost: f64 = 0.0;
    for (ri, &i) in rows.iter().enumerate() {
        for (ci, &j) in cols.iter().enumerate() {
            let d = distance(&stems[i], &treetops[j]);
            if d <= max_distance {
                feasible[[ri, ci]] = true;
                cost[[ri, ci]] = d;
                max_cost = max_cost.max(d);
            }
        }
    }
    let penalty = (max_cost + 1.0) * (rows.len().min(cols.len()) as f64 + 1.0);
    for (c, &ok) in cost.iter_mut().zip(feasible.iter()) {
        if !ok {
            *c = penalty;
        }
    }

    for (ri, ci) in assignment::solve(&cost)? {
        if !feasible[[ri, ci]] {
            continue;
        }
        let (i, j) = (rows[ri], cols[ci]);
        matches[i].treetop = Some(treetops[j]);
        matches[i].treetop_index = Some(j);
        matches[i].source = Some(MatchSource::Assignment);
    }

    let matched = matches.iter().filter(|m| m.is_matched()).count();
    log::info!("Assignment matched {} of {} stems", matched, stems.len());
    Ok(matches)
}

/// Attach isolated treetops to stems the assignment left unmatched.
///
/// Unmatched stems are visited in order; a stem takes the only unused
/// treetop within `radius`, if there is exactly one. Existing matches are
/// never changed and a rescued treetop counts as used for later stems.
pub fn process_unmatched_stems(
    mut matches: Vec<PointMatch>,
    treetops: &[Treetop],
    radius: f64,
) -> Vec<PointMatch> {
    let mut used = vec![false; treetops.len()];
    for j in matches.iter().filter_map(|m| m.treetop_index) {
        if let Some(u) = used.get_mut(j) {
            *u = true;
        }
    }

    let mut rescued = 0usize;
    for m in matches.iter_mut().filter(|m| !m.is_matched()) {
        let mut nearby = treetops
            .iter()
            .enumerate()
            .filter(|&(j, t)| !used[j] && distance(&m.stem, t) <= radius);
        let (Some((j, top)), None) = (nearby.next(), nearby.next()) else {
            continue;
        };
        used[j] = true;
        m.treetop = Some(*top);
        m.treetop_index = Some(j);
        m.source = Some(MatchSource::Rescue);
        rescued += 1;
    }

    log::info!("Rescue pass matched {} more stems (radius {:.2})", rescued, radius);
    matches
}
