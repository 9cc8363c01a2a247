//! Field survey records from CSV.
//!
//! Corner points: `plot,id,x,y` (projected). Stems: `plot,id,x,y,z` (plot-local).
//! The survey convention reserves ids above 10000 for corner points and
//! 1000..=9999 for stems; other ids are ignored.

use crate::types::{CornerPoint, LocalStem, PeakResult};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

pub const CORNER_ID_MIN_EXCLUSIVE: i64 = 10_000;
pub const STEM_ID_RANGE: std::ops::RangeInclusive<i64> = 1_000..=9_999;

#[derive(Debug, Deserialize)]
struct FieldRecord {
    #[serde(alias = "Parzelle")]
    plot: i64,
    #[serde(alias = "Nr")]
    id: i64,
    x: Option<f64>,
    y: Option<f64>,
    #[serde(default)]
    z: Option<f64>,
}

fn read_records<R: Read>(reader: R) -> PeakResult<Vec<FieldRecord>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    for row in rdr.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Corner points with `id > 10000` and both coordinates present.
pub fn read_corners<R: Read>(reader: R) -> PeakResult<Vec<CornerPoint>> {
    let corners: Vec<CornerPoint> = read_records(reader)?
        .into_iter()
        .filter(|r| r.id > CORNER_ID_MIN_EXCLUSIVE)
        .filter_map(|r| {
            Some(CornerPoint {
                plot: r.plot,
                id: r.id,
                x: r.x?,
                y: r.y?,
            })
        })
        .collect();
    log::debug!("Read {} corner points", corners.len());
    Ok(corners)
}

/// Stems with `1000 <= id <= 9999` and both local coordinates present.
pub fn read_stems<R: Read>(reader: R) -> PeakResult<Vec<LocalStem>> {
    let stems: Vec<LocalStem> = read_records(reader)?
        .into_iter()
        .filter(|r| STEM_ID_RANGE.contains(&r.id))
        .filter_map(|r| {
            Some(LocalStem {
                plot: r.plot,
                id: r.id,
                x: r.x?,
                y: r.y?,
                z: r.z.unwrap_or(0.0),
            })
        })
        .collect();
    log::debug!("Read {} stems", stems.len());
    Ok(stems)
}

pub fn read_corners_file<P: AsRef<Path>>(path: P) -> PeakResult<Vec<CornerPoint>> {
    log::info!("Reading corner points from: {}", path.as_ref().display());
    read_corners(std::fs::File::open(path)?)
}

pub fn read_stems_file<P: AsRef<Path>>(path: P) -> PeakResult<Vec<LocalStem>> {
    log::info!("Reading stems from: {}", path.as_ref().display());
    read_stems(std::fs::File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_id_filter() {
        let data = "plot,id,x,y\n1,10001,5.0,6.0\n1,9999,1.0,1.0\n1,10002,,6.0\n2,20001,7.5,8.5\n";
        let corners = read_corners(data.as_bytes()).unwrap();
        assert_eq!(corners.len(), 2);
        assert_eq!(corners[0], CornerPoint { plot: 1, id: 10001, x: 5.0, y: 6.0 });
        assert_eq!(corners[1].plot, 2);
    }

    #[test]
    fn test_stem_id_range_and_aliases() {
        let data = "Parzelle,Nr,x,y,z\n1,999,1,1,0\n1,1000,2.5,3.5,0.1\n1,9999,4,5,\n1,10000,1,1,0\n";
        let stems = read_stems(data.as_bytes()).unwrap();
        let ids: Vec<i64> = stems.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1000, 9999]);
        assert_eq!(stems[0].x, 2.5);
        assert_eq!(stems[1].z, 0.0);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let data = "plot,id,x,y\n1,abc,1,1\n";
        assert!(read_corners(data.as_bytes()).is_err());
    }
}
