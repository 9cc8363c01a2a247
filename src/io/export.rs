use crate::types::{PeakResult, ResultRow};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Column order of the result table
pub const RESULT_COLUMNS: [&str; 9] = [
    "Parzelle",
    "Nr",
    "Stem_UTM_X",
    "Stem_UTM_Y",
    "Treetop_UTM_X",
    "Treetop_UTM_Y",
    "UAV_Tree_Height_segment",
    "UAV_Tree_Height_pixel",
    "match",
];

/// Write the result table as CSV; missing values are empty fields.
pub fn write_results<W: Write>(rows: &[ResultRow], writer: W) -> PeakResult<()> {
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record(RESULT_COLUMNS)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_results_file<P: AsRef<Path>>(rows: &[ResultRow], path: P) -> PeakResult<()> {
    let path = path.as_ref();
    log::info!("Writing {} result rows to: {}", rows.len(), path.display());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    write_results(rows, std::fs::File::create(path)?)
}

/// Pretty-printed JSON dump of any run summary.
pub fn write_json_file<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> PeakResult<()> {
    let path = path.as_ref();
    log::info!("Writing run summary to: {}", path.display());
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
