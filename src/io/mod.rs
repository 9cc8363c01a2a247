//! Adapters between files/services and the in-memory pipeline

pub mod export;
pub mod field;
pub mod raster;
pub mod wcs;

pub use export::{write_json_file, write_results, write_results_file, RESULT_COLUMNS};
pub use field::{read_corners, read_corners_file, read_stems, read_stems_file};
pub use raster::GeoTiff;
pub use wcs::{Credentials, WcsClient};
