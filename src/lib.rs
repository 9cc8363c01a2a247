//! peakfinder: individual-tree crowns and heights from UAV height rasters
//!
//! Derives a normalized height surface (nDSM), segments it into tree crowns
//! with a marker-controlled watershed, and reconciles crowns and local maxima
//! with field-surveyed stem positions.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    CornerPoint, FieldStem, GeoTransform, GroundLine, HeightRaster, LabelGrid, LocalStem, MatchClass,
    MatchResult, PeakError, PeakResult, PixelWindow, ResultRow, Treetop, TreetopCandidate,
};

pub use crate::core::{Pipeline, RunConfig, RunResult};
pub use io::GeoTiff;
