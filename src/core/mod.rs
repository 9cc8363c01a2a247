//! Core height-raster processing and matching modules

pub mod assignment;
pub mod filters;
pub mod ndsm;
pub mod pipeline;
pub mod point_match;
pub mod segment_match;
pub mod segmentation;
pub mod stats;
pub mod transform;
pub mod treetops;

// Re-export main types
pub use filters::Connectivity;
pub use ndsm::{align_ground, align_to_grid, check_crs, compute_ndsm, prepare_ndsm, Resampling};
pub use pipeline::{aligned_dtm_path, Pipeline, RunConfig, RunResult, RunSummary};
pub use point_match::{match_stems_to_treetops, process_unmatched_stems, MatchSource, PointMatch};
pub use segment_match::{match_stems_to_segments, SegmentMatchOutput};
pub use segmentation::{CrownSegmenter, SegmentationOutput, SegmentationParams, SubsetMode};
pub use stats::{height_histogram, HeightSummary, HistogramBin, RunStats};
pub use transform::{find_ground_lines, transform_stems};
pub use treetops::{TreetopDetector, TreetopParams};
