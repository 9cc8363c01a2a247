use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// 2D grid of segment ids (0 = no region)
pub type LabelGrid = Array2<u32>;

/// Pixel location as (row, col)
pub type Pixel = (usize, usize);

/// Affine pixel <-> projected coordinate transform (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Projected coordinate of an arbitrary (fractional) pixel position.
    pub fn apply(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Projected coordinate of the centre of pixel (row, col).
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Fractional (row, col) of a projected coordinate.
    ///
    /// Returns `None` for a singular transform.
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (self.pixel_height * dx - self.rotation_x * dy) / det;
        let row = (self.pixel_width * dy - self.rotation_y * dx) / det;
        Some((row, col))
    }

    /// Integer (row, col) containing a projected coordinate (floor semantics).
    ///
    /// Indices may be negative or beyond the raster; callers bounds-check.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(isize, isize)> {
        let (row, col) = self.invert(x, y)?;
        if !row.is_finite() || !col.is_finite() {
            return None;
        }
        Some((row.floor() as isize, col.floor() as isize))
    }

    /// Transform of a sub-window whose top-left pixel is (row_off, col_off).
    pub fn window(&self, row_off: usize, col_off: usize) -> Self {
        let (x, y) = self.apply(row_off as f64, col_off as f64);
        Self {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }

    /// Absolute pixel size along x and y
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            self.pixel_width.hypot(self.rotation_y),
            self.rotation_x.hypot(self.pixel_height),
        )
    }
}

/// Rectangular pixel window into a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row_off: usize,
    pub col_off: usize,
    pub rows: usize,
    pub cols: usize,
}

impl PixelWindow {
    pub fn full(shape: (usize, usize)) -> Self {
        Self {
            row_off: 0,
            col_off: 0,
            rows: shape.0,
            cols: shape.1,
        }
    }

    /// Clip a possibly out-of-range window (signed offsets) to a raster shape.
    ///
    /// Returns `None` when nothing of the window overlaps the raster.
    pub fn clipped(
        row_off: isize,
        col_off: isize,
        rows: isize,
        cols: isize,
        shape: (usize, usize),
    ) -> Option<Self> {
        let r0 = row_off.max(0);
        let c0 = col_off.max(0);
        let r1 = (row_off + rows).min(shape.0 as isize);
        let c1 = (col_off + cols).min(shape.1 as isize);
        if r1 <= r0 || c1 <= c0 {
            return None;
        }
        Some(Self {
            row_off: r0 as usize,
            col_off: c0 as usize,
            rows: (r1 - r0) as usize,
            cols: (c1 - c0) as usize,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

/// Normalized height surface (height above ground) with georeferencing.
///
/// Nodata cells are kept in `data` as the raw sentinel (or NaN) and are
/// reported as missing by [`HeightRaster::value`].
#[derive(Debug, Clone)]
pub struct HeightRaster {
    pub data: Array2<f64>,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    /// Coordinate reference definition (WKT); empty when unknown
    pub crs: String,
}

impl HeightRaster {
    pub fn new(data: Array2<f64>, transform: GeoTransform, nodata: Option<f64>, crs: String) -> Self {
        Self {
            data,
            transform,
            nodata,
            crs,
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Whether a raw cell value is missing (nodata sentinel or NaN).
    #[inline]
    pub fn is_nodata(&self, v: f64) -> bool {
        v.is_nan() || self.nodata.map_or(false, |nd| v == nd)
    }

    /// Height at (row, col), `None` when out of bounds or nodata.
    #[inline]
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        let v = *self.data.get((row, col))?;
        if self.is_nodata(v) {
            None
        } else {
            Some(v)
        }
    }

    /// Bounds-checked pixel lookup of a projected coordinate.
    pub fn pixel_of(&self, x: f64, y: f64) -> Option<Pixel> {
        let (row, col) = self.transform.world_to_pixel(x, y)?;
        let (rows, cols) = self.shape();
        if row < 0 || col < 0 || row as usize >= rows || col as usize >= cols {
            return None;
        }
        Some((row as usize, col as usize))
    }

    /// Copy of the grid with nodata replaced by NaN.
    pub fn masked(&self) -> Array2<f64> {
        self.data.mapv(|v| if self.is_nodata(v) { f64::NAN } else { v })
    }

    /// Sub-window of this raster; the transform is recomputed for the window origin.
    pub fn crop(&self, window: PixelWindow) -> Self {
        let rows = window.row_off..window.row_off + window.rows;
        let cols = window.col_off..window.col_off + window.cols;
        let data = self.data.slice(ndarray::s![rows, cols]).to_owned();
        Self {
            data,
            transform: self.transform.window(window.row_off, window.col_off),
            nodata: self.nodata,
            crs: self.crs.clone(),
        }
    }

    /// Projected bounds as (min_x, min_y, max_x, max_y).
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let (rows, cols) = self.shape();
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(0.0, cols as f64),
            self.transform.apply(rows as f64, 0.0),
            self.transform.apply(rows as f64, cols as f64),
        ];
        let mut b = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            b.0 = b.0.min(x);
            b.1 = b.1.min(y);
            b.2 = b.2.max(x);
            b.3 = b.3.max(y);
        }
        b
    }
}

/// Candidate tree apex
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreetopCandidate {
    pub row: usize,
    pub col: usize,
    /// Projected coordinate of the pixel centre
    pub position: Option<(f64, f64)>,
    pub height: Option<f64>,
}

/// Treetop in projected space, as consumed by the point matcher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Treetop {
    pub x: f64,
    pub y: f64,
    pub height: f64,
}

/// Survey corner point (plot, point id, projected X, projected Y)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerPoint {
    pub plot: i64,
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

/// Stem measured in plot-local coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalStem {
    pub plot: i64,
    pub id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Field stem in the raster's projected coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStem {
    pub plot: i64,
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

impl FieldStem {
    pub fn key(&self) -> (i64, i64) {
        (self.plot, self.id)
    }
}

/// Plot baseline: lower-left and lower-right corner in projected coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundLine {
    pub lower_left: (f64, f64),
    pub lower_right: (f64, f64),
}

/// Stem match classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MatchClass {
    /// Ambiguous region or no eligible partner
    Unmatched,
    Matched,
    /// Stem outside the raster or on background
    NoRegion,
}

impl MatchClass {
    /// Numeric code used in the result table
    pub fn code(self) -> u8 {
        match self {
            MatchClass::Unmatched => 0,
            MatchClass::Matched => 1,
            MatchClass::NoRegion => 2,
        }
    }
}

impl From<MatchClass> for u8 {
    fn from(class: MatchClass) -> Self {
        class.code()
    }
}

impl TryFrom<u8> for MatchClass {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MatchClass::Unmatched),
            1 => Ok(MatchClass::Matched),
            2 => Ok(MatchClass::NoRegion),
            other => Err(format!("unknown match code {}", other)),
        }
    }
}

impl std::fmt::Display for MatchClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchClass::Unmatched => write!(f, "unmatched"),
            MatchClass::Matched => write!(f, "matched"),
            MatchClass::NoRegion => write!(f, "no-region"),
        }
    }
}

/// Outcome of matching one stem
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub stem: FieldStem,
    pub treetop: Option<(f64, f64)>,
    pub height: Option<f64>,
    pub class: MatchClass,
}

impl MatchResult {
    pub fn unmatched(stem: FieldStem, class: MatchClass) -> Self {
        Self {
            stem,
            treetop: None,
            height: None,
            class,
        }
    }
}

/// One row of the consolidated result table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    #[serde(rename = "Parzelle")]
    pub plot: i64,
    #[serde(rename = "Nr")]
    pub id: i64,
    #[serde(rename = "Stem_UTM_X")]
    pub stem_x: f64,
    #[serde(rename = "Stem_UTM_Y")]
    pub stem_y: f64,
    #[serde(rename = "Treetop_UTM_X")]
    pub treetop_x: Option<f64>,
    #[serde(rename = "Treetop_UTM_Y")]
    pub treetop_y: Option<f64>,
    /// Tallest cell of the matched crown
    #[serde(rename = "UAV_Tree_Height_segment")]
    pub height_segment: Option<f64>,
    /// Height of the point-matched treetop
    #[serde(rename = "UAV_Tree_Height_pixel")]
    pub height_pixel: Option<f64>,
    #[serde(rename = "match")]
    pub class: MatchClass,
}

impl ResultRow {
    /// Merge a segment-match result with the point-match height of the same stem.
    pub fn merge(result: &MatchResult, height_pixel: Option<f64>) -> Self {
        Self {
            plot: result.stem.plot,
            id: result.stem.id,
            stem_x: result.stem.x,
            stem_y: result.stem.y,
            treetop_x: result.treetop.map(|t| t.0),
            treetop_y: result.treetop.map(|t| t.1),
            height_segment: result.height,
            height_pixel,
            class: result.class,
        }
    }
}

/// Error types for the height/matching pipeline
#[derive(Debug, thiserror::Error)]
pub enum PeakError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Raster shape mismatch: surface {surface:?} vs ground {ground:?}")]
    ShapeMismatch {
        surface: (usize, usize),
        ground: (usize, usize),
    },

    #[error(
        "Coordinate reference mismatch: surface {} vs ground {}",
        crs_excerpt(.surface),
        crs_excerpt(.ground)
    )]
    CrsMismatch { surface: String, ground: String },

    #[error("Missing credentials for the elevation service (set LDBV_USER/LDBV_PASS)")]
    MissingCredentials,

    #[error("Elevation service error: {0}")]
    Remote(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for pipeline operations
pub type PeakResult<T> = Result<T, PeakError>;

/// Leading part of a CRS definition, enough to name the system.
fn crs_excerpt(definition: &str) -> String {
    const MAX_CHARS: usize = 80;
    let definition = definition.trim();
    match definition.char_indices().nth(MAX_CHARS) {
        Some((end, _)) => format!("`{}...`", &definition[..end]),
        None => format!("`{}`", definition),
    }
}
