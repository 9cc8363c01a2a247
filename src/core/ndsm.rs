use crate::types::{HeightRaster, PeakError, PeakResult};
use gdal::spatial_ref::SpatialRef;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Resampling kernel used when aligning the ground grid onto the surface grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    Nearest,
    Bilinear,
    /// Keys cubic convolution (a = -0.5)
    Cubic,
}

impl Default for Resampling {
    fn default() -> Self {
        Resampling::Bilinear
    }
}

/// Fail with `CrsMismatch` when both rasters carry a non-empty CRS that GDAL
/// does not consider the same reference system.
///
/// Definitions are compared after parsing, so WKT flavours, authority nodes and
/// `EPSG:` codes of one system are accepted.
pub fn check_crs(surface: &HeightRaster, ground: &HeightRaster) -> PeakResult<()> {
    let (a, b) = (surface.crs.trim(), ground.crs.trim());
    if a.is_empty() || b.is_empty() || a == b {
        return Ok(());
    }
    if SpatialRef::from_definition(a)? != SpatialRef::from_definition(b)? {
        return Err(PeakError::CrsMismatch {
            surface: a.to_string(),
            ground: b.to_string(),
        });
    }
    log::debug!("Surface and ground CRS differ in text only");
    Ok(())
}

/// Height above ground: `surface - ground` per cell.
///
/// Cells where either input is nodata (its own sentinel or NaN) are written as
/// `nodata` in the output. Both grids must already share shape and CRS.
pub fn compute_ndsm(surface: &HeightRaster, ground: &HeightRaster, nodata: f64) -> PeakResult<HeightRaster> {
    if surface.shape() != ground.shape() {
        return Err(PeakError::ShapeMismatch {
            surface: surface.shape(),
            ground: ground.shape(),
        });
    }
    check_crs(surface, ground)?;

    log::info!("Computing nDSM on a {:?} grid", surface.shape());

    let mut masked = 0usize;
    let mut data = Array2::from_elem(surface.shape(), nodata);
    Zip::from(&mut data)
        .and(&surface.data)
        .and(&ground.data)
        .for_each(|out, &s, &g| {
            if surface.is_nodata(s) || ground.is_nodata(g) {
                masked += 1;
            } else {
                *out = s - g;
            }
        });

    log::debug!("nDSM: {} cells masked as nodata", masked);

    Ok(HeightRaster::new(data, surface.transform, Some(nodata), surface.crs.clone()))
}

/// Cubic convolution weight for distance `t` (Keys, a = -0.5).
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
    } else {
        0.0
    }
}

/// Sample `source` at a fractional pixel position (row, col measured from the
/// top-left corner). Returns `None` outside the source extent or on nodata.
fn sample(source: &HeightRaster, row: f64, col: f64, kernel: Resampling) -> Option<f64> {
    let (rows, cols) = source.shape();
    if !(row >= 0.0 && col >= 0.0 && row < rows as f64 && col < cols as f64) {
        return None;
    }
    let nearest = source.value(row as usize, col as usize);

    // kernel taps sit on pixel centres
    let v = row - 0.5;
    let u = col - 0.5;
    let clamp_r = |i: isize| i.clamp(0, rows as isize - 1) as usize;
    let clamp_c = |i: isize| i.clamp(0, cols as isize - 1) as usize;

    match kernel {
        Resampling::Nearest => nearest,
        Resampling::Bilinear => {
            let r0 = v.floor() as isize;
            let c0 = u.floor() as isize;
            let dy = v - r0 as f64;
            let dx = u - c0 as f64;
            let mut acc = 0.0;
            for (rr, wy) in [(r0, 1.0 - dy), (r0 + 1, dy)] {
                for (cc, wx) in [(c0, 1.0 - dx), (c0 + 1, dx)] {
                    let Some(val) = source.value(clamp_r(rr), clamp_c(cc)) else {
                        // any missing tap degrades to nearest neighbour
                        return nearest;
                    };
                    acc += val * wy * wx;
                }
            }
            Some(acc)
        }
        Resampling::Cubic => {
            let r0 = v.floor() as isize;
            let c0 = u.floor() as isize;
            let mut acc = 0.0;
            for i in -1..=2 {
                let wy = cubic_weight(v - (r0 + i) as f64);
                for j in -1..=2 {
                    let wx = cubic_weight(u - (c0 + j) as f64);
                    let Some(val) = source.value(clamp_r(r0 + i), clamp_c(c0 + j)) else {
                        return nearest;
                    };
                    acc += val * wy * wx;
                }
            }
            Some(acc)
        }
    }
}

/// Resample `source` onto the pixel grid of `target` (transform, shape and CRS).
///
/// Target pixels whose centre falls outside the source, or on source nodata,
/// are set to `nodata`.
pub fn align_to_grid(
    source: &HeightRaster,
    target: &HeightRaster,
    kernel: Resampling,
    nodata: f64,
) -> PeakResult<HeightRaster> {
    check_crs(target, source)?;
    let shape = target.shape();

    log::info!("Aligning ground grid onto surface grid ({:?}, {:?})", shape, kernel);
    log::debug!("Source transform: {:?}", source.transform);
    log::debug!("Target transform: {:?}", target.transform);

    // singular transforms are rejected up front
    if source.transform.invert(0.0, 0.0).is_none() {
        return Err(PeakError::Processing(
            "ground raster has a singular geotransform".to_string(),
        ));
    }

    let sampled = Zip::indexed(&target.data).par_map_collect(|(row, col), _| {
        let (x, y) = target.transform.pixel_center(row, col);
        source
            .transform
            .invert(x, y)
            .and_then(|(sr, sc)| sample(source, sr, sc, kernel))
    });
    let missing = sampled.iter().filter(|v| v.is_none()).count();
    let data = sampled.mapv(|v| v.unwrap_or(nodata));

    if missing > 0 {
        log::warn!("{} aligned cells have no ground value", missing);
    }

    let crs = if target.crs.is_empty() {
        source.crs.clone()
    } else {
        target.crs.clone()
    };
    Ok(HeightRaster::new(data, target.transform, Some(nodata), crs))
}

/// Ground grid on the surface grid; resampled only when the grids differ.
pub fn align_ground(
    surface: &HeightRaster,
    ground: &HeightRaster,
    kernel: Resampling,
    nodata: f64,
) -> PeakResult<HeightRaster> {
    check_crs(surface, ground)?;
    if surface.shape() == ground.shape() && surface.transform == ground.transform {
        log::debug!("Ground grid already aligned, skipping resampling");
        return Ok(ground.clone());
    }
    align_to_grid(ground, surface, kernel, nodata)
}

/// Ground grid aligned to the surface grid, followed by the nodata-safe difference.
pub fn prepare_ndsm(
    surface: &HeightRaster,
    ground: &HeightRaster,
    kernel: Resampling,
    nodata: f64,
) -> PeakResult<HeightRaster> {
    let aligned = align_ground(surface, ground, kernel, nodata)?;
    compute_ndsm(surface, &aligned, nodata)
}
