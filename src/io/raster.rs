use crate::types::{GeoTransform, HeightRaster, LabelGrid, PeakError, PeakResult, PixelWindow};
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Single-band GeoTIFF reader/writer for height and label grids
pub struct GeoTiff;

impl GeoTiff {
    /// Read band 1 of a raster as heights.
    pub fn read<P: AsRef<Path>>(path: P) -> PeakResult<HeightRaster> {
        Self::read_window(path, None)
    }

    /// Read band 1, optionally restricted to a pixel window.
    ///
    /// The returned transform is the one of the window origin.
    pub fn read_window<P: AsRef<Path>>(path: P, window: Option<PixelWindow>) -> PeakResult<HeightRaster> {
        log::info!("Reading raster from: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let full_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();
        let window = window.unwrap_or_else(|| PixelWindow::full((height, width)));

        if window.is_empty()
            || window.row_off + window.rows > height
            || window.col_off + window.cols > width
        {
            return Err(PeakError::Processing(format!(
                "window {:?} outside raster of {}x{}",
                window, width, height
            )));
        }

        log::debug!("Raster size: {}x{}", width, height);
        log::debug!("Raster geotransform: {:?}", full_transform);

        let band = dataset.rasterband(1)?;
        let nodata = band.no_data_value();
        let buffer = band.read_as::<f64>(
            (window.col_off as isize, window.row_off as isize),
            (window.cols, window.rows),
            (window.cols, window.rows),
            None,
        )?;
        let data = Array2::from_shape_vec((window.rows, window.cols), buffer.data)
            .map_err(|e| PeakError::Processing(format!("Failed to reshape raster data: {}", e)))?;

        Ok(HeightRaster::new(
            data,
            full_transform.window(window.row_off, window.col_off),
            nodata,
            dataset.projection(),
        ))
    }

    /// Write heights as a float32 GeoTIFF with nodata.
    pub fn write_heights<P: AsRef<Path>>(raster: &HeightRaster, path: P) -> PeakResult<()> {
        log::info!("Saving height raster as GeoTIFF: {}", path.as_ref().display());
        let data = raster.data.mapv(|v| v as f32);
        write_band(&data, &raster.transform, &raster.crs, raster.nodata, path.as_ref())
    }

    /// Write a crown label grid as a uint32 GeoTIFF (0 = nodata).
    pub fn write_labels<P: AsRef<Path>>(
        labels: &LabelGrid,
        transform: &GeoTransform,
        crs: &str,
        path: P,
    ) -> PeakResult<()> {
        log::info!("Saving crown labels as GeoTIFF: {}", path.as_ref().display());
        write_band(labels, transform, crs, Some(0.0), path.as_ref())
    }
}

fn write_band<T: GdalType + Copy>(
    data: &Array2<T>,
    transform: &GeoTransform,
    crs: &str,
    nodata: Option<f64>,
    path: &Path,
) -> PeakResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = data.dim();
    let mut dataset = driver.create_with_band_type::<T, _>(path, width as isize, height as isize, 1)?;

    dataset.set_geo_transform(&transform.to_gdal())?;
    if !crs.is_empty() {
        dataset.set_projection(crs)?;
    }

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<T> = data.iter().copied().collect();
    let buffer = Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(nodata)?;

    log::debug!("Wrote {}x{} band", width, height);
    Ok(())
}
