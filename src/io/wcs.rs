use crate::types::{HeightRaster, PeakError, PeakResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// INSPIRE DGM1 coverage endpoint (credentials required)
pub const WCS_URL: &str = "https://geoservices.bayern.de/pro/wcs/dgm/v1/wcs_inspire_dgm1";
pub const COVERAGE_ID: &str = "EL.ElevationGridCoverage";
pub const SERVICE_CRS: &str = "EPSG:25832";

/// Axis label pairs tried in order
const AXIS_LABELS: [(&str, &str); 2] = [("E", "N"), ("X", "Y")];

/// Username/password for the elevation service
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// Explicit values, falling back to `LDBV_USER` / `LDBV_PASS`.
    pub fn resolve(user: Option<&str>, password: Option<&str>) -> PeakResult<Self> {
        Self::resolve_with(user, password, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        user: Option<&str>,
        password: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> PeakResult<Self> {
        let pick = |explicit: Option<&str>, key: &str| {
            explicit
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .or_else(|| env(key).filter(|s| !s.is_empty()))
        };
        match (pick(user, "LDBV_USER"), pick(password, "LDBV_PASS")) {
            (Some(user), Some(password)) => Ok(Self { user, password }),
            _ => Err(PeakError::MissingCredentials),
        }
    }
}

/// Bounds `(min_x, min_y, max_x, max_y)` grown by `buffer` on every side.
pub fn buffered_bounds(bounds: (f64, f64, f64, f64), buffer: f64) -> (f64, f64, f64, f64) {
    (
        bounds.0 - buffer,
        bounds.1 - buffer,
        bounds.2 + buffer,
        bounds.3 + buffer,
    )
}

/// Extent of `raster` in the service CRS, grown by `buffer` metres.
///
/// Bounds of a raster in another CRS are reprojected with densified edges. A
/// raster without CRS is taken to be in the service CRS already.
pub fn service_bounds(raster: &HeightRaster, buffer: f64) -> PeakResult<(f64, f64, f64, f64)> {
    let bounds = raster.bounds();
    let crs = raster.crs.trim();
    if crs.is_empty() {
        log::warn!("Surface raster has no CRS, assuming {}", SERVICE_CRS);
        return Ok(buffered_bounds(bounds, buffer));
    }

    let source = SpatialRef::from_definition(crs)?;
    let target = SpatialRef::from_definition(SERVICE_CRS)?;
    if source == target {
        return Ok(buffered_bounds(bounds, buffer));
    }

    // x = easting / longitude on both sides
    source.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    target.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    let transform = CoordTransform::new(&source, &target)?;
    let b = transform.transform_bounds(&[bounds.0, bounds.1, bounds.2, bounds.3], 21)?;
    log::debug!("Surface bounds {:?} reprojected to {:?} in {}", bounds, b, SERVICE_CRS);
    Ok(buffered_bounds((b[0], b[1], b[2], b[3]), buffer))
}

/// WCS 2.0.1 GetCoverage client for the terrain model
pub struct WcsClient {
    url: String,
    credentials: Credentials,
    timeout: Duration,
    pixel_m: f64,
}

impl WcsClient {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            url: WCS_URL.to_string(),
            credentials,
            timeout: Duration::from_secs(300),
            pixel_m: 1.0,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requested output pixel size in metres (drives `SCALESIZE`)
    pub fn with_pixel_size(mut self, pixel_m: f64) -> Self {
        self.pixel_m = pixel_m;
        self
    }

    /// Query parameters of one GetCoverage request.
    pub fn request_params(
        &self,
        bounds: (f64, f64, f64, f64),
        axes: (&str, &str),
        scale_size: bool,
    ) -> Vec<(&'static str, String)> {
        let (min_x, min_y, max_x, max_y) = bounds;
        let mut params = vec![
            ("SERVICE", "WCS".to_string()),
            ("REQUEST", "GetCoverage".to_string()),
            ("VERSION", "2.0.1".to_string()),
            ("COVERAGEID", COVERAGE_ID.to_string()),
            ("SUBSETTINGCRS", SERVICE_CRS.to_string()),
            ("OUTPUTCRS", SERVICE_CRS.to_string()),
            ("SUBSET", format!("{}({},{})", axes.0, min_x, max_x)),
            ("SUBSET", format!("{}({},{})", axes.1, min_y, max_y)),
            ("FORMAT", "image/tiff;application=geotiff".to_string()),
        ];
        if scale_size && self.pixel_m > 0.0 {
            let nx = (((max_x - min_x) / self.pixel_m).round() as i64).max(1);
            let ny = (((max_y - min_y) / self.pixel_m).round() as i64).max(1);
            params.push(("SCALESIZE", format!("{}({})", axes.0, nx)));
            params.push(("SCALESIZE", format!("{}({})", axes.1, ny)));
        }
        params
    }

    /// Download the terrain coverage for `bounds` (service CRS) to `out_path`.
    ///
    /// Each axis labelling is tried with `SCALESIZE`, then once more without it.
    pub fn download<P: AsRef<Path>>(&self, bounds: (f64, f64, f64, f64), out_path: P) -> PeakResult<PathBuf> {
        let out_path = out_path.as_ref();
        log::info!(
            "Downloading terrain model for ({:.3}, {:.3}, {:.3}, {:.3})",
            bounds.0,
            bounds.1,
            bounds.2,
            bounds.3
        );

        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("peakfinder/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut last_error = String::from("no request sent");
        for scale_size in [true, false] {
            for axes in AXIS_LABELS {
                match self.try_download_once(&client, bounds, axes, scale_size, out_path)? {
                    None => {
                        log::info!("Saved terrain model: {}", out_path.display());
                        return Ok(out_path.to_path_buf());
                    }
                    Some(reason) => {
                        log::warn!("{}", reason);
                        last_error = reason;
                    }
                }
            }
            if scale_size {
                log::warn!("Retrying without SCALESIZE (native resolution)");
            }
        }

        Err(PeakError::Remote(last_error))
    }

    /// One request; `Ok(Some(reason))` when the service rejected it.
    fn try_download_once(
        &self,
        client: &reqwest::blocking::Client,
        bounds: (f64, f64, f64, f64),
        axes: (&str, &str),
        scale_size: bool,
        out_path: &Path,
    ) -> PeakResult<Option<String>> {
        log::debug!("GetCoverage with axes {:?}, SCALESIZE: {}", axes, scale_size);

        let response = client
            .get(&self.url)
            .query(&self.request_params(bounds, axes, scale_size))
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .send()?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if status != reqwest::StatusCode::OK || !content_type.contains("tiff") {
            let body = response.text().unwrap_or_default();
            let snippet: String = body.chars().take(500).collect();
            return Ok(Some(format!(
                "WCS request with axes {:?} failed: status={} type={} msg={}",
                axes,
                status.as_u16(),
                content_type,
                snippet
            )));
        }

        let content = response.bytes()?;
        log::debug!("Downloaded {} bytes", content.len());
        std::fs::write(out_path, &content)?;
        Ok(None)
    }
}
