//! # Prediction Export
//!
//! Persists rollout predictions in two forms:
//!
//! - **NetCDF**: every variable of the batch's current step, CF time encoding,
//!   variables prefixed by group (`surf_2t`, `static_z`, `atmos_t`) since the
//!   static and atmospheric groups share short codes.
//! - **GeoTIFF**: the surface fields as one band each, named
//!   `{prefix}_{DD_MM_YY_HH}.tif`, which is exactly what the comparison plotter
//!   reads.

use crate::batch::{Batch, Metadata};
use crate::raster::{RasterError, write_geotiff};
use crate::window::AffineTransform;
use chrono::NaiveDateTime;
use log::{debug, info};
use ndarray::{Array2, Axis};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Date tag shared by exported file names and the plotter's `date_str`.
pub const DATE_TAG_FORMAT: &str = "%d_%m_%y_%H";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("NetCDF write error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("Failed to create directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Grid cannot be georeferenced: {0}")]
    Grid(String),

    #[error("Surface variable '{0}' not in batch")]
    MissingVariable(String),

    #[error("Batch has no timestamp")]
    MissingTime,
}

pub type ExportResult<T> = Result<T, ExportError>;

/// `{prefix}_{DD_MM_YY_HH}.{extension}`
pub fn file_name(prefix: &str, time: NaiveDateTime, extension: &str) -> String {
    format!("{}_{}.{}", prefix, time.format(DATE_TAG_FORMAT), extension)
}

/// Affine transform of a regular lat/lon grid given by its cell centres.
pub fn grid_transform(metadata: &Metadata) -> ExportResult<AffineTransform> {
    let (lat, lon) = (&metadata.lat, &metadata.lon);
    if lat.len() < 2 || lon.len() < 2 {
        return Err(ExportError::Grid(format!(
            "need at least 2 points per axis, got {}x{}",
            lat.len(),
            lon.len()
        )));
    }
    let x_size = lon[1] - lon[0];
    let y_size = lat[0] - lat[1];
    if x_size == 0.0 || y_size == 0.0 {
        return Err(ExportError::Grid("repeated coordinate values".to_string()));
    }
    Ok(AffineTransform::from_origin(
        lon[0] - x_size / 2.0,
        lat[0] + y_size / 2.0,
        x_size,
        y_size,
    ))
}

/// Writes the current step of every variable in `batch` to a NetCDF file.
pub fn write_prediction_netcdf<P: AsRef<Path>>(path: P, batch: &Batch) -> ExportResult<()> {
    let path = path.as_ref();
    let time = batch.time().ok_or(ExportError::MissingTime)?;
    let (n_lat, n_lon) = batch.spatial_shape();
    let current = batch.tail(1);

    let mut file = netcdf::create(path)?;
    file.add_dimension("time", 1)?;
    file.add_dimension("pressure_level", batch.metadata.atmos_levels.len())?;
    file.add_dimension("latitude", n_lat)?;
    file.add_dimension("longitude", n_lon)?;
    file.add_attribute("source", "era5lab rollout")?;

    let mut var = file.add_variable::<i64>("time", &["time"])?;
    var.put_attribute("units", "seconds since 1970-01-01")?;
    var.put_values(&[time.and_utc().timestamp()], ..)?;

    let mut var = file.add_variable::<i64>("pressure_level", &["pressure_level"])?;
    var.put_attribute("units", "hPa")?;
    var.put_values(&batch.metadata.atmos_levels, ..)?;

    let mut var = file.add_variable::<f64>("latitude", &["latitude"])?;
    var.put_attribute("units", "degrees_north")?;
    var.put_values(&batch.metadata.lat.to_vec(), ..)?;

    let mut var = file.add_variable::<f64>("longitude", &["longitude"])?;
    var.put_attribute("units", "degrees_east")?;
    var.put_values(&batch.metadata.lon.to_vec(), ..)?;

    for (key, array) in &current.surf_vars {
        let values: Vec<f32> = array.index_axis(Axis(0), 0).iter().copied().collect();
        let mut var = file.add_variable::<f32>(&format!("surf_{}", key), &["time", "latitude", "longitude"])?;
        var.put_values(&values, ..)?;
    }
    for (key, array) in &current.static_vars {
        let values: Vec<f32> = array.iter().copied().collect();
        let mut var = file.add_variable::<f32>(&format!("static_{}", key), &["latitude", "longitude"])?;
        var.put_values(&values, ..)?;
    }
    for (key, array) in &current.atmos_vars {
        let values: Vec<f32> = array.index_axis(Axis(0), 0).iter().copied().collect();
        let mut var = file.add_variable::<f32>(
            &format!("atmos_{}", key),
            &["time", "pressure_level", "latitude", "longitude"],
        )?;
        var.put_values(&values, ..)?;
    }

    debug!("Wrote NetCDF prediction {:?}", path);
    Ok(())
}

/// Writes the current step of the surface variables `keys`, in order, as
/// GeoTIFF bands.
pub fn write_surface_geotiff<P: AsRef<Path>>(path: P, batch: &Batch, keys: &[String]) -> ExportResult<()> {
    let transform = grid_transform(&batch.metadata)?;
    let current = batch.tail(1);

    let bands = keys
        .iter()
        .map(|key| {
            current
                .surf_vars
                .get(key)
                .map(|array| array.index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned())
                .ok_or_else(|| ExportError::MissingVariable(key.clone()))
        })
        .collect::<ExportResult<Vec<Array2<f32>>>>()?;

    write_geotiff(path.as_ref(), &bands, &transform)?;
    debug!("Wrote GeoTIFF prediction {:?} ({} bands)", path.as_ref(), bands.len());
    Ok(())
}

/// Writes both files for one prediction into `dir`, returning their paths.
pub fn export_prediction(
    dir: &Path,
    prefix: &str,
    batch: &Batch,
    keys: &[String],
) -> ExportResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let time = batch.time().ok_or(ExportError::MissingTime)?;

    let netcdf_path = dir.join(file_name(prefix, time, "nc"));
    write_prediction_netcdf(&netcdf_path, batch)?;

    let geotiff_path = dir.join(file_name(prefix, time, "tif"));
    write_surface_geotiff(&geotiff_path, batch, keys)?;

    info!("Exported prediction for {} to {:?}", time, dir);
    Ok(vec![netcdf_path, geotiff_path])
}
