//! # Batch Assembly
//!
//! Builds the fixed-schema [`Batch`] a forecasting model consumes from the three
//! archive datasets: two adjacent time steps (`i - 1`, `i`) of every surface and
//! atmospheric variable behind a singleton batch axis, plus time-invariant
//! static fields and the grid metadata.
//!
//! ## Layout
//!
//! | group    | shape                              |
//! |----------|------------------------------------|
//! | surface  | `[1, history, lat, lon]`           |
//! | static   | `[lat, lon]`                       |
//! | atmos    | `[1, history, level, lat, lon]`    |
//!
//! An assembled input batch has `history == 2`; model predictions have
//! `history == 1`.

use crate::config::{AssembleConfig, VariableMapping};
use crate::dataset::{Dataset, DatasetError};
use chrono::NaiveDateTime;
use log::{debug, info};
use ndarray::{Array1, Array2, Array4, Array5, ArrayD, Axis, Ix2, Ix4, Ix5, Slice};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("Time index {index} out of range: need 1 <= i < {steps} to select steps i-1 and i")]
    TimeIndexOutOfRange { index: usize, steps: usize },

    #[error("Variable '{key}' has shape {found:?}, expected {expected}")]
    Shape {
        key: String,
        expected: String,
        found: Vec<usize>,
    },
}

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
    /// One timestamp per batch element
    pub time: Vec<NaiveDateTime>,
    pub atmos_levels: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub surf_vars: BTreeMap<String, Array4<f32>>,
    pub static_vars: BTreeMap<String, Array2<f32>>,
    pub atmos_vars: BTreeMap<String, Array5<f32>>,
    pub metadata: Metadata,
}

impl Batch {
    /// `(lat, lon)` grid size.
    pub fn spatial_shape(&self) -> (usize, usize) {
        (self.metadata.lat.len(), self.metadata.lon.len())
    }

    /// Length of the time axis shared by the surface and atmospheric variables.
    pub fn history_len(&self) -> usize {
        self.surf_vars
            .values()
            .map(|a| a.len_of(Axis(1)))
            .chain(self.atmos_vars.values().map(|a| a.len_of(Axis(1))))
            .next()
            .unwrap_or(0)
    }

    /// Timestamp of the first (and usually only) batch element.
    pub fn time(&self) -> Option<NaiveDateTime> {
        self.metadata.time.first().copied()
    }

    /// Keeps only the last `steps` time steps of every time-dependent variable.
    pub fn tail(&self, steps: usize) -> Batch {
        let keep = |len: usize| Slice::from(len.saturating_sub(steps)..len);
        Batch {
            surf_vars: self
                .surf_vars
                .iter()
                .map(|(k, a)| (k.clone(), a.slice_axis(Axis(1), keep(a.len_of(Axis(1)))).to_owned()))
                .collect(),
            static_vars: self.static_vars.clone(),
            atmos_vars: self
                .atmos_vars
                .iter()
                .map(|(k, a)| (k.clone(), a.slice_axis(Axis(1), keep(a.len_of(Axis(1)))).to_owned()))
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    /// Human-readable listing of every array shape and the metadata.
    pub fn shape_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Surface variables:");
        for (key, array) in &self.surf_vars {
            let _ = writeln!(out, "  {:<6} {:?}", key, array.shape());
        }
        let _ = writeln!(out, "Static variables:");
        for (key, array) in &self.static_vars {
            let _ = writeln!(out, "  {:<6} {:?}", key, array.shape());
        }
        let _ = writeln!(out, "Atmospheric variables:");
        for (key, array) in &self.atmos_vars {
            let _ = writeln!(out, "  {:<6} {:?}", key, array.shape());
        }

        let (lat, lon) = self.spatial_shape();
        let times: Vec<String> = self
            .metadata
            .time
            .iter()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
            .collect();
        let _ = writeln!(out, "Metadata:");
        let _ = writeln!(out, "  lat    {} points", lat);
        let _ = writeln!(out, "  lon    {} points", lon);
        let _ = writeln!(out, "  time   {}", times.join(", "));
        let _ = write!(out, "  levels {:?}", self.metadata.atmos_levels);
        out
    }
}

/// Assembles the batch for current time step `time_index`.
///
/// `time_index` must satisfy `1 <= i < n` where `n` is the length of the
/// surface dataset's time coordinate; `i = 0` has no previous step and is
/// rejected rather than wrapped around.
pub fn assemble_batch(
    config: &AssembleConfig,
    static_ds: &dyn Dataset,
    surf_ds: &dyn Dataset,
    atmos_ds: &dyn Dataset,
    time_index: usize,
) -> BatchResult<Batch> {
    let times = surf_ds.times(&config.time_coordinate)?;
    if time_index == 0 || time_index >= times.len() {
        return Err(BatchError::TimeIndexOutOfRange {
            index: time_index,
            steps: times.len(),
        });
    }

    let lat = surf_ds.coordinate(&config.latitude_coordinate)?;
    let lon = surf_ds.coordinate(&config.longitude_coordinate)?;
    let atmos_levels: Vec<i64> = atmos_ds
        .coordinate(&config.level_coordinate)?
        .iter()
        .map(|level| level.round() as i64)
        .collect();
    let grid = (lat.len(), lon.len());

    info!(
        "Assembling batch at {} (steps {} and {}) on a {}x{} grid",
        times[time_index],
        time_index - 1,
        time_index,
        grid.0,
        grid.1
    );

    let mut surf_vars = BTreeMap::new();
    for VariableMapping { key, source } in &config.surface_variables {
        let pair = history_pair(key, surf_ds.variable(source)?, time_index)?;
        let found = pair.shape().to_vec();
        let array = pair
            .into_dimensionality::<Ix4>()
            .map_err(|_| shape_error(key, "[time, lat, lon]", &found))?;
        check_grid(key, array.shape(), grid)?;
        debug!("surface {} <- {} {:?}", key, source, array.shape());
        surf_vars.insert(key.clone(), array);
    }

    let mut static_vars = BTreeMap::new();
    for VariableMapping { key, source } in &config.static_variables {
        let data = static_ds.variable(source)?;
        let field = first_step(key, data)?;
        check_grid(key, field.shape(), grid)?;
        debug!("static {} <- {} {:?}", key, source, field.shape());
        static_vars.insert(key.clone(), field);
    }

    let mut atmos_vars = BTreeMap::new();
    for VariableMapping { key, source } in &config.atmospheric_variables {
        let pair = history_pair(key, atmos_ds.variable(source)?, time_index)?;
        let found = pair.shape().to_vec();
        let array = pair
            .into_dimensionality::<Ix5>()
            .map_err(|_| shape_error(key, "[time, level, lat, lon]", &found))?;
        check_grid(key, array.shape(), grid)?;
        if array.len_of(Axis(2)) != atmos_levels.len() {
            return Err(shape_error(
                key,
                &format!("{} pressure levels", atmos_levels.len()),
                array.shape(),
            ));
        }
        debug!("atmospheric {} <- {} {:?}", key, source, array.shape());
        atmos_vars.insert(key.clone(), array);
    }

    Ok(Batch {
        surf_vars,
        static_vars,
        atmos_vars,
        metadata: Metadata {
            lat,
            lon,
            time: vec![times[time_index]],
            atmos_levels,
        },
    })
}

/// Steps `i - 1` and `i` of the leading time axis, behind a new batch axis.
fn history_pair(key: &str, data: ArrayD<f32>, time_index: usize) -> BatchResult<ArrayD<f32>> {
    let steps = data.shape().first().copied().unwrap_or(0);
    if time_index == 0 || time_index >= steps {
        return Err(BatchError::TimeIndexOutOfRange {
            index: time_index,
            steps,
        });
    }
    let pair = data
        .slice_axis(Axis(0), Slice::from(time_index - 1..time_index + 1))
        .to_owned();
    debug!("{}: selected steps {}..={}", key, time_index - 1, time_index);
    Ok(pair.insert_axis(Axis(0)))
}

/// First time step of a static field; a field stored without a time axis is
/// taken as is.
fn first_step(key: &str, data: ArrayD<f32>) -> BatchResult<Array2<f32>> {
    let field = match data.ndim() {
        2 => data,
        3 if data.len_of(Axis(0)) > 0 => data.index_axis(Axis(0), 0).to_owned(),
        _ => return Err(shape_error(key, "[time, lat, lon] or [lat, lon]", data.shape())),
    };
    field
        .into_dimensionality::<Ix2>()
        .map_err(|_| shape_error(key, "[lat, lon]", &[]))
}

fn check_grid(key: &str, shape: &[usize], (lat, lon): (usize, usize)) -> BatchResult<()> {
    match shape {
        [.., rows, cols] if *rows == lat && *cols == lon => Ok(()),
        _ => Err(shape_error(key, &format!("trailing grid [{}, {}]", lat, lon), shape)),
    }
}

fn shape_error(key: &str, expected: &str, found: &[usize]) -> BatchError {
    BatchError::Shape {
        key: key.to_string(),
        expected: expected.to_string(),
        found: found.to_vec(),
    }
}
