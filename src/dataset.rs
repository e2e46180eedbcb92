//! # Dataset Access
//!
//! The batch assembler only needs three things from an opened file: a named
//! variable as an n-dimensional array, a named 1-D coordinate, and a decoded
//! time coordinate. [`Dataset`] captures exactly that, with a NetCDF
//! implementation for archive downloads and an in-memory one for tests and
//! synthetic inputs.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::debug;
use ndarray::{Array1, ArrayD, Ix1};
use netcdf::AttributeValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to open NetCDF file {path}: {source}")]
    Open {
        path: PathBuf,
        source: netcdf::Error,
    },

    #[error("Variable '{name}' not found in {dataset}")]
    MissingVariable { dataset: String, name: String },

    #[error("Attribute '{attribute}' missing on variable '{variable}'")]
    MissingAttribute { variable: String, attribute: String },

    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("Unexpected shape for '{name}': {detail}")]
    Shape { name: String, detail: String },

    #[error("Unsupported time units '{0}'")]
    TimeUnits(String),

    #[error("Time value {value} {reason}")]
    TimeValue { value: f64, reason: &'static str },
}

pub type DatasetResult<T> = Result<T, DatasetError>;

pub trait Dataset {
    /// Short label used in error messages and logs
    fn label(&self) -> String;

    /// Full contents of a data variable, unpacked to physical values
    fn variable(&self, name: &str) -> DatasetResult<ArrayD<f32>>;

    /// A one-dimensional coordinate variable
    fn coordinate(&self, name: &str) -> DatasetResult<Array1<f64>>;

    /// A time coordinate decoded to calendar timestamps (whole seconds)
    fn times(&self, name: &str) -> DatasetResult<Vec<NaiveDateTime>>;
}

/// Units of a CF `"<unit> since <epoch>"` time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn to_seconds_multiplier(&self) -> f64 {
        match self {
            TimeUnit::Microseconds => 1e-6,
            TimeUnit::Milliseconds => 1e-3,
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
            TimeUnit::Days => 86400.0,
        }
    }

    fn parse(unit: &str) -> Option<Self> {
        match unit.to_ascii_lowercase().as_str() {
            "microseconds" | "microsecond" | "us" => Some(TimeUnit::Microseconds),
            "milliseconds" | "millisecond" | "ms" => Some(TimeUnit::Milliseconds),
            "seconds" | "second" | "secs" | "sec" | "s" => Some(TimeUnit::Seconds),
            "minutes" | "minute" | "mins" | "min" => Some(TimeUnit::Minutes),
            "hours" | "hour" | "hrs" | "hr" | "h" => Some(TimeUnit::Hours),
            "days" | "day" | "d" => Some(TimeUnit::Days),
            _ => None,
        }
    }
}

/// Parses CF time units such as `seconds since 1970-01-01` or
/// `hours since 1900-01-01 00:00:00.0`.
pub fn parse_time_units(units: &str) -> DatasetResult<(TimeUnit, NaiveDateTime)> {
    let invalid = || DatasetError::TimeUnits(units.to_string());
    let (unit, epoch) = units.split_once(" since ").ok_or_else(invalid)?;
    let unit = TimeUnit::parse(unit.trim()).ok_or_else(invalid)?;

    let epoch = epoch.trim().trim_end_matches(" UTC").trim_end_matches('Z');
    let formats = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let parsed = formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(epoch, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(epoch, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(invalid)?;

    Ok((unit, parsed))
}

/// Offsets from the epoch, floored to whole seconds. Non-finite offsets and
/// instants outside the calendar range are errors.
pub fn decode_times(
    values: &[f64],
    unit: TimeUnit,
    epoch: NaiveDateTime,
) -> DatasetResult<Vec<NaiveDateTime>> {
    values
        .iter()
        .map(|&value| {
            let seconds = (value * unit.to_seconds_multiplier()).floor();
            if !seconds.is_finite() {
                return Err(DatasetError::TimeValue {
                    value,
                    reason: "is not a finite offset",
                });
            }
            // the cast saturates; try_seconds rejects what is left out of range
            TimeDelta::try_seconds(seconds as i64)
                .and_then(|offset| epoch.checked_add_signed(offset))
                .ok_or(DatasetError::TimeValue {
                    value,
                    reason: "falls outside the representable date range",
                })
        })
        .collect()
}

pub struct NetcdfDataset {
    path: PathBuf,
    file: netcdf::File,
}

impl NetcdfDataset {
    pub fn open<P: AsRef<Path>>(path: P) -> DatasetResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening NetCDF dataset: {:?}", path);
        let file = netcdf::open(&path).map_err(|source| DatasetError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, file })
    }

    fn lookup(&self, name: &str) -> DatasetResult<netcdf::Variable<'_>> {
        self.file
            .variable(name)
            .ok_or_else(|| DatasetError::MissingVariable {
                dataset: self.label(),
                name: name.to_string(),
            })
    }
}

impl Dataset for NetcdfDataset {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn variable(&self, name: &str) -> DatasetResult<ArrayD<f32>> {
        let var = self.lookup(name)?;
        let mut data = var.get::<f32, _>(..)?;

        let fill = numeric_attribute(&var, "_FillValue").map(|v| v as f32);
        let scale = numeric_attribute(&var, "scale_factor");
        let offset = numeric_attribute(&var, "add_offset");

        if fill.is_some() || scale.is_some() || offset.is_some() {
            let scale = scale.unwrap_or(1.0);
            let offset = offset.unwrap_or(0.0);
            data.mapv_inplace(|raw| {
                if fill == Some(raw) {
                    f32::NAN
                } else {
                    (raw as f64 * scale + offset) as f32
                }
            });
        }

        debug!("Read {} {:?} from {}", name, data.shape(), self.label());
        Ok(data)
    }

    fn coordinate(&self, name: &str) -> DatasetResult<Array1<f64>> {
        let var = self.lookup(name)?;
        let values = var.get::<f64, _>(..)?;
        values
            .into_dimensionality::<Ix1>()
            .map_err(|e| DatasetError::Shape {
                name: name.to_string(),
                detail: e.to_string(),
            })
    }

    fn times(&self, name: &str) -> DatasetResult<Vec<NaiveDateTime>> {
        let var = self.lookup(name)?;
        let units = match var.attribute("units").map(|a| a.value()) {
            Some(Ok(AttributeValue::Str(units))) => units,
            _ => {
                return Err(DatasetError::MissingAttribute {
                    variable: name.to_string(),
                    attribute: "units".to_string(),
                });
            }
        };
        let (unit, epoch) = parse_time_units(&units)?;
        let values = self.coordinate(name)?.to_vec();
        decode_times(&values, unit, epoch)
    }
}

fn numeric_attribute(var: &netcdf::Variable, name: &str) -> Option<f64> {
    match var.attribute(name)?.value().ok()? {
        AttributeValue::Double(v) => Some(v),
        AttributeValue::Float(v) => Some(v as f64),
        AttributeValue::Short(v) => Some(v as f64),
        AttributeValue::Int(v) => Some(v as f64),
        AttributeValue::Doubles(v) => v.first().copied(),
        AttributeValue::Floats(v) => v.first().map(|x| *x as f64),
        _ => None,
    }
}

/// Dataset held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    name: String,
    variables: HashMap<String, ArrayD<f32>>,
    coordinates: HashMap<String, Array1<f64>>,
    times: HashMap<String, Vec<NaiveDateTime>>,
}

impl MemoryDataset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: &str, data: ArrayD<f32>) -> Self {
        self.variables.insert(name.to_string(), data);
        self
    }

    pub fn with_coordinate(mut self, name: &str, values: Array1<f64>) -> Self {
        self.coordinates.insert(name.to_string(), values);
        self
    }

    pub fn with_times(mut self, name: &str, times: Vec<NaiveDateTime>) -> Self {
        self.times.insert(name.to_string(), times);
        self
    }

    fn missing(&self, name: &str) -> DatasetError {
        DatasetError::MissingVariable {
            dataset: self.name.clone(),
            name: name.to_string(),
        }
    }
}

impl Dataset for MemoryDataset {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn variable(&self, name: &str) -> DatasetResult<ArrayD<f32>> {
        self.variables.get(name).cloned().ok_or_else(|| self.missing(name))
    }

    fn coordinate(&self, name: &str) -> DatasetResult<Array1<f64>> {
        self.coordinates.get(name).cloned().ok_or_else(|| self.missing(name))
    }

    fn times(&self, name: &str) -> DatasetResult<Vec<NaiveDateTime>> {
        self.times.get(name).cloned().ok_or_else(|| self.missing(name))
    }
}
