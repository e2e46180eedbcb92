//! # Configuration
//!
//! Every constant the three workflows need (dates, paths, variable lists, the
//! city to plot) lives in [`AppConfig`]. Defaults reproduce the reference
//! experiment: ERA5 for 2023-01-01, time index 1, a Delhi comparison plot for
//! 11 June 2022 12:00. Any subset of fields can be overridden from a JSON or
//! YAML file; missing fields keep their defaults.
//!
//! ```rust
//! use era5lab::config::AppConfig;
//!
//! let yaml = r#"
//! plot:
//!   city: Mumbai
//! assemble:
//!   time_index: 2
//! "#;
//! let config = AppConfig::from_yaml(yaml)?;
//! assert_eq!(config.plot.city, "Mumbai");
//! assert_eq!(config.assemble.time_index, 2);
//! assert_eq!(config.fetch.pressure_levels.len(), 13);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::window::BoxOffsets;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub fetch: FetchConfig,
    pub assemble: AssembleConfig,
    pub plot: PlotConfig,
}

/// Name of the time-invariant fields file, the same for every day.
pub const STATIC_FILE: &str = "static.nc";

/// Surface-level file for `date`, as written by fetch and read by assemble.
pub fn surface_file_name(date: NaiveDate) -> String {
    format!("{}-surface-level.nc", date)
}

/// Pressure-level file for `date`, as written by fetch and read by assemble.
pub fn atmospheric_file_name(date: NaiveDate) -> String {
    format!("{}-atmospheric.nc", date)
}

fn experiment_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default()
}

/// What to request from the reanalysis archive and where to put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Local directory or `s3://bucket/prefix` receiving the three files
    pub output_dir: String,
    pub date: NaiveDate,
    pub static_time: String,
    pub times: Vec<String>,
    pub pressure_levels: Vec<u32>,
    pub single_level_product: String,
    pub pressure_level_product: String,
    pub static_variables: Vec<String>,
    pub surface_variables: Vec<String>,
    pub atmospheric_variables: Vec<String>,
    /// Archive-side file format
    pub format: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            output_dir: "data/era5".to_string(),
            date: experiment_date(),
            static_time: "00:00".to_string(),
            times: strings(&["00:00", "06:00", "12:00", "18:00"]),
            pressure_levels: vec![50, 100, 150, 200, 250, 300, 400, 500, 600, 700, 850, 925, 1000],
            single_level_product: "reanalysis-era5-single-levels".to_string(),
            pressure_level_product: "reanalysis-era5-pressure-levels".to_string(),
            static_variables: strings(&["geopotential", "land_sea_mask", "soil_type"]),
            surface_variables: strings(&[
                "2m_temperature",
                "10m_u_component_of_wind",
                "10m_v_component_of_wind",
                "mean_sea_level_pressure",
            ]),
            atmospheric_variables: strings(&[
                "temperature",
                "u_component_of_wind",
                "v_component_of_wind",
                "specific_humidity",
                "geopotential",
            ]),
            format: "netcdf".to_string(),
        }
    }
}

/// Maps a batch key (e.g. `2t`) to the variable name inside the file (e.g. `t2m`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub key: String,
    pub source: String,
}

impl VariableMapping {
    pub fn new(key: &str, source: &str) -> Self {
        Self {
            key: key.to_string(),
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssembleConfig {
    pub data_dir: String,
    /// Day whose downloaded files are read
    pub date: NaiveDate,
    /// Current time step; the step before it is the history step
    pub time_index: usize,
    pub time_coordinate: String,
    pub latitude_coordinate: String,
    pub longitude_coordinate: String,
    pub level_coordinate: String,
    pub surface_variables: Vec<VariableMapping>,
    pub static_variables: Vec<VariableMapping>,
    pub atmospheric_variables: Vec<VariableMapping>,
    pub rollout: RolloutConfig,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/era5".to_string(),
            date: experiment_date(),
            time_index: 1,
            time_coordinate: "valid_time".to_string(),
            latitude_coordinate: "latitude".to_string(),
            longitude_coordinate: "longitude".to_string(),
            level_coordinate: "pressure_level".to_string(),
            surface_variables: vec![
                VariableMapping::new("2t", "t2m"),
                VariableMapping::new("10u", "u10"),
                VariableMapping::new("10v", "v10"),
                VariableMapping::new("msl", "msl"),
            ],
            static_variables: vec![
                VariableMapping::new("z", "z"),
                VariableMapping::new("slt", "slt"),
                VariableMapping::new("lsm", "lsm"),
            ],
            atmospheric_variables: vec![
                VariableMapping::new("t", "t"),
                VariableMapping::new("u", "u"),
                VariableMapping::new("v", "v"),
                VariableMapping::new("q", "q"),
                VariableMapping::new("z", "z"),
            ],
            rollout: RolloutConfig::default(),
        }
    }
}

impl AssembleConfig {
    pub fn static_path(&self) -> PathBuf {
        expand_home(&self.data_dir).join(STATIC_FILE)
    }

    pub fn surface_path(&self) -> PathBuf {
        expand_home(&self.data_dir).join(surface_file_name(self.date))
    }

    pub fn atmospheric_path(&self) -> PathBuf {
        expand_home(&self.data_dir).join(atmospheric_file_name(self.date))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Number of forecast steps; 0 disables the rollout
    pub steps: usize,
    pub lead_time_hours: i64,
    /// Where predictions are written; nothing is exported when unset
    pub export_dir: Option<String>,
    /// File name prefix for exported GeoTIFFs, matching the plot prediction label
    pub geotiff_prefix: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            steps: 0,
            lead_time_hours: 6,
            export_dir: None,
            geotiff_prefix: "aurora".to_string(),
        }
    }
}

/// One raster band to compare, with the name used in titles and file names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotVariable {
    pub band: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotConfig {
    pub city: String,
    /// Date tag of the raster pair, `DD_MM_YY_HH`
    pub date_str: String,
    pub results_dir: String,
    pub plots_dir: String,
    pub prediction_label: String,
    pub reference_label: String,
    pub difference_label: String,
    pub prediction_title: String,
    pub reference_title: String,
    pub difference_title: String,
    pub offsets: BoxOffsets,
    pub variables: Vec<PlotVariable>,
    /// Variables whose name contains this get °C tick labels
    pub temperature_marker: String,
    pub font_path: String,
    pub figure_size: u32,
    pub geocoder_url: String,
    pub user_agent: String,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            city: "Delhi".to_string(),
            date_str: "11_06_22_12".to_string(),
            results_dir: "results".to_string(),
            plots_dir: "plots".to_string(),
            prediction_label: "aurora".to_string(),
            reference_label: "hres".to_string(),
            difference_label: "error".to_string(),
            prediction_title: "Aurora Prediction".to_string(),
            reference_title: "HRES Model".to_string(),
            difference_title: "Error".to_string(),
            offsets: BoxOffsets::default(),
            variables: vec![PlotVariable {
                band: 0,
                name: "Temperature (2m)".to_string(),
            }],
            temperature_marker: "Temp".to_string(),
            font_path: "/usr/share/fonts/truetype/dejavu/DejaVuSerif.ttf".to_string(),
            figure_size: 1000,
            geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: "era5_downloader".to_string(),
        }
    }
}

impl PlotConfig {
    pub fn prediction_raster(&self) -> PathBuf {
        expand_home(&self.results_dir).join(format!("{}_{}.tif", self.prediction_label, self.date_str))
    }

    pub fn reference_raster(&self) -> PathBuf {
        expand_home(&self.results_dir).join(format!("{}_{}.tif", self.reference_label, self.date_str))
    }
}

impl AppConfig {
    /// Loads a configuration file; `.yaml`/`.yml` are read as YAML, anything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = if is_yaml_path(path) {
            Self::from_yaml(&content)?
        } else {
            Self::from_json(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json_str: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json_str)?)
    }

    pub fn from_yaml(yaml_str: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Rejects configurations no workflow could run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.fetch.times.is_empty() {
            return Err(ConfigError::Invalid("fetch.times must not be empty".to_string()));
        }
        if self.fetch.pressure_levels.is_empty() {
            return Err(ConfigError::Invalid(
                "fetch.pressure_levels must not be empty".to_string(),
            ));
        }
        if self.plot.variables.is_empty() {
            return Err(ConfigError::Invalid("plot.variables must not be empty".to_string()));
        }
        if self.plot.figure_size < 200 {
            return Err(ConfigError::Invalid(format!(
                "plot.figure_size must be at least 200 pixels, got {}",
                self.plot.figure_size
            )));
        }
        if self.assemble.rollout.lead_time_hours <= 0 {
            return Err(ConfigError::Invalid(
                "assemble.rollout.lead_time_hours must be positive".to_string(),
            ));
        }
        self.plot.offsets.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

pub fn is_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_experiment() {
        let config = AppConfig::default();
        assert_eq!(config.fetch.times.len(), 4);
        assert_eq!(config.fetch.pressure_levels.first(), Some(&50));
        assert_eq!(config.fetch.pressure_levels.last(), Some(&1000));
        assert_eq!(config.assemble.time_index, 1);
        assert_eq!(config.assemble.surface_variables[0], VariableMapping::new("2t", "t2m"));
        assert_eq!(config.plot.city, "Delhi");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_assemble_reads_the_files_fetch_writes() {
        let mut config = AppConfig::default();
        config.fetch.output_dir = "downloads".to_string();
        config.assemble.data_dir = "downloads".to_string();
        let date = NaiveDate::from_ymd_opt(2022, 6, 11).unwrap();
        config.fetch.date = date;
        config.assemble.date = date;

        let targets: Vec<PathBuf> = config
            .fetch
            .requests()
            .into_iter()
            .map(|request| PathBuf::from(request.target))
            .collect();
        assert_eq!(
            targets,
            vec![
                config.assemble.static_path(),
                config.assemble.surface_path(),
                config.assemble.atmospheric_path(),
            ]
        );
        assert_eq!(
            config.assemble.surface_path(),
            PathBuf::from("downloads/2022-06-11-surface-level.nc")
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "fetch": { "output_dir": "s3://bucket/era5", "date": "2024-02-29" } }"#;
        let config = AppConfig::from_json(json).unwrap();
        assert_eq!(config.fetch.output_dir, "s3://bucket/era5");
        assert_eq!(config.fetch.date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(config.fetch.surface_variables.len(), 4);
        assert_eq!(config.plot, PlotConfig::default());
    }

    #[test]
    fn test_template_round_trips() {
        let config = AppConfig::default();
        let from_json = AppConfig::from_json(&config.to_json().unwrap()).unwrap();
        let from_yaml = AppConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(from_json, config);
        assert_eq!(from_yaml, config);
    }

    #[test]
    fn test_validation_rejects_empty_plot_variables() {
        let mut config = AppConfig::default();
        config.plot.variables.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file_detects_format() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let yaml_path = dir.path().join("era5lab.yaml");
        fs::write(&yaml_path, "plot:\n  city: Chennai\n")?;
        assert_eq!(AppConfig::from_file(&yaml_path)?.plot.city, "Chennai");

        let json_path = dir.path().join("era5lab.json");
        fs::write(&json_path, r#"{"plot": {"city": "Kolkata"}}"#)?;
        assert_eq!(AppConfig::from_file(&json_path)?.plot.city, "Kolkata");

        let missing = AppConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
        Ok(())
    }

    #[test]
    fn test_raster_paths_follow_labels() {
        let plot = PlotConfig::default();
        assert_eq!(plot.prediction_raster(), PathBuf::from("results/aurora_11_06_22_12.tif"));
        assert_eq!(plot.reference_raster(), PathBuf::from("results/hres_11_06_22_12.tif"));
    }
}
