//! # CLI Module
//!
//! Command-line interface for era5lab:
//! - Argument parsing with clap
//! - Configuration file loading (JSON/YAML)
//! - Environment variables with the `ERA5LAB_` prefix
//! - Priority: command line > environment > configuration file > defaults

use crate::config::AppConfig;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;
use std::path::{Path, PathBuf};

/// ERA5 download, batch assembly and comparison plotting
#[derive(Parser, Debug)]
#[command(name = "era5lab")]
#[command(about = "Fetch ERA5 data, assemble model batches and plot forecast comparisons")]
#[command(version)]
#[command(long_about = "
era5lab supports experiments with a pretrained weather forecasting model on ERA5
reanalysis data.

COMMANDS:
  • fetch: download static, surface and pressure-level ERA5 files for one day
  • assemble: build the two-step model input batch, optionally roll it forward
  • plot: compare a prediction and a reference GeoTIFF around a city

EXAMPLES:
  # Download the default day into data/era5 (skips files already present)
  era5lab fetch

  # Download into S3
  era5lab fetch --output-dir s3://bucket/era5 --date 2023-01-01

  # Assemble time step 1 and roll forward two steps
  era5lab assemble --time-index 1 --rollout-steps 2 --export-dir results

  # Plot around a city
  era5lab plot --city Delhi --date-str 11_06_22_12

  # Start from a configuration template
  era5lab template --format yaml -o era5lab.yaml
  era5lab --config era5lab.yaml plot
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, global = true, env = "ERA5LAB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download the ERA5 datasets
    #[command(long_about = "
Download the static, surface-level and pressure-level ERA5 datasets for one day
from the Copernicus Climate Data Store.

A dataset whose target file already exists is skipped without contacting the
archive. Credentials are read from CDSAPI_URL/CDSAPI_KEY or ~/.cdsapirc.

EXAMPLES:
  era5lab fetch
  era5lab fetch --output-dir s3://bucket/era5 --date 2023-06-11
  era5lab fetch --dry-run
")]
    Fetch {
        /// Directory or s3:// prefix receiving the files
        #[arg(short, long, env = "ERA5LAB_DATA_DIR")]
        output_dir: Option<String>,

        /// Day to download (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,

        /// Print the requests without downloading
        #[arg(long)]
        dry_run: bool,
    },

    /// Assemble a model input batch and optionally run a rollout
    #[command(long_about = "
Assemble the two-step input batch (time steps i-1 and i) from the downloaded
files and print its layout. With --rollout-steps, roll the forecast model
forward; with --export-dir, write every prediction as NetCDF and GeoTIFF.

EXAMPLES:
  era5lab assemble
  era5lab assemble --data-dir data/era5 --time-index 2
  era5lab assemble --date 2022-06-11
  era5lab assemble --rollout-steps 2 --export-dir results
")]
    Assemble {
        /// Directory or s3:// prefix holding the downloaded files
        #[arg(short, long, env = "ERA5LAB_DATA_DIR")]
        data_dir: Option<String>,

        /// Day whose downloaded files are read (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,

        /// Current time step (must be at least 1)
        #[arg(short = 'i', long)]
        time_index: Option<usize>,

        /// Number of forecast steps to roll out
        #[arg(long)]
        rollout_steps: Option<usize>,

        /// Directory receiving exported predictions
        #[arg(long)]
        export_dir: Option<String>,
    },

    /// Plot prediction, reference and difference around a city
    #[command(long_about = "
Geocode a city, frame a bounding box around it, and render the prediction,
reference and difference figures for every configured raster band.

Rasters are read from <results-dir>/aurora_<date>.tif and
<results-dir>/hres_<date>.tif; figures are written to
<plots-dir>/<city>_<source>_<date>_<variable>.png.

EXAMPLES:
  era5lab plot
  era5lab plot --city Mumbai --date-str 11_06_22_12 --plots-dir figures
")]
    Plot {
        /// Place name to centre the plots on
        #[arg(long, env = "ERA5LAB_CITY")]
        city: Option<String>,

        /// Raster date tag (DD_MM_YY_HH)
        #[arg(long, value_parser = parse_date_str)]
        date_str: Option<String>,

        /// Directory holding the prediction and reference rasters
        #[arg(long)]
        results_dir: Option<String>,

        /// Directory receiving the figures
        #[arg(long)]
        plots_dir: Option<String>,
    },

    /// Write the default configuration
    Template {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts for bash, zsh, fish and PowerShell.

EXAMPLES:
  era5lab completions bash > ~/.bash_completion.d/era5lab
  era5lab completions zsh -o _era5lab
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl Cli {
    pub fn log_level(&self) -> Option<LevelFilter> {
        if self.verbose {
            Some(LevelFilter::Debug)
        } else if self.quiet {
            Some(LevelFilter::Error)
        } else {
            None
        }
    }

    /// Configuration file (or defaults) with this invocation's overrides applied.
    pub fn resolve_config(&self) -> Result<AppConfig> {
        let mut config = load_config(self.config.as_deref())?;
        apply_overrides(&mut config, &self.command);
        config.validate().context("Invalid configuration after overrides")?;
        Ok(config)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

/// Copies every flag given on the command line into `config`.
pub fn apply_overrides(config: &mut AppConfig, command: &Commands) {
    match command {
        Commands::Fetch { output_dir, date, .. } => {
            if let Some(dir) = output_dir {
                config.fetch.output_dir = dir.clone();
            }
            if let Some(date) = date {
                config.fetch.date = *date;
            }
        }
        Commands::Assemble {
            data_dir,
            date,
            time_index,
            rollout_steps,
            export_dir,
        } => {
            if let Some(dir) = data_dir {
                config.assemble.data_dir = dir.clone();
            }
            if let Some(date) = date {
                config.assemble.date = *date;
            }
            if let Some(index) = time_index {
                config.assemble.time_index = *index;
            }
            if let Some(steps) = rollout_steps {
                config.assemble.rollout.steps = *steps;
            }
            if export_dir.is_some() {
                config.assemble.rollout.export_dir = export_dir.clone();
            }
        }
        Commands::Plot {
            city,
            date_str,
            results_dir,
            plots_dir,
        } => {
            if let Some(city) = city {
                config.plot.city = city.clone();
            }
            if let Some(date_str) = date_str {
                config.plot.date_str = date_str.clone();
            }
            if let Some(dir) = results_dir {
                config.plot.results_dir = dir.clone();
            }
            if let Some(dir) = plots_dir {
                config.plot.plots_dir = dir.clone();
            }
        }
        Commands::Template { .. } | Commands::Completions { .. } => {}
    }
}

pub fn render_template(format: ConfigFormat) -> Result<String> {
    let config = AppConfig::default();
    let text = match format {
        ConfigFormat::Json => config.to_json()?,
        ConfigFormat::Yaml => config.to_yaml()?,
    };
    Ok(text)
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn parse_date_str(s: &str) -> Result<String, String> {
    crate::plot::format_date_label(s)
        .map(|_| s.to_string())
        .map_err(|e| e.to_string())
}
