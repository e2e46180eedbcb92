//! # era5lab
//!
//! Tooling around experiments with a pretrained weather forecasting model on
//! ERA5 reanalysis data.
//!
//! ## Workflows
//!
//! - **fetch**: download the static, surface-level and pressure-level ERA5
//!   files for one day, skipping any already present (local disk or S3)
//! - **assemble**: build the two-step [`batch::Batch`] a model consumes and
//!   optionally roll a [`model::ForecastModel`] forward, exporting predictions
//! - **plot**: compare a prediction GeoTIFF with a reference GeoTIFF around a
//!   city, writing prediction, reference and difference figures
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use era5lab::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = AppConfig::default();
//!     config.assemble.rollout.steps = 2;
//!
//!     era5lab::run_fetch(&config.fetch).await?;
//!     let report = era5lab::run_assemble(&config.assemble).await?;
//!     println!("{}", report.batch.shape_summary());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cds;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod export;
pub mod fetch;
pub mod geocode;
pub mod log;
pub mod model;
pub mod plot;
pub mod raster;
pub mod storage;
pub mod window;

#[cfg(test)]
mod tests;

use crate::batch::{Batch, assemble_batch};
use crate::cds::CdsClient;
use crate::config::{AssembleConfig, FetchConfig, PlotConfig};
use crate::dataset::NetcdfDataset;
use crate::export::export_prediction;
use crate::fetch::{ArchiveClient, DatasetRequest, FetchOutcome, Fetcher};
use crate::geocode::NominatimGeocoder;
use crate::model::{ForecastModel, PersistenceModel, rollout};
use crate::storage::{StorageBackend, StorageFactory};
use ::log::{debug, info};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Downloads the three configured datasets from the Climate Data Store.
pub async fn run_fetch(config: &FetchConfig) -> Result<Vec<(DatasetRequest, FetchOutcome)>> {
    let client = CdsClient::from_env().context("Failed to configure the CDS client")?;
    fetch_with(config, client).await
}

/// [`run_fetch`] with any archive client.
pub async fn fetch_with<C: ArchiveClient>(
    config: &FetchConfig,
    client: C,
) -> Result<Vec<(DatasetRequest, FetchOutcome)>> {
    let storage = StorageFactory::from_path(&config.output_dir)
        .await
        .with_context(|| format!("Failed to open storage at {}", config.output_dir))?;
    let fetcher = Fetcher::new(client, storage);

    let requests = config.requests();
    let outcomes = fetcher
        .fetch_all(&requests)
        .await
        .context("Archive retrieval failed")?;
    Ok(requests.into_iter().zip(outcomes).collect())
}

/// What `assemble` produced.
#[derive(Debug)]
pub struct AssembleReport {
    pub batch: Batch,
    pub predictions: usize,
    pub exported: Vec<PathBuf>,
}

/// Assembles the configured batch and runs the rollout with the persistence
/// baseline.
pub async fn run_assemble(config: &AssembleConfig) -> Result<AssembleReport> {
    let model = PersistenceModel::new(chrono::Duration::hours(config.rollout.lead_time_hours));
    assemble_with(config, &model).await
}

/// [`run_assemble`] with any forecast model.
pub async fn assemble_with<M: ForecastModel + ?Sized>(
    config: &AssembleConfig,
    model: &M,
) -> Result<AssembleReport> {
    let (_static_tmp, static_path) = stage_local(&config.static_path()).await?;
    let (_surf_tmp, surf_path) = stage_local(&config.surface_path()).await?;
    let (_atmos_tmp, atmos_path) = stage_local(&config.atmospheric_path()).await?;

    let static_ds = NetcdfDataset::open(&static_path)?;
    let surf_ds = NetcdfDataset::open(&surf_path)?;
    let atmos_ds = NetcdfDataset::open(&atmos_path)?;

    let batch = assemble_batch(config, &static_ds, &surf_ds, &atmos_ds, config.time_index)
        .context("Failed to assemble batch")?;

    let mut report = AssembleReport {
        batch,
        predictions: 0,
        exported: Vec::new(),
    };
    if config.rollout.steps == 0 {
        return Ok(report);
    }

    let keys: Vec<String> = config.surface_variables.iter().map(|m| m.key.clone()).collect();
    let export_dir = config.rollout.export_dir.as_deref().map(config::expand_home);
    for prediction in rollout(model, report.batch.clone(), config.rollout.steps) {
        let prediction = prediction.context("Rollout failed")?;
        report.predictions += 1;
        info!("Prediction {} valid at {:?}", report.predictions, prediction.time());
        if let Some(dir) = &export_dir {
            let paths = export_prediction(dir, &config.rollout.geotiff_prefix, &prediction, &keys)
                .context("Failed to export prediction")?;
            report.exported.extend(paths);
        }
    }
    Ok(report)
}

/// Renders the comparison figures, geocoding through Nominatim.
pub async fn run_plot(config: &PlotConfig) -> Result<Vec<PathBuf>> {
    let geocoder = NominatimGeocoder::new(&config.geocoder_url, &config.user_agent)?;
    let written = plot::run_comparison(config, &geocoder)
        .await
        .with_context(|| format!("Failed to plot comparison for {}", config.city))?;
    Ok(written)
}

/// Local path for a dataset; `s3://` objects are copied to a temporary file
/// that lives as long as the returned guard.
async fn stage_local(path: &Path) -> Result<(Option<NamedTempFile>, PathBuf)> {
    let path_str = path.to_string_lossy();
    if StorageFactory::is_local_path(&path_str) {
        return Ok((None, path.to_path_buf()));
    }

    let storage = StorageFactory::from_path(&path_str).await?;
    let data = storage
        .read(&path_str)
        .await
        .with_context(|| format!("Failed to read {}", path_str))?;
    let temp_file = NamedTempFile::new().context("Failed to create temporary file")?;
    let temp_path = temp_file.path().to_path_buf();
    debug!("Staging {} at {:?}", path_str, temp_path);
    tokio::fs::write(&temp_path, data)
        .await
        .context("Failed to write temporary file")?;
    Ok((Some(temp_file), temp_path))
}
