//! # Archive Fetcher
//!
//! Downloads the three ERA5 datasets a batch is assembled from, one request at
//! a time. A request whose target artifact already exists in storage is
//! skipped without contacting the archive; otherwise the archive writes into a
//! staging file that is only moved to the target once complete.
//!
//! There is no retry and no resume. A failed retrieval leaves no target behind,
//! so the next run simply tries again.

use crate::config::{
    FetchConfig, STATIC_FILE, atmospheric_file_name, expand_home, surface_file_name,
};
use crate::storage::{StorageBackend, StorageError, StorageFactory};
use log::{info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid archive response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive credentials not found: {0}")]
    Credentials(String),

    #[error("Archive request for {product} failed: {reason}")]
    Archive { product: String, reason: String },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// One parameterised retrieval from the archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRequest {
    /// Short label for logs (`static`, `surface`, `atmospheric`)
    pub name: String,
    pub product: String,
    /// Storage path of the artifact, local or `s3://`
    pub target: String,
    pub params: BTreeMap<String, Value>,
}

impl DatasetRequest {
    /// File name part of the target
    pub fn file_name(&self) -> &str {
        self.target.rsplit('/').next().unwrap_or(&self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Skipped,
    Downloaded { bytes: u64 },
}

/// Anything that can materialise a [`DatasetRequest`] as a local file.
#[async_trait::async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Blocks until `destination` holds the complete file; returns its size.
    async fn retrieve(&self, request: &DatasetRequest, destination: &Path) -> FetchResult<u64>;
}

impl FetchConfig {
    /// The three fixed requests: static fields, surface fields and
    /// pressure-level fields for the configured date.
    pub fn requests(&self) -> Vec<DatasetRequest> {
        let day = self.date_params();

        let mut static_params = day.clone();
        static_params.insert("variable".to_string(), json!(self.static_variables));
        static_params.insert("time".to_string(), json!(self.static_time));

        let mut surface_params = day.clone();
        surface_params.insert("variable".to_string(), json!(self.surface_variables));
        surface_params.insert("time".to_string(), json!(self.times));

        let levels: Vec<String> = self.pressure_levels.iter().map(|l| l.to_string()).collect();
        let mut atmos_params = day;
        atmos_params.insert("variable".to_string(), json!(self.atmospheric_variables));
        atmos_params.insert("pressure_level".to_string(), json!(levels));
        atmos_params.insert("time".to_string(), json!(self.times));

        vec![
            DatasetRequest {
                name: "static".to_string(),
                product: self.single_level_product.clone(),
                target: self.target(STATIC_FILE),
                params: static_params,
            },
            DatasetRequest {
                name: "surface".to_string(),
                product: self.single_level_product.clone(),
                target: self.target(&surface_file_name(self.date)),
                params: surface_params,
            },
            DatasetRequest {
                name: "atmospheric".to_string(),
                product: self.pressure_level_product.clone(),
                target: self.target(&atmospheric_file_name(self.date)),
                params: atmos_params,
            },
        ]
    }

    fn date_params(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("product_type".to_string(), json!(["reanalysis"])),
            ("year".to_string(), json!(self.date.format("%Y").to_string())),
            ("month".to_string(), json!(self.date.format("%m").to_string())),
            ("day".to_string(), json!(self.date.format("%d").to_string())),
            ("data_format".to_string(), json!(self.format)),
            ("download_format".to_string(), json!("unarchived")),
        ])
    }

    fn target(&self, file_name: &str) -> String {
        if StorageFactory::is_s3_path(&self.output_dir) {
            format!("{}/{}", self.output_dir.trim_end_matches('/'), file_name)
        } else {
            expand_home(&self.output_dir).join(file_name).to_string_lossy().into_owned()
        }
    }
}

/// Existence-gated fetch loop over an archive client and a storage backend.
pub struct Fetcher<C, S> {
    client: C,
    storage: S,
}

impl<C: ArchiveClient, S: StorageBackend> Fetcher<C, S> {
    pub fn new(client: C, storage: S) -> Self {
        Self { client, storage }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Fetches `request` unless its target already exists.
    pub async fn fetch(&self, request: &DatasetRequest) -> FetchResult<FetchOutcome> {
        if self.storage.exists(&request.target).await? {
            info!("{} already present at {}, skipping", request.name, request.target);
            return Ok(FetchOutcome::Skipped);
        }

        info!("Requesting {} from {}", request.name, request.product);
        let staging = tempfile::Builder::new().prefix("era5lab-").tempdir()?;
        let staged = staging.path().join(request.file_name());

        let bytes = match self.client.retrieve(request, &staged).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Retrieval of {} failed, nothing written to {}", request.name, request.target);
                return Err(e);
            }
        };

        self.storage.put_file(&request.target, &staged).await?;
        info!("Stored {} ({} bytes) at {}", request.name, bytes, request.target);
        Ok(FetchOutcome::Downloaded { bytes })
    }

    /// Fetches every request in order, stopping at the first failure.
    pub async fn fetch_all(&self, requests: &[DatasetRequest]) -> FetchResult<Vec<FetchOutcome>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.fetch(request).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writes a fixed payload and counts calls.
    struct RecordingClient {
        calls: AtomicUsize,
        fail: bool,
    }

    impl RecordingClient {
        fn new(fail: bool) -> Self {
            Self { calls: AtomicUsize::new(0), fail }
        }
    }

    #[async_trait::async_trait]
    impl ArchiveClient for RecordingClient {
        async fn retrieve(&self, request: &DatasetRequest, destination: &Path) -> FetchResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                tokio::fs::write(destination, b"partial").await?;
                return Err(FetchError::Archive {
                    product: request.product.clone(),
                    reason: "job failed".to_string(),
                });
            }
            tokio::fs::write(destination, b"CDF\x01payload").await?;
            Ok(11)
        }
    }

    fn config_in(dir: &TempDir) -> FetchConfig {
        FetchConfig {
            output_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requests_match_reference_downloads() {
        let config = FetchConfig::default();
        let requests = config.requests();
        assert_eq!(requests.len(), 3);

        assert_eq!(requests[0].file_name(), "static.nc");
        assert_eq!(requests[0].params["time"], json!("00:00"));
        assert_eq!(requests[0].params["variable"], json!(["geopotential", "land_sea_mask", "soil_type"]));

        assert_eq!(requests[1].file_name(), "2023-01-01-surface-level.nc");
        assert_eq!(requests[1].product, "reanalysis-era5-single-levels");
        assert_eq!(requests[1].params["time"], json!(["00:00", "06:00", "12:00", "18:00"]));

        assert_eq!(requests[2].file_name(), "2023-01-01-atmospheric.nc");
        assert_eq!(requests[2].product, "reanalysis-era5-pressure-levels");
        assert_eq!(requests[2].params["pressure_level"].as_array().map(|l| l.len()), Some(13));
        assert_eq!(requests[2].params["day"], json!("01"));
    }

    #[test]
    fn test_request_targets_follow_date_and_store() {
        let config = FetchConfig {
            output_dir: "s3://bucket/era5/".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            ..Default::default()
        };
        let requests = config.requests();
        assert_eq!(requests[0].target, "s3://bucket/era5/static.nc");
        assert_eq!(requests[1].target, "s3://bucket/era5/2024-03-09-surface-level.nc");
        assert_eq!(requests[2].params["month"], json!("03"));
    }

    #[tokio::test]
    async fn test_absent_target_is_fetched_once() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let request = config_in(&dir).requests().remove(0);
        let fetcher = Fetcher::new(RecordingClient::new(false), LocalStorage);

        let outcome = fetcher.fetch(&request).await?;
        assert_eq!(outcome, FetchOutcome::Downloaded { bytes: 11 });
        assert_eq!(fetcher.client().calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokio::fs::read(&request.target).await?, b"CDF\x01payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_target_is_never_requested() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let request = config_in(&dir).requests().remove(1);
        tokio::fs::write(&request.target, b"already here").await?;
        let fetcher = Fetcher::new(RecordingClient::new(false), LocalStorage);

        assert_eq!(fetcher.fetch(&request).await?, FetchOutcome::Skipped);
        assert_eq!(fetcher.client().calls.load(Ordering::SeqCst), 0);
        assert_eq!(tokio::fs::read(&request.target).await?, b"already here");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_retrieval_leaves_no_target() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let request = config_in(&dir).requests().remove(2);
        let fetcher = Fetcher::new(RecordingClient::new(true), LocalStorage);

        assert!(matches!(fetcher.fetch(&request).await, Err(FetchError::Archive { .. })));
        assert!(!fetcher.storage().exists(&request.target).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_all_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let requests = config_in(&dir).requests();
        let fetcher = Fetcher::new(RecordingClient::new(false), LocalStorage);

        let first = fetcher.fetch_all(&requests).await?;
        assert!(first.iter().all(|o| matches!(o, FetchOutcome::Downloaded { .. })));

        let second = fetcher.fetch_all(&requests).await?;
        assert!(second.iter().all(|o| *o == FetchOutcome::Skipped));
        assert_eq!(fetcher.client().calls.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
