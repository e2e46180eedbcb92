//! Minimal adapter for the Copernicus Climate Data Store retrieve API.
//!
//! Submits a process execution, polls the job until it settles, then streams
//! the single result asset to disk. Credentials come from `CDSAPI_URL` and
//! `CDSAPI_KEY`, or from the `url:`/`key:` lines of `~/.cdsapirc`.

use crate::config::expand_home;
use crate::fetch::{ArchiveClient, DatasetRequest, FetchError, FetchResult};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CDS_URL: &str = "https://cds.climate.copernicus.eu/api";

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobResults {
    asset: Asset,
}

#[derive(Debug, Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
    #[serde(rename = "file:size", default)]
    size: Option<u64>,
}

pub struct CdsClient {
    client: Client,
    url: String,
    key: String,
}

impl CdsClient {
    pub fn new(url: &str, key: &str) -> FetchResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    /// Reads credentials from the environment, falling back to `~/.cdsapirc`.
    pub fn from_env() -> FetchResult<Self> {
        let rc = std::fs::read_to_string(expand_home("~/.cdsapirc")).unwrap_or_default();
        let (rc_url, rc_key) = parse_cdsapirc(&rc);

        let url = std::env::var("CDSAPI_URL")
            .ok()
            .or(rc_url)
            .unwrap_or_else(|| DEFAULT_CDS_URL.to_string());
        let key = std::env::var("CDSAPI_KEY").ok().or(rc_key).ok_or_else(|| {
            FetchError::Credentials("set CDSAPI_KEY or add a 'key:' line to ~/.cdsapirc".to_string())
        })?;

        Self::new(&url, &key)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn submit(&self, request: &DatasetRequest) -> FetchResult<JobStatus> {
        let endpoint = format!("{}/retrieve/v1/processes/{}/execution", self.url, request.product);
        debug!("POST {}", endpoint);
        let job = self
            .client
            .post(&endpoint)
            .header("PRIVATE-TOKEN", &self.key)
            .json(&json!({ "inputs": request.params }))
            .send()
            .await?
            .error_for_status()?
            .json::<JobStatus>()
            .await?;
        info!("Submitted {} as job {}", request.name, job.job_id);
        Ok(job)
    }

    async fn wait(&self, request: &DatasetRequest, mut job: JobStatus) -> FetchResult<()> {
        let endpoint = format!("{}/retrieve/v1/jobs/{}", self.url, job.job_id);
        loop {
            match job.status.as_str() {
                "successful" => return Ok(()),
                "failed" | "rejected" | "dismissed" => {
                    return Err(FetchError::Archive {
                        product: request.product.clone(),
                        reason: job.detail.clone().unwrap_or_else(|| job.status.clone()),
                    });
                }
                status => debug!("Job {} is {}", job.job_id, status),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            job = self
                .client
                .get(&endpoint)
                .header("PRIVATE-TOKEN", &self.key)
                .send()
                .await?
                .error_for_status()?
                .json::<JobStatus>()
                .await?;
        }
    }

    async fn result_asset(&self, job_id: &str) -> FetchResult<AssetValue> {
        let endpoint = format!("{}/retrieve/v1/jobs/{}/results", self.url, job_id);
        let results = self
            .client
            .get(&endpoint)
            .header("PRIVATE-TOKEN", &self.key)
            .send()
            .await?
            .error_for_status()?
            .json::<JobResults>()
            .await?;
        Ok(results.asset.value)
    }

    async fn download(&self, asset: &AssetValue, destination: &Path) -> FetchResult<u64> {
        let response = self.client.get(&asset.href).send().await?.error_for_status()?;
        let total = asset.size.or_else(|| response.content_length()).unwrap_or(0);

        let progress = ProgressBar::new(total);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut file = File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.set_position(written);
        }
        file.flush().await?;
        progress.finish_and_clear();
        Ok(written)
    }
}

#[async_trait::async_trait]
impl ArchiveClient for CdsClient {
    async fn retrieve(&self, request: &DatasetRequest, destination: &Path) -> FetchResult<u64> {
        let job = self.submit(request).await?;
        let job_id = job.job_id.clone();
        self.wait(request, job).await?;
        let asset = self.result_asset(&job_id).await?;
        self.download(&asset, destination).await
    }
}

/// `url:` and `key:` entries of a `.cdsapirc` file.
pub fn parse_cdsapirc(content: &str) -> (Option<String>, Option<String>) {
    let mut url = None;
    let mut key = None;
    for line in content.lines() {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim() {
                "url" => url = Some(value.trim().to_string()),
                "key" => key = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    (url, key)
}
