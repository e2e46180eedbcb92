//! # Artifact Storage
//!
//! Where fetched archive files end up. The fetcher only ever asks a backend two
//! questions: "is this artifact already present?" and "store this staged file
//! here". Both local disk and Amazon S3 answer them, so the skip policy works the
//! same against either store.
//!
//! ## Path Patterns
//!
//! - **S3 paths**: `s3://bucket-name/era5/static.nc`
//! - **Local paths**: `/data/era5/static.nc` or `data/era5/static.nc`
//!
//! ```rust,no_run
//! use era5lab::storage::{StorageFactory, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = StorageFactory::from_path("s3://my-bucket/era5/static.nc").await?;
//!     if !storage.exists("s3://my-bucket/era5/static.nc").await? {
//!         storage.put_file("s3://my-bucket/era5/static.nc", "/tmp/static.nc".as_ref()).await?;
//!     }
//!     Ok(())
//! }
//! ```

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use log::debug;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio::fs;

type S3Failure<E> = SdkError<E>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("S3 GetObject failed for {0}")]
    S3Get(String, #[source] S3Failure<GetObjectError>),

    #[error("S3 PutObject failed for {0}")]
    S3Put(String, #[source] S3Failure<PutObjectError>),

    #[error("S3 HeadObject failed for {0}")]
    S3Head(String, #[source] S3Failure<HeadObjectError>),

    #[error("S3 body transfer failed for {path}: {reason}")]
    Transfer { path: String, reason: String },

    #[error("Invalid S3 location '{0}', expected s3://bucket/key")]
    InvalidS3Path(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    match source.kind() {
        ErrorKind::NotFound => StorageError::PathNotFound(path.to_string()),
        ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
        _ => StorageError::Io {
            path: path.to_string(),
            source,
        },
    }
}

/// A place where artifacts live.
///
/// `exists` is the idempotency marker for the fetcher: a present artifact is
/// never fetched again, whatever its content.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Moves a fully staged local file into place at `path`, so the target
    /// only ever appears complete. Creates parent directories where the store
    /// has them.
    async fn put_file(&self, path: &str, staged: &Path) -> StorageResult<()>;
}

/// Local disk.
#[derive(Debug, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    async fn ensure_parent(path: &str) -> StorageResult<()> {
        match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&parent.to_string_lossy(), e)),
            _ => Ok(()),
        }
    }

    /// Copies `staged` into a hidden sibling of `path` and renames it over the
    /// target. A failed copy leaves neither the target nor the sibling behind.
    async fn copy_into_place(staged: &Path, path: &str) -> StorageResult<()> {
        let target = Path::new(path);
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let partial = tempfile::Builder::new()
            .prefix(".era5lab-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| io_error(&dir.to_string_lossy(), e))?;

        fs::copy(staged, partial.path())
            .await
            .map_err(|e| io_error(&staged.to_string_lossy(), e))?;
        partial.persist(target).map_err(|e| io_error(path, e.error))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        fs::read(path).await.map_err(|e| io_error(path, e))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match fs::try_exists(path).await {
            Ok(present) => Ok(present),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn put_file(&self, path: &str, staged: &Path) -> StorageResult<()> {
        Self::ensure_parent(path).await?;

        // rename fails across filesystems; the staging dir usually lives in /tmp
        if let Err(e) = fs::rename(staged, path).await {
            debug!("Rename of {:?} into {} failed ({}), copying", staged, path, e);
            Self::copy_into_place(staged, path).await?;
            if let Err(e) = fs::remove_file(staged).await {
                debug!("Could not remove staged file {:?}: {}", staged, e);
            }
        }
        Ok(())
    }
}

/// Bucket and key of an `s3://bucket/key` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl FromStr for S3Location {
    type Err = StorageError;

    fn from_str(uri: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidS3Path(uri.to_string());
        let rest = uri.strip_prefix("s3://").ok_or_else(invalid)?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Amazon S3, with credentials from the usual AWS chain (environment,
/// credentials file, instance role).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
}

impl S3Storage {
    pub async fn new() -> StorageResult<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self::from_config(&config))
    }

    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: S3Client::new(config),
        }
    }

    async fn upload(&self, path: &str, body: ByteStream) -> StorageResult<()> {
        let S3Location { bucket, key } = path.parse()?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::S3Put(path.to_string(), e))?;
        debug!("Uploaded {}", path);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Storage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let S3Location { bucket, key } = path.parse()?;
        let object = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(object) => object,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(StorageError::PathNotFound(path.to_string()));
            }
            Err(e) => return Err(StorageError::S3Get(path.to_string(), e)),
        };

        let bytes = object.body.collect().await.map_err(|e| StorageError::Transfer {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let S3Location { bucket, key } = path.parse()?;
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(StorageError::S3Head(path.to_string(), e)),
        }
    }

    async fn put_file(&self, path: &str, staged: &Path) -> StorageResult<()> {
        // streamed from disk; pressure-level files run to gigabytes
        let body = ByteStream::from_path(staged)
            .await
            .map_err(|e| StorageError::Transfer {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        self.upload(path, body).await
    }
}

#[derive(Debug)]
pub enum Storage {
    Local(LocalStorage),
    S3(S3Storage),
}

#[async_trait::async_trait]
impl StorageBackend for Storage {
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        match self {
            Storage::Local(storage) => storage.read(path).await,
            Storage::S3(storage) => storage.read(path).await,
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self {
            Storage::Local(storage) => storage.exists(path).await,
            Storage::S3(storage) => storage.exists(path).await,
        }
    }

    async fn put_file(&self, path: &str, staged: &Path) -> StorageResult<()> {
        match self {
            Storage::Local(storage) => storage.put_file(path, staged).await,
            Storage::S3(storage) => storage.put_file(path, staged).await,
        }
    }
}

/// Picks a backend from the shape of a path: `s3://` goes to S3, anything else
/// is local disk.
pub struct StorageFactory;

impl StorageFactory {
    pub async fn from_path(path: &str) -> StorageResult<Storage> {
        if Self::is_s3_path(path) {
            let s3_storage = S3Storage::new().await?;
            Ok(Storage::S3(s3_storage))
        } else {
            Ok(Storage::Local(LocalStorage))
        }
    }

    pub fn is_s3_path(path: &str) -> bool {
        path.starts_with("s3://")
    }

    pub fn is_local_path(path: &str) -> bool {
        !Self::is_s3_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_put_then_read() -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;
        let temp_dir = TempDir::new()?;
        let staged = temp_dir.path().join("static.download");
        std::fs::write(&staged, b"CDF\x01")?;
        let file_path = temp_dir.path().join("era5").join("static.nc");
        let file_path_str = file_path.to_str().unwrap();

        storage.put_file(file_path_str, &staged).await?;

        let read_data = storage.read(file_path_str).await?;
        assert_eq!(read_data, b"CDF\x01");
        assert!(storage.exists(file_path_str).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_local_storage_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;

        let result = storage.read("/nonexistent/era5/static.nc").await;
        assert!(matches!(result, Err(StorageError::PathNotFound(_))));

        assert!(!storage.exists("/nonexistent/era5/static.nc").await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_local_put_file_moves_staged_file() -> Result<(), Box<dyn std::error::Error>> {
        let storage = LocalStorage;
        let temp_dir = TempDir::new()?;
        let staged = temp_dir.path().join("download.part");
        std::fs::write(&staged, b"surface")?;

        let target = temp_dir.path().join("nested").join("2023-01-01-surface-level.nc");
        let target_str = target.to_str().unwrap();

        assert!(!storage.exists(target_str).await?);
        storage.put_file(target_str, &staged).await?;

        assert!(storage.exists(target_str).await?);
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&target)?, b"surface");

        Ok(())
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_copy_fallback_renames_complete_file() -> Result<(), Box<dyn std::error::Error>> {
        let staging = TempDir::new()?;
        let output = TempDir::new()?;
        let staged = staging.path().join("download");
        std::fs::write(&staged, b"pressure levels")?;
        let target = output.path().join("2023-01-01-atmospheric.nc");

        LocalStorage::copy_into_place(&staged, target.to_str().unwrap()).await?;

        assert_eq!(std::fs::read(&target)?, b"pressure levels");
        assert_eq!(entries(output.path()), vec!["2023-01-01-atmospheric.nc"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_no_target() -> Result<(), Box<dyn std::error::Error>> {
        let output = TempDir::new()?;
        let target = output.path().join("2023-01-01-atmospheric.nc");
        let target_str = target.to_str().unwrap();
        let missing = output.path().join("never-downloaded");

        let result = LocalStorage::copy_into_place(&missing, target_str).await;

        assert!(matches!(result, Err(StorageError::PathNotFound(_))));
        assert!(!LocalStorage.exists(target_str).await?);
        assert!(entries(output.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_s3_location_parsing() {
        let location: S3Location = "s3://my-bucket/era5/static.nc".parse().unwrap();
        assert_eq!(location.bucket, "my-bucket");
        assert_eq!(location.key, "era5/static.nc");

        for bad in ["http://bucket/file.nc", "s3://", "s3://bucket", "s3:///file.nc"] {
            assert!(
                matches!(bad.parse::<S3Location>(), Err(StorageError::InvalidS3Path(p)) if p == bad),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_storage_factory_path_detection() -> Result<(), Box<dyn std::error::Error>> {
        assert!(StorageFactory::is_s3_path("s3://my-bucket/static.nc"));
        assert!(!StorageFactory::is_s3_path("data/era5/static.nc"));
        assert!(StorageFactory::is_local_path("/data/era5/static.nc"));

        let local_storage = StorageFactory::from_path("data/era5/static.nc").await?;
        assert!(matches!(local_storage, Storage::Local(_)));

        Ok(())
    }
}
