use crate::config::AssembleConfig;
use crate::dataset::MemoryDataset;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::{Array1, ArrayD, IxDyn};
use std::path::Path;

/// Six-hourly timestamps starting 2023-01-01 00:00.
pub(crate) fn synthetic_times(n_times: usize) -> Vec<NaiveDateTime> {
    let start = NaiveDate::from_ymd_opt(2023, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (0..n_times)
        .map(|k| start + Duration::hours(6 * k as i64))
        .collect()
}

/// Descending latitudes from 30°N and ascending longitudes from 70°E on a
/// 0.25° grid.
pub(crate) fn synthetic_grid(n_lat: usize, n_lon: usize) -> (Array1<f64>, Array1<f64>) {
    let lat = Array1::from_iter((0..n_lat).map(|k| 30.0 - 0.25 * k as f64));
    let lon = Array1::from_iter((0..n_lon).map(|k| 70.0 + 0.25 * k as f64));
    (lat, lon)
}

/// Static, surface and atmospheric datasets laid out like the archive files,
/// using the default variable names. Every cell of a time-dependent field holds
/// its time index; static fields are zero.
pub(crate) fn synthetic_inputs(
    n_times: usize,
    n_lat: usize,
    n_lon: usize,
    levels: &[i64],
) -> (MemoryDataset, MemoryDataset, MemoryDataset) {
    let config = AssembleConfig::default();
    let (lat, lon) = synthetic_grid(n_lat, n_lon);
    let times = synthetic_times(n_times);
    let n_levels = levels.len();

    let mut static_ds = MemoryDataset::new("static");
    for mapping in &config.static_variables {
        static_ds = static_ds.with_variable(&mapping.source, ArrayD::zeros(IxDyn(&[1, n_lat, n_lon])));
    }

    let mut surf_ds = MemoryDataset::new("surface")
        .with_times(&config.time_coordinate, times.clone())
        .with_coordinate(&config.latitude_coordinate, lat.clone())
        .with_coordinate(&config.longitude_coordinate, lon.clone());
    for mapping in &config.surface_variables {
        let field = ArrayD::from_shape_fn(IxDyn(&[n_times, n_lat, n_lon]), |idx| idx[0] as f32);
        surf_ds = surf_ds.with_variable(&mapping.source, field);
    }

    let mut atmos_ds = MemoryDataset::new("atmospheric")
        .with_times(&config.time_coordinate, times)
        .with_coordinate(&config.latitude_coordinate, lat)
        .with_coordinate(&config.longitude_coordinate, lon)
        .with_coordinate(
            &config.level_coordinate,
            Array1::from_iter(levels.iter().map(|l| *l as f64)),
        );
    for mapping in &config.atmospheric_variables {
        let field = ArrayD::from_shape_fn(IxDyn(&[n_times, n_levels, n_lat, n_lon]), |idx| {
            idx[0] as f32
        });
        atmos_ds = atmos_ds.with_variable(&mapping.source, field);
    }

    (static_ds, surf_ds, atmos_ds)
}

/// Writes the three archive files `config` points at, with the same contents
/// as [`synthetic_inputs`].
pub(crate) fn write_netcdf_inputs(
    config: &AssembleConfig,
    n_times: usize,
    n_lat: usize,
    n_lon: usize,
    levels: &[i64],
) -> Result<(), Box<dyn std::error::Error>> {
    let (lat, lon) = synthetic_grid(n_lat, n_lon);
    let seconds: Vec<i64> = synthetic_times(n_times)
        .iter()
        .map(|t| t.and_utc().timestamp())
        .collect();

    let write_axes = |file: &mut netcdf::FileMut, times: &[i64]| -> Result<(), netcdf::Error> {
        file.add_dimension(&config.time_coordinate, times.len())?;
        file.add_dimension(&config.latitude_coordinate, n_lat)?;
        file.add_dimension(&config.longitude_coordinate, n_lon)?;

        let mut var = file.add_variable::<i64>(&config.time_coordinate, &[config.time_coordinate.as_str()])?;
        var.put_attribute("units", "seconds since 1970-01-01")?;
        var.put_values(times, ..)?;
        let mut var =
            file.add_variable::<f64>(&config.latitude_coordinate, &[config.latitude_coordinate.as_str()])?;
        var.put_values(&lat.to_vec(), ..)?;
        let mut var =
            file.add_variable::<f64>(&config.longitude_coordinate, &[config.longitude_coordinate.as_str()])?;
        var.put_values(&lon.to_vec(), ..)?;
        Ok(())
    };
    let spatial = [
        config.time_coordinate.as_str(),
        config.latitude_coordinate.as_str(),
        config.longitude_coordinate.as_str(),
    ];

    let mut file = netcdf::create(config.static_path())?;
    write_axes(&mut file, &seconds[..1])?;
    for mapping in &config.static_variables {
        let mut var = file.add_variable::<f32>(&mapping.source, &spatial)?;
        var.put_values(&vec![0.0f32; n_lat * n_lon], ..)?;
    }
    drop(file);

    let per_step = n_lat * n_lon;
    let mut file = netcdf::create(config.surface_path())?;
    write_axes(&mut file, &seconds)?;
    for mapping in &config.surface_variables {
        let values: Vec<f32> = (0..n_times * per_step).map(|k| (k / per_step) as f32).collect();
        let mut var = file.add_variable::<f32>(&mapping.source, &spatial)?;
        var.put_values(&values, ..)?;
    }
    drop(file);

    let per_step = levels.len() * n_lat * n_lon;
    let mut file = netcdf::create(config.atmospheric_path())?;
    write_axes(&mut file, &seconds)?;
    file.add_dimension(&config.level_coordinate, levels.len())?;
    let mut var = file.add_variable::<i64>(&config.level_coordinate, &[config.level_coordinate.as_str()])?;
    var.put_values(levels, ..)?;
    let dims = [
        config.time_coordinate.as_str(),
        config.level_coordinate.as_str(),
        config.latitude_coordinate.as_str(),
        config.longitude_coordinate.as_str(),
    ];
    for mapping in &config.atmospheric_variables {
        let values: Vec<f32> = (0..n_times * per_step).map(|k| (k / per_step) as f32).collect();
        let mut var = file.add_variable::<f32>(&mapping.source, &dims)?;
        var.put_values(&values, ..)?;
    }
    Ok(())
}

fn assemble_config_in(dir: &Path) -> AssembleConfig {
    AssembleConfig {
        data_dir: dir.to_string_lossy().into_owned(),
        ..Default::default()
    }
}

#[cfg(test)]
mod netcdf_dataset_tests {
    use super::*;
    use crate::dataset::{Dataset, DatasetError, NetcdfDataset};
    use tempfile::tempdir;

    #[test]
    fn test_reads_archive_layout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = assemble_config_in(dir.path());
        write_netcdf_inputs(&config, 4, 3, 5, &[500, 850])?;

        let surf = NetcdfDataset::open(config.surface_path())?;
        assert_eq!(surf.times("valid_time")?, synthetic_times(4));
        assert_eq!(surf.coordinate("latitude")?, synthetic_grid(3, 5).0);
        let t2m = surf.variable("t2m")?;
        assert_eq!(t2m.shape(), &[4, 3, 5]);
        assert_eq!(t2m[[3, 2, 4]], 3.0);

        let atmos = NetcdfDataset::open(config.atmospheric_path())?;
        assert_eq!(atmos.coordinate("pressure_level")?.to_vec(), vec![500.0, 850.0]);
        assert_eq!(atmos.variable("q")?.shape(), &[4, 2, 3, 5]);

        let statics = NetcdfDataset::open(config.static_path())?;
        assert_eq!(statics.variable("lsm")?.shape(), &[1, 3, 5]);
        Ok(())
    }

    #[test]
    fn test_packed_values_are_unpacked() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("packed.nc");
        {
            let mut file = netcdf::create(&path)?;
            file.add_dimension("x", 4)?;
            let mut var = file.add_variable::<i16>("packed", &["x"])?;
            var.put_attribute("_FillValue", -32767i16)?;
            var.put_attribute("scale_factor", 0.5f64)?;
            var.put_attribute("add_offset", 10.0f64)?;
            var.put_values(&[0i16, 10, -32767, 4], ..)?;
        }

        let values = NetcdfDataset::open(&path)?.variable("packed")?;
        assert_eq!(values[[0]], 10.0);
        assert_eq!(values[[1]], 15.0);
        assert!(values[[2]].is_nan());
        assert_eq!(values[[3]], 12.0);
        Ok(())
    }

    #[test]
    fn test_time_without_units_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("no_units.nc");
        {
            let mut file = netcdf::create(&path)?;
            file.add_dimension("valid_time", 2)?;
            let mut var = file.add_variable::<i64>("valid_time", &["valid_time"])?;
            var.put_values(&[0i64, 21600], ..)?;
        }

        let result = NetcdfDataset::open(&path)?.times("valid_time");
        assert!(matches!(result, Err(DatasetError::MissingAttribute { .. })));
        Ok(())
    }

    #[test]
    fn test_open_missing_file() {
        let result = NetcdfDataset::open("/nonexistent/surface.nc");
        assert!(matches!(result, Err(DatasetError::Open { .. })));
    }
}

#[cfg(test)]
mod assemble_workflow_tests {
    use super::*;
    use crate::assemble_with;
    use crate::batch::BatchError;
    use crate::model::PersistenceModel;
    use crate::raster::GeoTiffRaster;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_assemble_from_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = assemble_config_in(dir.path());
        write_netcdf_inputs(&config, 4, 3, 5, &[500, 850])?;

        let report = assemble_with(&config, &PersistenceModel::default()).await?;
        let batch = &report.batch;
        assert_eq!(batch.surf_vars["2t"].shape(), &[1, 2, 3, 5]);
        assert_eq!(batch.static_vars["z"].shape(), &[3, 5]);
        assert_eq!(batch.atmos_vars["z"].shape(), &[1, 2, 2, 3, 5]);
        assert_eq!(batch.metadata.time, vec![synthetic_times(4)[1]]);
        assert_eq!(batch.metadata.atmos_levels, vec![500, 850]);
        assert_eq!(report.predictions, 0);
        assert!(report.exported.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_first_step_has_no_history() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut config = assemble_config_in(dir.path());
        config.time_index = 0;
        write_netcdf_inputs(&config, 4, 2, 2, &[1000])?;

        let error = assemble_with(&config, &PersistenceModel::default())
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BatchError>(),
            Some(BatchError::TimeIndexOutOfRange { index: 0, steps: 4 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_rollout_exports_plotter_inputs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let results = dir.path().join("results");
        let mut config = assemble_config_in(dir.path());
        config.rollout.steps = 2;
        config.rollout.export_dir = Some(results.to_string_lossy().into_owned());
        write_netcdf_inputs(&config, 4, 3, 4, &[500])?;

        let report = assemble_with(&config, &PersistenceModel::default()).await?;
        assert_eq!(report.predictions, 2);
        assert_eq!(report.exported.len(), 4);

        // input time 06:00, predictions at 12:00 and 18:00
        for tag in ["01_01_23_12", "01_01_23_18"] {
            assert!(results.join(format!("aurora_{}.nc", tag)).exists());
            let raster = GeoTiffRaster::open(results.join(format!("aurora_{}.tif", tag)))?;
            assert_eq!(raster.band_count(), config.surface_variables.len());
            assert_eq!(raster.shape(), (3, 4));
            // persistence keeps the value of the last input step
            assert!(raster.band(0)?.iter().all(|v| *v == 1.0));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let dir = tempdir().unwrap();
        let config = assemble_config_in(dir.path());
        let result = assemble_with(&config, &PersistenceModel::default()).await;
        assert!(result.is_err());
    }
}

#[cfg(test)]
mod fetch_workflow_tests {
    use crate::config::FetchConfig;
    use crate::fetch::{ArchiveClient, DatasetRequest, FetchError, FetchOutcome, FetchResult};
    use crate::fetch_with;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct CountingClient {
        calls: Arc<AtomicUsize>,
        fail_product: Option<String>,
    }

    #[async_trait::async_trait]
    impl ArchiveClient for CountingClient {
        async fn retrieve(&self, request: &DatasetRequest, destination: &Path) -> FetchResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_product.as_deref() == Some(request.product.as_str()) {
                return Err(FetchError::Archive {
                    product: request.product.clone(),
                    reason: "rejected".to_string(),
                });
            }
            let body = format!("{} for {}", request.name, request.product);
            tokio::fs::write(destination, &body).await?;
            Ok(body.len() as u64)
        }
    }

    fn config_in(dir: &TempDir) -> FetchConfig {
        FetchConfig {
            output_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_run_contacts_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        let client = CountingClient::default();

        let first = fetch_with(&config, client.clone()).await?;
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert!(first
            .iter()
            .all(|(_, outcome)| matches!(outcome, FetchOutcome::Downloaded { .. })));
        for (request, _) in &first {
            assert!(Path::new(&request.target).exists());
        }

        let second = fetch_with(&config, client.clone()).await?;
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert!(second.iter().all(|(_, outcome)| *outcome == FetchOutcome::Skipped));
        Ok(())
    }

    #[tokio::test]
    async fn test_only_missing_files_are_requested() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        std::fs::write(dir.path().join("static.nc"), b"already here")?;

        let client = CountingClient::default();
        let results = fetch_with(&config, client.clone()).await?;
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(results[0].1, FetchOutcome::Skipped);
        assert_eq!(std::fs::read(dir.path().join("static.nc"))?, b"already here");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_retrieval_leaves_no_artifact() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        let client = CountingClient {
            fail_product: Some(config.pressure_level_product.clone()),
            ..Default::default()
        };

        let result = fetch_with(&config, client.clone()).await;
        assert!(result.is_err());
        assert!(dir.path().join("static.nc").exists());
        assert!(!dir.path().join("2023-01-01-atmospheric.nc").exists());
        Ok(())
    }
}

#[cfg(test)]
mod plot_workflow_tests {
    use super::*;
    use crate::config::{PlotConfig, PlotVariable};
    use crate::geocode::{GeocodeError, GeocodeResult, Geocoder, Location};
    use crate::plot::{PlotError, run_comparison};
    use crate::raster::write_geotiff;
    use crate::window::{AffineTransform, BoxOffsets};
    use ndarray::Array2;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FixedGeocoder(Option<Location>);

    #[async_trait::async_trait]
    impl Geocoder for FixedGeocoder {
        async fn locate(&self, place: &str) -> GeocodeResult<Location> {
            self.0
                .clone()
                .ok_or_else(|| GeocodeError::NotFound(place.to_string()))
        }
    }

    fn near_grid_centre() -> FixedGeocoder {
        FixedGeocoder(Some(Location {
            latitude: 28.6,
            longitude: 71.4,
            display_name: Some("Test City".to_string()),
        }))
    }

    /// Two-band rasters on the synthetic 12x12 grid; the reference is the
    /// prediction plus 1.5.
    fn write_rasters(config: &PlotConfig) -> Result<(), Box<dyn std::error::Error>> {
        let transform = AffineTransform::from_origin(69.875, 30.125, 0.25, 0.25);
        let temperature = Array2::from_shape_fn((12, 12), |(r, c)| 20.0 + r as f32 + 0.5 * c as f32);
        let pressure = Array2::from_shape_fn((12, 12), |(r, c)| 1000.0 + (r * c) as f32);
        write_geotiff(
            config.prediction_raster(),
            &[temperature.clone(), pressure.clone()],
            &transform,
        )?;
        write_geotiff(
            config.reference_raster(),
            &[temperature + 1.5, pressure + 1.5],
            &transform,
        )?;
        Ok(())
    }

    fn config_in(dir: &TempDir) -> PlotConfig {
        PlotConfig {
            city: "Testville".to_string(),
            results_dir: dir.path().join("results").to_string_lossy().into_owned(),
            plots_dir: dir.path().join("plots").to_string_lossy().into_owned(),
            offsets: BoxOffsets {
                west: 0.5,
                east: 0.5,
                south: 0.5,
                north: 0.5,
            },
            variables: vec![
                PlotVariable {
                    band: 0,
                    name: "Temperature (2m)".to_string(),
                },
                PlotVariable {
                    band: 1,
                    name: "Pressure".to_string(),
                },
            ],
            figure_size: 300,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_three_figures_per_variable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        write_rasters(&config)?;

        let written = run_comparison(&config, &near_grid_centre()).await?;
        assert_eq!(written.len(), 6);

        let plots = PathBuf::from(&config.plots_dir);
        for source in ["aurora", "hres", "error"] {
            let path = plots.join(format!("Testville_{}_11_06_22_12_Temperature (2m).png", source));
            assert!(written.contains(&path), "{} not written", path.display());
            let img = image::open(&path)?;
            assert_eq!((img.width(), img.height()), (300, 300));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_city_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        write_rasters(&config)?;

        let result = run_comparison(&config, &FixedGeocoder(None)).await;
        match result {
            Err(PlotError::Geocode(GeocodeError::NotFound(city))) => assert_eq!(city, "Testville"),
            other => panic!("expected NotFound, got {:?}", other.map(|p| p.len())),
        }
        assert!(!Path::new(&config.plots_dir).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_box_outside_raster_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut config = config_in(&dir);
        config.offsets = BoxOffsets::default();
        write_rasters(&config)?;

        let result = run_comparison(&config, &near_grid_centre()).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_reference_raster() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = config_in(&dir);
        write_rasters(&config)?;
        std::fs::remove_file(config.reference_raster())?;

        let result = run_comparison(&config, &near_grid_centre()).await;
        assert!(matches!(result, Err(PlotError::Raster(_))));
        Ok(())
    }
}

#[cfg(test)]
mod s3_integration_tests {
    use super::*;
    use crate::assemble_with;
    use crate::model::PersistenceModel;

    /// Requires AWS credentials and the archive files under
    /// `ERA5LAB_TEST_S3_PREFIX` (e.g. `s3://bucket/era5`).
    #[tokio::test]
    #[ignore]
    async fn test_assemble_from_s3() -> Result<(), Box<dyn std::error::Error>> {
        let prefix = std::env::var("ERA5LAB_TEST_S3_PREFIX")?;
        let config = AssembleConfig {
            data_dir: prefix,
            ..Default::default()
        };
        let report = assemble_with(&config, &PersistenceModel::default()).await?;
        assert_eq!(report.batch.history_len(), 2);
        Ok(())
    }
}
