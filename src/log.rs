use crate::AssembleReport;
use crate::config::{AssembleConfig, FetchConfig, PlotConfig};
use crate::fetch::{DatasetRequest, FetchOutcome};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn show_greeting(command: &str, config_path: Option<&Path>) {
    println!("=== ERA5 Lab: {} ===", command);
    match config_path {
        Some(path) => println!("Loading configuration from: {}", path.display()),
        None => println!("Using built-in configuration"),
    }
}

pub fn fetch_echo(config: &FetchConfig) {
    println!("\nConfiguration:");
    println!("  Output: {}", config.output_dir);
    println!("  Date: {}", config.date);
    println!("  Times: {}", config.times.join(", "));
    println!("  Pressure levels: {} ({:?})", config.pressure_levels.len(), config.pressure_levels);
}

pub fn assemble_echo(config: &AssembleConfig) {
    println!("\nConfiguration:");
    println!("  Static: {}", config.static_path().display());
    println!("  Surface: {}", config.surface_path().display());
    println!("  Atmospheric: {}", config.atmospheric_path().display());
    println!("  Time index: {}", config.time_index);
    if config.rollout.steps > 0 {
        println!(
            "  Rollout: {} steps of {}h",
            config.rollout.steps, config.rollout.lead_time_hours
        );
        if let Some(dir) = &config.rollout.export_dir {
            println!("  Export: {}", dir);
        }
    }
}

pub fn plot_echo(config: &PlotConfig) {
    println!("\nConfiguration:");
    println!("  City: {}", config.city);
    println!("  Date: {}", config.date_str);
    println!("  Prediction: {}", config.prediction_raster().display());
    println!("  Reference: {}", config.reference_raster().display());
    println!("  Plots: {}", config.plots_dir);
    for variable in &config.variables {
        println!("    Band {}: {}", variable.band, variable.name);
    }
}

pub fn show_requests(requests: &[DatasetRequest]) {
    println!("\nRequests:");
    for request in requests {
        println!("  {} ({}) -> {}", request.name, request.product, request.target);
    }
}

pub fn show_fetch_results(results: &[(DatasetRequest, FetchOutcome)]) {
    println!("\nFetch Results:");
    for (request, outcome) in results {
        match outcome {
            FetchOutcome::Skipped => println!("  {}: already present", request.name),
            FetchOutcome::Downloaded { bytes } => {
                println!("  {}: downloaded {} bytes", request.name, bytes)
            }
        }
    }
}

pub fn show_assemble_report(report: &AssembleReport) {
    println!("\nBatch:");
    for line in report.batch.shape_summary().lines() {
        println!("  {}", line);
    }
    if report.predictions > 0 {
        println!("\nRollout: {} predictions", report.predictions);
    }
    for path in &report.exported {
        println!("  Wrote {}", path.display());
    }
}

pub fn show_written(paths: &[PathBuf]) {
    println!("\nFigures:");
    for path in paths {
        println!("  {}", path.display());
    }
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    println!("\n=== Completed successfully in {:.2?} ===", elapsed);
}
