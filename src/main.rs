use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use era5lab::cli::{Cli, Commands, render_template};
use era5lab::log::{
    assemble_echo, fetch_echo, plot_echo, show_assemble_report, show_farewell_with_timing,
    show_fetch_results, show_greeting, show_requests, show_written,
};
use std::fs;
use std::io::{self, Write};
use std::time::Instant;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli).await
}

fn init_logging(cli: &Cli) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.log_level() {
        builder.filter_level(level);
    }
    builder.init();
}

async fn run(cli: Cli) -> Result<()> {
    let start_time = Instant::now();
    let banners = !cli.quiet;

    match &cli.command {
        Commands::Fetch { dry_run, .. } => {
            let config = cli.resolve_config()?;
            if banners {
                show_greeting("fetch", cli.config.as_deref());
                fetch_echo(&config.fetch);
            }
            if *dry_run {
                show_requests(&config.fetch.requests());
                return Ok(());
            }
            let results = era5lab::run_fetch(&config.fetch).await?;
            if banners {
                show_fetch_results(&results);
            }
        }
        Commands::Assemble { .. } => {
            let config = cli.resolve_config()?;
            if banners {
                show_greeting("assemble", cli.config.as_deref());
                assemble_echo(&config.assemble);
            }
            let report = era5lab::run_assemble(&config.assemble).await?;
            if banners {
                show_assemble_report(&report);
            }
        }
        Commands::Plot { .. } => {
            let config = cli.resolve_config()?;
            if banners {
                show_greeting("plot", cli.config.as_deref());
                plot_echo(&config.plot);
            }
            let written = era5lab::run_plot(&config.plot).await?;
            if banners {
                show_written(&written);
            }
        }
        Commands::Template { output, format } => {
            let text = render_template(*format)?;
            match output {
                Some(path) => fs::write(path, text)
                    .with_context(|| format!("Failed to write template to {}", path.display()))?,
                None => io::stdout().write_all(text.as_bytes())?,
            }
            return Ok(());
        }
        Commands::Completions { shell, output } => {
            let mut command = Cli::command();
            match output {
                Some(path) => {
                    let mut file = fs::File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    clap_complete::generate(*shell, &mut command, "era5lab", &mut file);
                }
                None => clap_complete::generate(*shell, &mut command, "era5lab", &mut io::stdout()),
            }
            return Ok(());
        }
    }

    if banners {
        show_farewell_with_timing(start_time.elapsed());
    }
    Ok(())
}
