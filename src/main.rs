extern crate log;
pub mod aggregation;
pub mod classification;
pub mod crs;
pub mod geofile;
pub mod grid;
pub mod pipeline;
pub mod travel_time;
use crate::pipeline::config::Config;
use crate::pipeline::driver::{run, RunOptions};
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

/// Walking accessibility of points of interest on a city grid.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input config file.
    #[arg(short, long)]
    config_filepath: PathBuf,

    /// Only process the named city. Can be repeated.
    #[arg(long)]
    city: Vec<String>,

    /// Recompute accessibility from existing grid_ttm_access.csv tables without routing.
    #[arg(long)]
    from_access_table: bool,
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    let mut config = Config::from_yaml_file(&args.config_filepath)?;
    config.select_cities(&args.city)?;

    let service = config.travel_time.service.build();
    let options = RunOptions {
        from_access_table: args.from_access_table,
    };
    let report = run(&config, service.as_ref(), &options)?;
    report.log_summary();
    if !report.is_success() {
        return Err(anyhow!(
            "{} out of {} cities failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        ));
    }
    Ok(())
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    env_logger::init();
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}
