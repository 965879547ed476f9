mod atlas;
mod density;
mod error;
mod fdr;
mod ids;
mod index;
mod label;
mod regional;
mod report;
mod split;
mod stats;
mod sunburst;
mod table;
mod validate;
mod volume;
mod zarr;

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};

#[derive(Parser)]
#[command(
    name = "cstats",
    about = "cstats CLI: fdr, index, split, table, density, stats, regional, sunburst"
)]
struct Cli {
    /// How to report progress on stderr
    #[arg(long, value_enum, default_value = "json", global = true)]
    progress: ProgressMode,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ProgressMode {
    /// One {"progress", "message"} object per line
    Json,
    Bar,
}

#[derive(Subcommand)]
enum Commands {
    /// FDR-threshold a p-value map into cluster indices
    Fdr(fdr::FdrArgs),
    /// Reverse, mirror or filter cluster IDs
    Index(index::IndexArgs),
    /// Split a cluster index by side or effect direction
    Split(split::SplitArgs),
    /// Per-cluster volume, centroid and bounding box table
    Table(table::TableArgs),
    /// Cell or label density of each cluster for one sample
    Density(density::DensityArgs),
    /// Test cluster densities across conditions and pick valid clusters
    Stats(validate::StatsArgs),
    /// Cell density per atlas region for one sample
    Regional(regional::RegionalArgs),
    /// Atlas region composition of clusters
    Sunburst(sunburst::SunburstArgs),
}

fn json_progress(prog: f64, msg: &str) {
    let _ = writeln!(
        io::stderr(),
        "{}",
        serde_json::json!({"progress": prog, "message": msg})
    );
    let _ = io::stderr().flush();
}

fn dispatch(command: Commands, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Fdr(args) => fdr::run(args, progress)?,
        Commands::Index(args) => index::run(args, progress)?,
        Commands::Split(args) => split::run(args, progress)?,
        Commands::Table(args) => table::run(args, progress)?,
        Commands::Density(args) => density::run(args, progress)?,
        Commands::Stats(args) => validate::run(args, progress)?,
        Commands::Regional(args) => regional::run(args, progress)?,
        Commands::Sunburst(args) => sunburst::run(args, progress)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.progress {
        ProgressMode::Json => dispatch(cli.command, json_progress),
        ProgressMode::Bar => {
            let pb = ProgressBar::new(1000);
            pb.set_style(
                ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
                    .progress_chars("##-"),
            );
            let result = dispatch(cli.command, |prog, msg| {
                pb.set_position((prog.clamp(0.0, 1.0) * 1000.0) as u64);
                pb.set_message(msg.to_string());
            });
            pb.finish();
            result
        }
    }
}
