use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use log::{info, warn};
use std::path::PathBuf;

mod config;
mod error;
mod fsutil;
mod libs;
mod manifest;
mod patcher;
mod pipeline;
mod report;
mod resources;
mod smali;
mod xml_span;

use config::{PatcherConfig, ResolvedConfig};
use libs::LibrarySettings;
use patcher::Patcher;
use pipeline::{Pipeline, PipelineReport, SystemRunner};
use report::LogReporter;

#[derive(Parser)]
#[command(name = "pairip-patcher")]
#[command(about = "Removes the PairIP protection layer from Android app bundles", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new pairip-patcher configuration file
    Init {
        /// Path to create the configuration file (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
    /// Merge, patch, rebuild and sign a split APK bundle
    Patch {
        /// The .apks bundle to patch
        apks: PathBuf,
    },
    /// Patch an already decompiled tree in place
    PatchDir {
        /// Root of the decompiled tree
        dir: PathBuf,
        /// Archive the tree was decompiled from, used to pick architectures
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Directory holding the supplemental libraries (default: current directory)
        #[arg(long)]
        libs_from: Option<PathBuf>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            init_config(path).await?;
        }
        Commands::Patch { apks } => {
            patch_bundle(apks).await?;
        }
        Commands::PatchDir {
            dir,
            archive,
            libs_from,
            json,
        } => {
            patch_dir(dir, archive, libs_from, json).await?;
        }
    }

    Ok(())
}

async fn init_config(path: PathBuf) -> Result<()> {
    info!("Initializing pairip-patcher configuration...");

    let config_path = if path.is_dir() {
        path.join(config::CONFIG_FILE_NAMES[0])
    } else {
        path
    };

    if config_path.exists() {
        warn!("Configuration file already exists!");
        return Ok(());
    }

    let template_config = PatcherConfig::template();
    let config_json = serde_json::to_string_pretty(&template_config)?;

    tokio::fs::write(&config_path, config_json).await?;

    info!("✓ Created configuration file: {}", config_path.display());

    Ok(())
}

fn resolve_config() -> Result<ResolvedConfig> {
    match config::find_config_file(std::env::current_dir()?) {
        Some(config_path) => {
            info!("→ Using configuration: {}", config_path.display());
            config::load_config(&config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))
        }
        None => Ok(ResolvedConfig::default()),
    }
}

async fn patch_bundle(apks: PathBuf) -> Result<()> {
    print_banner();

    let resolved_config = resolve_config()?;
    let work_dir = std::env::current_dir()?;
    let apks = work_dir.join(apks);

    let pipeline = Pipeline::new(resolved_config, work_dir, SystemRunner).with_progress()?;
    let report = pipeline.run(&apks).await?;

    print_summary(&report);
    Ok(())
}

async fn patch_dir(
    dir: PathBuf,
    archive: Option<PathBuf>,
    libs_from: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let resolved_config = resolve_config()?;
    let source_dir = match libs_from {
        Some(libs_from) => libs_from,
        None => std::env::current_dir()?,
    };

    info!("→ Patching decompiled tree: {}", dir.display());
    let outcome = tokio::task::spawn_blocking(move || {
        let settings = LibrarySettings::from_config(&resolved_config, source_dir, archive);
        Patcher::new(&resolved_config, settings, &LogReporter).patch(&dir)
    })
    .await??;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.anything_patched() {
        info!("✓ Patching completed");
    }
    Ok(())
}

fn print_banner() {
    let border = "▓".repeat(60);
    let title = format!("{:^60}", "PairIP Protection Remover");
    let version = format!("{:^60}", concat!("v", env!("CARGO_PKG_VERSION")));

    println!("\n{}", border.cyan().bold());
    println!("{}", title.cyan().bold());
    println!("{}", version.cyan().bold());
    println!("{}\n", border.cyan().bold());
}

fn print_summary(report: &PipelineReport) {
    let border = "─".repeat(60);
    println!("\n{}", border.green());
    println!(
        "{} {}",
        "✓".green(),
        format!("Patched APK: {}", report.output.display()).green().bold()
    );
    println!("  Size: {}", format_megabytes(report.size_bytes));
    println!("  Time: {:.1} seconds", report.elapsed.as_secs_f64());
    if !report.outcome.architectures.is_empty() {
        println!("  Architectures: {}", report.outcome.architectures.join(", "));
    }
    if !report.signed {
        println!("  {}", "Unsigned: the signer produced no output".yellow());
    }
    if !report.outcome.anything_patched() {
        println!("  {}", "No protection was found to remove".yellow());
    }
    println!("{}", border.green());
}

fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}
