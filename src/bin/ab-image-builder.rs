use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use ab_image_builder::{config::Config, disk, preflight};

/// Convert a single-slot disk image into an A/B image with a shared home
/// partition.
#[derive(Debug, Parser)]
#[command(name = "ab-image-builder", version)]
struct Cli {
    /// Original single-slot image.
    input: PathBuf,

    /// Path of the A/B image to create.
    output: PathBuf,

    /// TOML file overriding the layout variant and size policy.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| (if verbose { "debug" } else { "info" }).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run(cli: &Cli, cancel: &AtomicBool) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    let report = disk::convert_with_preflight(
        &cli.input,
        &cli.output,
        &config,
        preflight::REQUIRED_TOOLS,
        cancel,
    )
    .with_context(|| format!("converting '{}'", cli.input.display()))?;

    info!(
        "wrote '{}' ({} MiB, {} partitions)",
        report.output.display(),
        report.plan.image_bytes() / disk::geometry::MIB,
        report.plan.entries().len()
    );
    if !report.migration.integrity.recopied.is_empty() {
        warn!(
            "re-copied without re-checking: {}",
            report.migration.integrity.recopied.join(", ")
        );
    }
    if let Some(sidecar) = &report.digest {
        info!("digest: '{}'", sidecar.display());
    }
    Ok(())
}

fn require_input(path: &Path) {
    if !path.is_file() {
        Cli::command()
            .error(
                ErrorKind::ValueValidation,
                format!("input image '{}' does not exist", path.display()),
            )
            .exit();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    require_input(&cli.input);

    // Stop between stages and let teardown release devices and mounts.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let signal = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            signal.store(true, Ordering::SeqCst);
        }) {
            error!("failed to install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    match run(&cli, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
