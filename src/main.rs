//! omezarr-pyramid - convert a volume into a multiscale OME-Zarr pyramid.

use anyhow::{anyhow, Context};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omezarr_pyramid::{
    config::Config, utils::format_bytes, PyramidWriter, VolumeAssembler,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let budget = config.memory_budget_bytes();
    info!("Configuration:");
    info!("  Input: {}", config.input.display());
    info!("  Output: {}", config.output.display());
    info!(
        "  Levels: {}, factor {}, chunks {}^3, order {}",
        config.levels, config.downscale_factor, config.chunk_size, config.resize_order
    );
    info!(
        "  Memory limit: {}, workers: {}",
        format_bytes(budget as usize),
        config.workers
    );

    let assembler = VolumeAssembler::open_with_concurrency(
        &config.input,
        config.transpose,
        budget,
        config.io_concurrency,
    )
    .await
    .with_context(|| format!("Failed to open input {}", config.input.display()))?;
    info!(
        "Volume '{}': shape {:?}, {}",
        assembler.name(),
        assembler.shape(),
        assembler.data_type()
    );

    let pyramid = config
        .pyramid_config(assembler.shape())
        .map_err(|e| anyhow!(e))?;
    let name = assembler.name().to_string();
    let mut writer = PyramidWriter::create(assembler, &config.output, name, pyramid)
        .context("Invalid pyramid configuration")?;
    for (level, shape) in writer.level_shapes().iter().enumerate() {
        info!("  Level {}: {:?}", level, shape);
    }

    let ome_path = writer.ome_path().to_path_buf();
    let summary = writer
        .write()
        .await
        .with_context(|| format!("Failed to write {}", ome_path.display()))?;
    info!(
        "Wrote {} level(s), kept {} existing level(s) in {}",
        summary.written.len(),
        summary.skipped.len(),
        ome_path.display()
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "omezarr_pyramid=debug"
    } else {
        "omezarr_pyramid=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
