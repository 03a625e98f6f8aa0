//! Dataset dry-run entry point: assembles the full pipeline from a config
//! file and walks one epoch of batches, reporting shapes and timings. The
//! model backbones are external; a downsampling stand-in VAE keeps the
//! pipeline executable on its own.

use anyhow::{Context, Result};
use candle_core::Tensor;
use clap::Parser;
use difftrain::config::{load_concepts, load_config};
use difftrain::model::{LatentDistribution, Vae};
use difftrain::progress::TrainProgress;
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "trainer", about = "Dataset pipeline dry run")]
struct Args {
    /// Path to the YAML train config.
    #[arg(long)]
    config: PathBuf,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Number of epochs to walk. Defaults to the configured epoch count.
    #[arg(long)]
    epochs: Option<usize>,
}

/// 8x average pooling in place of a real autoencoder, so the pipeline can be
/// exercised without model weights.
struct PoolingVae;

impl Vae for PoolingVae {
    fn encode(&self, image: &Tensor) -> Result<LatentDistribution> {
        let mean = image.avg_pool2d(8)?;
        Ok(LatentDistribution::new(mean.clone(), mean.zeros_like()?))
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        Ok(latent.upsample_nearest2d(latent.dim(2)? * 8, latent.dim(3)? * 8)?)
    }

    fn scaling_factor(&self) -> f64 {
        0.18215
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    difftrain::logging::init_logger(args.log_level);

    let config = load_config(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    config.validate()?;
    let concepts = load_concepts(&config.concept_file_name)?;
    info!(
        "loaded {} concepts from {}",
        concepts.len(),
        config.concept_file_name.display()
    );

    let mut loader = difftrain::create_dataset(&config, concepts, Arc::new(PoolingVae))?;

    let epochs = args.epochs.unwrap_or(config.epochs);
    let mut progress = TrainProgress::new();
    for _ in 0..epochs {
        let started = Instant::now();
        loader.start_epoch(&progress)?;
        info!(
            "epoch {}: {} batches of {}",
            progress.epoch,
            loader.batch_count(),
            loader.batch_size()
        );

        let mut samples = 0usize;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            let latent = batch.tensor("latent_image")?;
            info!(
                "step {}: latent {:?}, fields {:?}",
                progress.global_step,
                latent.dims(),
                batch.field_names()
            );
            samples += batch.len();
            progress.next_step(batch.len());
        }
        info!(
            "epoch {} done: {samples} samples in {:.2?}",
            progress.epoch,
            started.elapsed()
        );
        progress.next_epoch();
    }
    Ok(())
}
