use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use srgan_train::data::PrefetchQueue;
use srgan_train::error::QueueError;
use srgan_train::{AppConfig, Trainer};

/// Data pipeline tooling for SRGAN training.
#[derive(Parser)]
#[command(name = "srgan-train", about = "SRGAN training data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the default configuration as TOML
    Config,
    /// Scan the configured splits and time the training queue
    Inspect {
        /// Path to TOML configuration file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// Number of batches to pull from the queue
        #[arg(long, default_value_t = 20)]
        batches: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("srgan_train=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Config => {
            let toml = AppConfig::default_toml().context("serializing default config")?;
            print!("{toml}");
            Ok(())
        }
        Command::Inspect { config, batches } => inspect(&config, batches),
    }
}

fn inspect(path: &Path, batches: usize) -> Result<()> {
    if batches == 0 {
        bail!("--batches must be at least 1");
    }
    let config = AppConfig::load_or_default(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let trainer = Trainer::new(config).context("building data splits")?;

    let source = trainer.train_source();
    let patches = source.config();
    println!(
        "train: {} file(s), {} sample(s), LR {:?} -> HR {:?} ({})",
        source.file_count(),
        source.len(),
        patches.lr_shape(),
        patches.hr_shape(),
        patches.colorspace().name()
    );
    for (split, source) in [
        ("validation", trainer.validation_source()),
        ("test", trainer.test_source()),
    ] {
        match source {
            Some(s) => println!("{split}: {} file(s), {} sample(s)", s.file_count(), s.len()),
            None => println!("{split}: not configured"),
        }
    }

    let queue_config = trainer.prefetch_config(true);
    info!(
        "pulling {batches} batch(es) through {} worker(s)",
        queue_config.workers
    );
    let start = Instant::now();
    let shapes = PrefetchQueue::scoped(Arc::clone(source), queue_config, |queue| {
        let mut first = None;
        for _ in 0..batches {
            let batch = queue.get_batch()?;
            first.get_or_insert_with(|| (batch.lr.shape().to_vec(), batch.hr.shape().to_vec()));
        }
        Ok::<_, QueueError>(first)
    })
    .context("reading batches")?;
    let elapsed = start.elapsed().as_secs_f64();

    if let Some((lr, hr)) = shapes {
        println!("batch shapes: LR {lr:?}, HR {hr:?}");
    }
    println!(
        "{batches} batch(es) in {elapsed:.2}s ({:.1} batches/s)",
        batches as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(())
}
