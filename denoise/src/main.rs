use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Instant;
use tracing::info;

use wavelet_denoise::{denoise, train};

#[derive(Parser)]
#[command(name = "wavelet-denoise", about = "Wavelet-pyramid supervised image denoising")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model on noisy/clear folder pairs
    Train(train::TrainArgs),

    /// Restore images with a trained checkpoint
    Denoise(denoise::DenoiseArgs),
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let start = Instant::now();
    match cli.command {
        Command::Train(args) => train::run(args)?,
        Command::Denoise(args) => denoise::run(args)?,
    }
    info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
