use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointRecord;
use crate::core::color::{rgb_from_tensor, tensor_from_rgb};
use crate::core::pyramid::required_multiple;
use crate::core::window::WindowConfig;
use crate::dataset::list_images;
use crate::model::{build_model, denoise, DenoiseModel};

#[derive(Args, Debug)]
pub struct DenoiseArgs {
    /// Checkpoint written by `train` (last.json or best.json)
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Noisy image, or a directory of images
    #[arg(long)]
    pub input: PathBuf,

    /// Output directory for restored PNGs
    #[arg(long)]
    pub output: PathBuf,

    /// Inference window (must be a multiple of 2^levels)
    #[arg(long, default_value_t = 512)]
    pub window_size: usize,

    /// Margin dropped from interior window edges (default: window / 32)
    #[arg(long)]
    pub crop_size: Option<usize>,

    /// Windows per model call
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
}

#[derive(Debug, Serialize)]
struct ImageSummary {
    input: PathBuf,
    output: PathBuf,
    width: u32,
    height: u32,
    window: usize,
    millis: u128,
}

#[derive(Debug, Serialize)]
struct Summary {
    checkpoint: PathBuf,
    arch: String,
    levels: usize,
    epoch: usize,
    acc: f64,
    images: Vec<ImageSummary>,
}

/// Largest usable window for an `h x w` image: the requested size, shrunk to
/// the image's short side and rounded down to a multiple of `multiple`.
fn fit_window(requested: usize, h: usize, w: usize, multiple: usize) -> Result<usize> {
    let side = requested.min(h).min(w);
    let window = side - side % multiple;
    if window == 0 {
        bail!("image {}x{} is smaller than one {}-pixel pyramid block", w, h, multiple);
    }
    Ok(window)
}

fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        let files = list_images(input)?;
        if files.is_empty() {
            bail!("no images in {}", input.display());
        }
        Ok(files)
    } else if input.is_file() {
        Ok(vec![input.to_path_buf()])
    } else {
        Err(anyhow!("input {} does not exist", input.display()))
    }
}

fn restore_one(
    model: &mut dyn DenoiseModel,
    path: &Path,
    out_dir: &Path,
    args: &DenoiseArgs,
) -> Result<ImageSummary> {
    let start = Instant::now();
    let img = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();

    let multiple = required_multiple(model.levels())?;
    let window = fit_window(args.window_size, height as usize, width as usize, multiple)
        .with_context(|| format!("sizing windows for {}", path.display()))?;
    if window != args.window_size {
        warn!("{}: window reduced from {} to {}", path.display(), args.window_size, window);
    }
    let mut cfg = WindowConfig::new(window, args.batch_size);
    if let Some(crop) = args.crop_size {
        cfg = cfg.with_crop(crop);
    }

    let restored = denoise(model, &tensor_from_rgb(&img), &cfg)?;
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow!("no file name in {}", path.display()))?;
    let output = out_dir.join(format!("{}.png", stem.to_string_lossy()));
    rgb_from_tensor(&restored, 0)?
        .save(&output)
        .with_context(|| format!("saving {}", output.display()))?;

    let millis = start.elapsed().as_millis();
    info!("{} -> {} ({}x{}, window {}, {} ms)", path.display(), output.display(), width, height, window, millis);
    Ok(ImageSummary {
        input: path.to_path_buf(),
        output,
        width,
        height,
        window,
        millis,
    })
}

pub fn run(args: DenoiseArgs) -> Result<()> {
    let start = Instant::now();
    if args.batch_size == 0 {
        bail!("--batch-size must be positive");
    }

    let record = CheckpointRecord::load(&args.checkpoint)?;
    let mut model = build_model(&record.arch, record.levels)?;
    record
        .load_into(model.as_mut(), None)
        .with_context(|| format!("restoring {}", args.checkpoint.display()))?;
    info!(
        "Loaded {} ({} levels) from {} (epoch {}, acc {:.3})",
        record.arch,
        record.levels,
        args.checkpoint.display(),
        record.epoch,
        record.acc
    );

    let multiple = required_multiple(record.levels)?;
    if args.window_size % multiple != 0 {
        bail!("--window-size {} must be a multiple of {}", args.window_size, multiple);
    }

    let inputs = collect_inputs(&args.input)?;
    fs::create_dir_all(&args.output).with_context(|| format!("creating {}", args.output.display()))?;

    let mut images = Vec::with_capacity(inputs.len());
    for path in &inputs {
        images.push(restore_one(model.as_mut(), path, &args.output, &args)?);
    }

    let summary = Summary {
        checkpoint: args.checkpoint.clone(),
        arch: record.arch,
        levels: record.levels,
        epoch: record.epoch,
        acc: record.acc,
        images,
    };
    fs::write(args.output.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
    info!("Restored {} images in {:.1}s", inputs.len(), start.elapsed().as_secs_f64());
    Ok(())
}
