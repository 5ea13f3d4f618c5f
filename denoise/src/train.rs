use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{persist, BestTracker, CheckpointDir, CheckpointRecord};
use crate::core::color::rgb_from_tensor;
use crate::core::loss::{psnr, PhotometricLoss, PixelLoss};
use crate::core::objective::LossComposer;
use crate::core::pyramid::{required_multiple, MAX_LEVELS};
use crate::core::pyramid_loss::PyramidLoss;
use crate::core::reconstruct::DeepInverseLoss;
use crate::core::ssim::SsimLoss;
use crate::core::window::WindowConfig;
use crate::dataset::{BatchLoader, ConcatDataset, Dataset, PairedDataset, SyntheticNoiseDataset};
use crate::model::{build_model, denoise, DenoiseModel, Mode};
use crate::optim::{clip_grad_norm, lr_below_threshold, MultiStepLr, Sgd, MAX_GRAD_NORM};

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Model architecture: wavelet-shrinkage
    #[arg(long, default_value = "wavelet-shrinkage")]
    pub model: String,

    /// Training folder with noisy/ and clear/ subfolders
    #[arg(long)]
    pub train_data_folder: PathBuf,

    /// Validation folder with noisy/ and clear/ subfolders
    #[arg(long)]
    pub validation_data_folder: PathBuf,

    /// Output folder for checkpoints, validation images and logs
    #[arg(long)]
    pub experiment_folder: PathBuf,

    #[arg(long, default_value_t = 200)]
    pub epochs: usize,

    /// Training crop and validation window size
    #[arg(long, default_value_t = 512)]
    pub image_size: usize,

    /// First epoch to run (1-based)
    #[arg(long, default_value_t = 1)]
    pub resume_epoch: usize,

    /// Checkpoint to start from
    #[arg(long)]
    pub load_path: Option<PathBuf>,

    /// Loader threads (0 loads on the training thread)
    #[arg(long, default_value_t = 8)]
    pub njobs: usize,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Number of LR decay milestones spread over the run (0 disables)
    #[arg(long, default_value_t = 3)]
    pub lr_milestones: usize,

    /// Decode all images into memory up front
    #[arg(long)]
    pub preload_datasets: bool,

    /// Load only the model parameters from --load-path
    #[arg(long)]
    pub no_load_optim: bool,

    /// Folder of clear images paired with synthetic Gaussian noise
    #[arg(long)]
    pub synthetic_data_folder: Option<PathBuf>,

    /// Stop once the scheduled LR falls below this
    #[arg(long, default_value_t = 1e-7)]
    pub stop_criteria: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Image criterion: mix (0.84 L1 + 0.16 MS-SSIM), l1, smooth-l1, mse
    #[arg(long, default_value = "mix")]
    pub pixel_loss: String,

    /// Blend 1 - SSIM into the photometric loss
    #[arg(long)]
    pub ssim_aux: bool,

    #[arg(long, default_value_t = 4)]
    pub wavelet_levels: usize,

    /// Per-level decay of the pyramid loss, in (0, 1]
    #[arg(long, default_value_t = 1.0)]
    pub wavelet_factor: f32,

    /// Weight of the deep inverse reconstruction loss (0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub deep_inverse_weight: f32,

    /// Samples drawn per epoch from each training set (default: file count)
    #[arg(long)]
    pub samples_per_epoch: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Resolved run configuration, written to `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model: String,
    pub experiment_folder: PathBuf,
    pub epochs: usize,
    pub image_size: usize,
    pub resume_epoch: usize,
    pub load_path: Option<PathBuf>,
    pub load_optimizer: bool,
    pub workers: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub lr_milestones: usize,
    pub stop_criteria: f64,
    pub pixel_loss: PixelLoss,
    pub ssim_aux: bool,
    pub wavelet_levels: usize,
    pub wavelet_factor: f32,
    pub deep_inverse_weight: f32,
    pub seed: u64,
}

impl TrainConfig {
    pub fn from_args(args: &TrainArgs) -> Result<Self> {
        let pixel_loss: PixelLoss = args.pixel_loss.parse().map_err(anyhow::Error::msg)?;
        let config = Self {
            model: args.model.clone(),
            experiment_folder: args.experiment_folder.clone(),
            epochs: args.epochs,
            image_size: args.image_size,
            resume_epoch: args.resume_epoch,
            load_path: args.load_path.clone(),
            load_optimizer: !args.no_load_optim,
            workers: args.njobs,
            batch_size: args.batch_size,
            lr: args.lr,
            lr_milestones: args.lr_milestones,
            stop_criteria: args.stop_criteria,
            pixel_loss,
            ssim_aux: args.ssim_aux,
            wavelet_levels: args.wavelet_levels,
            wavelet_factor: args.wavelet_factor,
            deep_inverse_weight: args.deep_inverse_weight,
            seed: args.seed,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wavelet_levels == 0 || self.wavelet_levels > MAX_LEVELS {
            bail!("--wavelet-levels must be in 1..={}, got {}", MAX_LEVELS, self.wavelet_levels);
        }
        let m = required_multiple(self.wavelet_levels)?;
        if self.image_size == 0 || self.image_size % m != 0 {
            bail!(
                "--image-size {} must be a positive multiple of {} for {} wavelet levels",
                self.image_size,
                m,
                self.wavelet_levels
            );
        }
        if !(self.wavelet_factor > 0.0 && self.wavelet_factor <= 1.0) {
            bail!("--wavelet-factor must be in (0, 1], got {}", self.wavelet_factor);
        }
        if self.deep_inverse_weight < 0.0 {
            bail!("--deep-inverse-weight must not be negative");
        }
        if self.batch_size == 0 {
            bail!("--batch-size must be positive");
        }
        if self.resume_epoch == 0 {
            bail!("--resume-epoch is 1-based");
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            bail!("--lr must be positive, got {}", self.lr);
        }
        Ok(())
    }

    /// Validation tiles are training-sized with a 1/32 margin.
    pub fn window(&self) -> WindowConfig {
        WindowConfig::new(self.image_size, self.batch_size)
    }

    pub fn composer(&self) -> LossComposer {
        let mut photometric = PhotometricLoss::new(self.pixel_loss);
        if self.ssim_aux {
            photometric = photometric.with_auxiliary(Box::new(SsimLoss::default()));
        }
        LossComposer::new(photometric, PyramidLoss::with_factor(self.wavelet_factor))
            .with_deep_inverse(self.deep_inverse_weight, DeepInverseLoss::default())
    }
}

/// One line of `history.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_psnr: f64,
    pub lr: f64,
    pub best: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    MaxEpochs,
    LrBelowThreshold { epoch: usize, lr: f64 },
}

pub struct Trainer {
    config: TrainConfig,
    model: Box<dyn DenoiseModel>,
    optimizer: Sgd,
    scheduler: Option<MultiStepLr>,
    objective: LossComposer,
    loader: BatchLoader,
    validation: Option<Box<dyn Dataset>>,
    checkpoints: CheckpointDir,
    best: BestTracker,
    history: Vec<EpochSummary>,
    val_outputs: PathBuf,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        mut model: Box<dyn DenoiseModel>,
        train: Arc<dyn Dataset>,
        validation: Option<Box<dyn Dataset>>,
    ) -> Result<Self> {
        config.validate()?;
        if model.levels() != config.wavelet_levels {
            bail!(
                "model has {} pyramid levels, config asks for {}",
                model.levels(),
                config.wavelet_levels
            );
        }

        let experiment = config.experiment_folder.clone();
        let val_outputs = experiment.join("val_outputs");
        fs::create_dir_all(&val_outputs)
            .with_context(|| format!("creating {}", val_outputs.display()))?;

        let mut optimizer = Sgd::new(config.lr);
        if let Some(path) = &config.load_path {
            let record = CheckpointRecord::load(path)?;
            let opt = if config.load_optimizer {
                Some(&mut optimizer)
            } else {
                None
            };
            let with_optimizer = opt.is_some();
            record
                .load_into(model.as_mut(), opt)
                .with_context(|| format!("restoring {}", path.display()))?;
            info!("Model has been loaded from {} (epoch {}, acc {:.4})", path.display(), record.epoch, record.acc);
            if with_optimizer {
                info!("Optimizer has been loaded from {}", path.display());
            }
        }

        let mut scheduler = MultiStepLr::from_steps(config.lr, config.epochs, config.lr_milestones);
        if let Some(s) = scheduler.as_mut() {
            info!("Learning rate milestone epochs: {:?}", s.milestones());
            let lr = s.fast_forward(config.resume_epoch - 1);
            optimizer.set_lr(lr);
        }

        let history = load_history(&experiment.join("history.json"), config.resume_epoch)?;
        let loader = BatchLoader::new(train, config.batch_size, config.workers, config.seed)?;
        if loader.batches_per_epoch() == 0 {
            warn!("training set is smaller than one batch; epochs will not update the model");
        }

        Ok(Self {
            objective: config.composer(),
            checkpoints: CheckpointDir::new(&experiment),
            config,
            model,
            optimizer,
            scheduler,
            loader,
            validation,
            best: BestTracker::default(),
            history,
            val_outputs,
        })
    }

    pub fn history(&self) -> &[EpochSummary] {
        &self.history
    }

    pub fn model(&self) -> &dyn DenoiseModel {
        self.model.as_ref()
    }

    pub fn lr(&self) -> f64 {
        self.optimizer.lr()
    }

    /// Mean photometric loss of the epoch's batches.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<f64> {
        let batches = self.loader.epoch(epoch);
        let total = batches.len();
        let mut sum = 0.0f64;

        for (i, batch) in batches.enumerate() {
            let batch = batch.with_context(|| format!("loading batch {} of epoch {}", i, epoch))?;
            self.model.zero_grad();
            let out = self.model.forward(&batch.noisy, Mode::Train)?;
            let (terms, grad) = self.objective.evaluate(&out.image, &out.pyramid, &batch.clear)?;
            if !terms.total.is_finite() {
                bail!("non-finite loss at epoch {} batch {}: {:?}", epoch, i, terms);
            }
            self.model.backward(&grad)?;
            let norm = clip_grad_norm(self.model.parameters_mut(), MAX_GRAD_NORM);
            self.optimizer.step(self.model.parameters_mut());

            sum += terms.pixel as f64;
            debug!(
                "Epoch: {}/{}, batch {}/{}, px_loss: {:.7}, w_loss: {:.7}, grad_norm: {:.4}",
                epoch,
                self.config.epochs,
                i + 1,
                total,
                terms.pixel,
                terms.pyramid,
                norm
            );
        }

        Ok(if total > 0 { sum / total as f64 } else { 0.0 })
    }

    /// Tiled inference over every validation image: (mean loss, mean PSNR).
    /// Restored images are written under `val_outputs/`.
    pub fn validate(&mut self) -> Result<(f64, f64)> {
        let Some(dataset) = self.validation.as_ref() else {
            return Ok((0.0, 0.0));
        };
        let window = self.config.window();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let (mut loss_sum, mut psnr_sum) = (0.0f64, 0.0f64);

        for i in 0..dataset.len() {
            let sample = dataset.get(i, &mut rng)?;
            let restored = denoise(self.model.as_mut(), &sample.noisy, &window)
                .with_context(|| format!("denoising validation image {}", sample.name))?;

            loss_sum += self.objective.image_loss(&restored, &sample.clear)? as f64;
            psnr_sum += psnr(&restored, &sample.clear, 1.0)? as f64;

            let path = self.val_outputs.join(&sample.name);
            rgb_from_tensor(&restored, 0)?
                .save(&path)
                .with_context(|| format!("saving {}", path.display()))?;
        }

        let n = dataset.len();
        if n == 0 {
            return Ok((0.0, 0.0));
        }
        Ok((loss_sum / n as f64, psnr_sum / n as f64))
    }

    /// Run epochs `resume_epoch..=epochs` until the LR schedule runs out.
    pub fn fit(&mut self) -> Result<StopReason> {
        for epoch in self.config.resume_epoch..=self.config.epochs {
            let start = Instant::now();
            let train_loss = self.train_epoch(epoch)?;
            let (val_loss, val_psnr) = self.validate()?;

            if let Some(s) = self.scheduler.as_mut() {
                let lr = s.step();
                self.optimizer.set_lr(lr);
            }

            let record = CheckpointRecord::capture(self.model.as_ref(), &self.optimizer, val_psnr, epoch);
            let best = persist(&self.checkpoints, &mut self.best, &record)?;

            self.history.push(EpochSummary {
                epoch,
                train_loss,
                val_loss,
                val_psnr,
                lr: self.optimizer.lr(),
                best,
            });
            self.write_history()?;

            info!(
                "Epoch {}/{}: train loss {:.6}, val loss {:.6}, val PSNR {:.3} dB, lr {:.3e}, {:.1}s",
                epoch,
                self.config.epochs,
                train_loss,
                val_loss,
                val_psnr,
                self.optimizer.lr(),
                start.elapsed().as_secs_f64()
            );

            if self.scheduler.is_some() && lr_below_threshold(self.optimizer.lr(), self.config.stop_criteria) {
                let lr = self.optimizer.lr();
                info!("Learning rate {:.3e} fell below {:.3e}, stopping", lr, self.config.stop_criteria);
                return Ok(StopReason::LrBelowThreshold { epoch, lr });
            }
        }
        Ok(StopReason::MaxEpochs)
    }

    fn write_history(&self) -> Result<()> {
        let path = self.config.experiment_folder.join("history.json");
        fs::write(&path, serde_json::to_string_pretty(&self.history)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Entries of an earlier run that precede `resume_epoch`.
fn load_history(path: &Path, resume_epoch: usize) -> Result<Vec<EpochSummary>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut history: Vec<EpochSummary> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    history.retain(|e| e.epoch < resume_epoch);
    Ok(history)
}

fn split_folder(root: &Path) -> (PathBuf, PathBuf) {
    (root.join("noisy"), root.join("clear"))
}

pub fn run(args: TrainArgs) -> Result<()> {
    let config = TrainConfig::from_args(&args)?;
    fs::create_dir_all(&config.experiment_folder)
        .with_context(|| format!("creating {}", config.experiment_folder.display()))?;
    let config_path = config.experiment_folder.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", config_path.display()))?;

    let (noisy, clear) = split_folder(&args.train_data_folder);
    let mut paired = PairedDataset::open(&noisy, &clear)?.with_crop(config.image_size)?;
    if let Some(n) = args.samples_per_epoch {
        paired = paired.with_virtual_len(n);
    }
    if args.preload_datasets {
        paired = paired.preload()?;
    }
    info!("Training pairs: {} files from {}", paired.file_count(), args.train_data_folder.display());

    let train: Arc<dyn Dataset> = match &args.synthetic_data_folder {
        Some(dir) => {
            let mut synthetic = SyntheticNoiseDataset::open(dir, config.image_size)?;
            if let Some(n) = args.samples_per_epoch {
                synthetic = synthetic.with_virtual_len(n);
            }
            if args.preload_datasets {
                synthetic = synthetic.preload()?;
            }
            info!("Synthetic noise samples: {} from {}", synthetic.len(), dir.display());
            let parts: Vec<Box<dyn Dataset>> = vec![Box::new(paired), Box::new(synthetic)];
            Arc::new(ConcatDataset::new(parts))
        }
        None => Arc::new(paired),
    };

    let (noisy, clear) = split_folder(&args.validation_data_folder);
    let mut validation = PairedDataset::open(&noisy, &clear)?;
    if args.preload_datasets {
        validation = validation.preload()?;
    }
    info!("Validation images: {}", validation.len());

    let model = build_model(&config.model, config.wavelet_levels)?;
    info!(
        "Training {} ({} levels) for epochs {}..={}, batch {}, {} samples per epoch",
        config.model,
        config.wavelet_levels,
        config.resume_epoch,
        config.epochs,
        config.batch_size,
        train.len()
    );

    let mut trainer = Trainer::new(config, model, train, Some(Box::new(validation)))?;
    let reason = trainer.fit()?;
    match reason {
        StopReason::MaxEpochs => info!("Training finished after the last epoch"),
        StopReason::LrBelowThreshold { epoch, lr } => {
            info!("Training stopped at epoch {} with lr {:.3e}", epoch, lr)
        }
    }
    Ok(())
}
