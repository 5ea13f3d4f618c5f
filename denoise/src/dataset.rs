use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{self, Receiver};
use image::{imageops, RgbImage};
use ndarray::{concatenate, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::core::color::tensor_from_rgb;
use crate::core::Tensor;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Gaussian noise sigma range of synthetic pairs, in 8-bit units.
const SYNTHETIC_SIGMA: (f32, f32) = (5.0, 50.0);

/// One noisy/clear pair, each (1, 3, h, w).
#[derive(Debug, Clone)]
pub struct Sample {
    pub noisy: Tensor,
    pub clear: Tensor,
    pub name: String,
}

/// Stacked samples, each (n, 3, h, w).
#[derive(Debug, Clone)]
pub struct Batch {
    pub noisy: Tensor,
    pub clear: Tensor,
}

pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load sample `index`; random crops and noise draw from `rng`.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;
}

/// Sorted image files of a directory.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Random `window × window` offset inside a `w × h` image.
fn random_crop(rng: &mut StdRng, w: u32, h: u32, window: u32, name: &str) -> Result<(u32, u32)> {
    if w < window || h < window {
        bail!("{} is {}x{}, smaller than the {} training window", name, w, h, window);
    }
    Ok((rng.random_range(0..=w - window), rng.random_range(0..=h - window)))
}

fn crop(img: &RgbImage, x: u32, y: u32, window: u32) -> RgbImage {
    imageops::crop_imm(img, x, y, window, window).to_image()
}

fn crop_side(window: usize) -> Result<u32> {
    u32::try_from(window).with_context(|| format!("crop window {} exceeds the largest image side", window))
}

/// Pairs `clear/<name>` with `noisy/<name>`.
pub struct PairedDataset {
    noisy: Vec<PathBuf>,
    clear: Vec<PathBuf>,
    crop: Option<u32>,
    virtual_len: Option<usize>,
    cache: Option<Vec<(RgbImage, RgbImage)>>,
}

impl PairedDataset {
    pub fn open(noisy_dir: &Path, clear_dir: &Path) -> Result<Self> {
        let clear = list_images(clear_dir)?;
        let mut noisy = Vec::with_capacity(clear.len());
        for path in &clear {
            let counterpart = noisy_dir.join(file_name(path));
            if !counterpart.is_file() {
                bail!(
                    "{} has no noisy counterpart in {}",
                    path.display(),
                    noisy_dir.display()
                );
            }
            noisy.push(counterpart);
        }
        debug!(pairs = clear.len(), dir = %clear_dir.display(), "paired dataset");
        Ok(Self {
            noisy,
            clear,
            crop: None,
            virtual_len: None,
            cache: None,
        })
    }

    /// Train on random `window × window` crops, identical for both images.
    pub fn with_crop(mut self, window: usize) -> Result<Self> {
        self.crop = Some(crop_side(window)?);
        Ok(self)
    }

    /// Report `len` samples per epoch, cycling over the files.
    pub fn with_virtual_len(mut self, len: usize) -> Self {
        self.virtual_len = Some(len);
        self
    }

    /// Decode every pair into memory.
    pub fn preload(mut self) -> Result<Self> {
        let cache = self
            .noisy
            .par_iter()
            .zip(self.clear.par_iter())
            .map(|(n, c)| Ok((load_rgb(n)?, load_rgb(c)?)))
            .collect::<Result<Vec<_>>>()?;
        info!(pairs = cache.len(), "preloaded paired images");
        self.cache = Some(cache);
        Ok(self)
    }

    pub fn file_count(&self) -> usize {
        self.clear.len()
    }

    fn pair(&self, i: usize) -> Result<(RgbImage, RgbImage)> {
        match &self.cache {
            Some(cache) => Ok(cache[i].clone()),
            None => Ok((load_rgb(&self.noisy[i])?, load_rgb(&self.clear[i])?)),
        }
    }
}

impl Dataset for PairedDataset {
    fn len(&self) -> usize {
        if self.clear.is_empty() {
            return 0;
        }
        self.virtual_len.unwrap_or(self.clear.len())
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        if self.clear.is_empty() {
            bail!("sample {} requested from an empty dataset", index);
        }
        let i = index % self.clear.len();
        let name = file_name(&self.clear[i]);
        let (mut noisy, mut clear) = self.pair(i)?;
        if noisy.dimensions() != clear.dimensions() {
            bail!(
                "{}: noisy {:?} and clear {:?} differ in size",
                name,
                noisy.dimensions(),
                clear.dimensions()
            );
        }
        if let Some(window) = self.crop {
            let (w, h) = clear.dimensions();
            let (x, y) = random_crop(rng, w, h, window, &name)?;
            noisy = crop(&noisy, x, y, window);
            clear = crop(&clear, x, y, window);
        }
        Ok(Sample {
            noisy: tensor_from_rgb(&noisy),
            clear: tensor_from_rgb(&clear),
            name,
        })
    }
}

/// Clear images only; the noisy side is the clear crop plus Gaussian noise.
pub struct SyntheticNoiseDataset {
    clear: Vec<PathBuf>,
    window: u32,
    virtual_len: Option<usize>,
    cache: Option<Vec<RgbImage>>,
}

impl SyntheticNoiseDataset {
    pub fn open(clear_dir: &Path, window: usize) -> Result<Self> {
        let clear = list_images(clear_dir)?;
        if clear.is_empty() {
            warn!(dir = %clear_dir.display(), "no images for synthetic noise");
        }
        let window = crop_side(window).with_context(|| format!("synthetic crops from {}", clear_dir.display()))?;
        Ok(Self {
            clear,
            window,
            virtual_len: None,
            cache: None,
        })
    }

    pub fn with_virtual_len(mut self, len: usize) -> Self {
        self.virtual_len = Some(len);
        self
    }

    pub fn preload(mut self) -> Result<Self> {
        let cache = self
            .clear
            .par_iter()
            .map(|p| load_rgb(p))
            .collect::<Result<Vec<_>>>()?;
        self.cache = Some(cache);
        Ok(self)
    }
}

/// Add N(0, sigma) per channel in 8-bit units, rounding and clamping.
pub fn add_gaussian_noise(img: &RgbImage, sigma: f32, rng: &mut StdRng) -> Result<RgbImage> {
    let normal = Normal::new(0.0f32, sigma).map_err(|e| anyhow!("noise sigma {}: {}", sigma, e))?;
    let mut out = img.clone();
    for px in out.pixels_mut() {
        for ch in px.0.iter_mut() {
            let v = *ch as f32 + normal.sample(rng);
            *ch = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

impl Dataset for SyntheticNoiseDataset {
    fn len(&self) -> usize {
        if self.clear.is_empty() {
            return 0;
        }
        self.virtual_len.unwrap_or(self.clear.len())
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        if self.clear.is_empty() {
            bail!("sample {} requested from an empty dataset", index);
        }
        let i = index % self.clear.len();
        let name = file_name(&self.clear[i]);
        let img = match &self.cache {
            Some(cache) => cache[i].clone(),
            None => load_rgb(&self.clear[i])?,
        };
        let (w, h) = img.dimensions();
        let (x, y) = random_crop(rng, w, h, self.window, &name)?;
        let clear = crop(&img, x, y, self.window);
        let sigma = rng.random_range(SYNTHETIC_SIGMA.0..=SYNTHETIC_SIGMA.1);
        let noisy = add_gaussian_noise(&clear, sigma, rng)?;
        Ok(Sample {
            noisy: tensor_from_rgb(&noisy),
            clear: tensor_from_rgb(&clear),
            name,
        })
    }
}

/// Datasets indexed back to back.
pub struct ConcatDataset {
    parts: Vec<Box<dyn Dataset>>,
}

impl ConcatDataset {
    pub fn new(parts: Vec<Box<dyn Dataset>>) -> Self {
        Self { parts }
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.parts.iter().map(|d| d.len()).sum()
    }

    fn get(&self, mut index: usize, rng: &mut StdRng) -> Result<Sample> {
        for part in &self.parts {
            if index < part.len() {
                return part.get(index, rng);
            }
            index -= part.len();
        }
        bail!("sample index out of range")
    }
}

fn sample_rng(seed: u64, epoch: usize, index: usize) -> StdRng {
    let mixed = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    StdRng::seed_from_u64(mixed)
}

fn stack(samples: Vec<Sample>) -> Result<Batch> {
    let noisy: Vec<_> = samples.iter().map(|s| s.noisy.view()).collect();
    let clear: Vec<_> = samples.iter().map(|s| s.clear.view()).collect();
    Ok(Batch {
        noisy: concatenate(Axis(0), &noisy).context("samples differ in size")?,
        clear: concatenate(Axis(0), &clear).context("samples differ in size")?,
    })
}

fn assemble(dataset: &dyn Dataset, indices: &[usize], seed: u64, epoch: usize) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i, &mut sample_rng(seed, epoch, i)))
        .collect::<Result<Vec<_>>>()?;
    stack(samples)
}

/// Shuffled, fixed-size batches; the last partial batch is dropped.
pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    workers: usize,
    seed: u64,
}

impl BatchLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize, workers: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        Ok(Self {
            dataset,
            batch_size,
            workers,
            seed,
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        order
            .chunks_exact(self.batch_size)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Batches of one epoch, in plan order.
    ///
    /// With workers, batches are assembled on background threads that block
    /// once `2 × workers` finished batches are waiting. Without, each batch is
    /// assembled on the calling thread with its samples decoded in parallel.
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let plan = self.plan(epoch);
        let total = plan.len();
        if self.workers == 0 {
            return EpochBatches {
                source: Source::Inline {
                    dataset: self.dataset.clone(),
                    plan,
                    seed: self.seed,
                    epoch,
                },
                next: 0,
                total,
                pending: BTreeMap::new(),
            };
        }

        let (job_tx, job_rx) = channel::unbounded::<(usize, Vec<usize>)>();
        for job in plan.into_iter().enumerate() {
            // receiver is alive, send cannot fail
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (out_tx, out_rx) = channel::bounded(2 * self.workers);
        for w in 0..self.workers {
            let jobs = job_rx.clone();
            let out = out_tx.clone();
            let dataset = self.dataset.clone();
            let seed = self.seed;
            let spawned = thread::Builder::new()
                .name(format!("loader-{}", w))
                .spawn(move || {
                    while let Ok((slot, indices)) = jobs.recv() {
                        let batch = assemble(dataset.as_ref(), &indices, seed, epoch);
                        if out.send((slot, batch)).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!(worker = w, error = %e, "failed to spawn loader thread");
            }
        }

        EpochBatches {
            source: Source::Workers { rx: out_rx },
            next: 0,
            total,
            pending: BTreeMap::new(),
        }
    }
}

enum Source {
    Inline {
        dataset: Arc<dyn Dataset>,
        plan: Vec<Vec<usize>>,
        seed: u64,
        epoch: usize,
    },
    Workers {
        rx: Receiver<(usize, Result<Batch>)>,
    },
}

pub struct EpochBatches {
    source: Source,
    next: usize,
    total: usize,
    pending: BTreeMap<usize, Result<Batch>>,
}

impl EpochBatches {
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let slot = self.next;
        self.next += 1;

        match &self.source {
            Source::Inline {
                dataset,
                plan,
                seed,
                epoch,
            } => {
                let samples = plan[slot]
                    .par_iter()
                    .map(|&i| dataset.get(i, &mut sample_rng(*seed, *epoch, i)))
                    .collect::<Result<Vec<_>>>();
                Some(samples.and_then(stack))
            }
            Source::Workers { rx } => loop {
                if let Some(batch) = self.pending.remove(&slot) {
                    return Some(batch);
                }
                match rx.recv() {
                    Ok((i, batch)) => {
                        self.pending.insert(i, batch);
                    }
                    Err(_) => return Some(Err(anyhow!("loader workers exited before batch {}", slot))),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    struct Counting {
        len: usize,
        side: usize,
    }

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
            let t = Tensor::from_elem((1, 3, self.side, self.side), index as f32);
            Ok(Sample {
                noisy: t.clone(),
                clear: t,
                name: index.to_string(),
            })
        }
    }

    fn firsts(batches: EpochBatches) -> Vec<Vec<usize>> {
        batches
            .map(|b| {
                let b = b.unwrap();
                (0..b.noisy.dim().0).map(|i| b.noisy[[i, 0, 0, 0]] as usize).collect()
            })
            .collect()
    }

    #[test]
    fn test_drop_last_and_coverage() {
        let loader = BatchLoader::new(Arc::new(Counting { len: 10, side: 2 }), 3, 0, 7).unwrap();
        assert_eq!(loader.batches_per_epoch(), 3);
        let batches = firsts(loader.epoch(0));
        assert_eq!(batches.len(), 3);
        let mut seen: Vec<usize> = batches.concat();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_workers_match_inline_order() {
        let inline = BatchLoader::new(Arc::new(Counting { len: 37, side: 4 }), 4, 0, 3).unwrap();
        let pooled = BatchLoader::new(Arc::new(Counting { len: 37, side: 4 }), 4, 3, 3).unwrap();
        for epoch in 0..2 {
            assert_eq!(firsts(inline.epoch(epoch)), firsts(pooled.epoch(epoch)));
        }
        assert_ne!(firsts(inline.epoch(0)), firsts(inline.epoch(1)));
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let loader = BatchLoader::new(Arc::new(Counting { len: 200, side: 2 }), 2, 2, 1).unwrap();
        let mut it = loader.epoch(0);
        assert!(it.next().unwrap().is_ok());
        drop(it);
    }

    fn write_pair(dir: &Path, name: &str, w: u32, h: u32) {
        let clear = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        let noisy = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 4 + 3) as u8, (y * 4) as u8, 120]));
        clear.save(dir.join("clear").join(name)).unwrap();
        noisy.save(dir.join("noisy").join(name)).unwrap();
    }

    #[test]
    fn test_paired_dataset_crops_identically() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clear")).unwrap();
        fs::create_dir_all(dir.path().join("noisy")).unwrap();
        write_pair(dir.path(), "a.png", 40, 32);
        write_pair(dir.path(), "b.png", 48, 48);

        let ds = PairedDataset::open(&dir.path().join("noisy"), &dir.path().join("clear"))
            .unwrap()
            .with_crop(16)
            .unwrap()
            .with_virtual_len(5);
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.file_count(), 2);

        let mut rng = StdRng::seed_from_u64(0);
        for i in 0..5 {
            let s = ds.get(i, &mut rng).unwrap();
            assert_eq!(s.clear.dim(), (1, 3, 16, 16));
            // green channel is untouched by the noisy offset, so Y differs
            // by the red offset alone and crops line up
            let d = s.noisy[[0, 0, 0, 0]] - s.clear[[0, 0, 0, 0]];
            assert!((d - 0.299 * 3.0 / 255.0 - 0.114 * -8.0 / 255.0).abs() < 1e-4, "offset {}", d);
        }

        let full = PairedDataset::open(&dir.path().join("noisy"), &dir.path().join("clear")).unwrap();
        let s = full.get(1, &mut rng).unwrap();
        assert_eq!(s.name, "b.png");
        assert_eq!(s.noisy.dim(), (1, 3, 48, 48));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_oversized_crop_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clear")).unwrap();
        fs::create_dir_all(dir.path().join("noisy")).unwrap();
        write_pair(dir.path(), "a.png", 16, 16);

        let huge = u32::MAX as usize + 1;
        let paired = PairedDataset::open(&dir.path().join("noisy"), &dir.path().join("clear")).unwrap();
        let err = paired.with_crop(huge).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("crop window")));
        assert!(SyntheticNoiseDataset::open(&dir.path().join("clear"), huge).is_err());
    }

    #[test]
    fn test_missing_noisy_counterpart() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clear")).unwrap();
        fs::create_dir_all(dir.path().join("noisy")).unwrap();
        RgbImage::new(8, 8).save(dir.path().join("clear").join("x.png")).unwrap();
        assert!(PairedDataset::open(&dir.path().join("noisy"), &dir.path().join("clear")).is_err());
    }

    #[test]
    fn test_synthetic_noise_is_seeded() {
        let dir = tempdir().unwrap();
        RgbImage::from_pixel(24, 24, Rgb([100, 100, 100]))
            .save(dir.path().join("c.png"))
            .unwrap();
        let ds = SyntheticNoiseDataset::open(dir.path(), 16).unwrap().preload().unwrap();
        let a = ds.get(0, &mut sample_rng(5, 1, 0)).unwrap();
        let b = ds.get(0, &mut sample_rng(5, 1, 0)).unwrap();
        assert_eq!(a.noisy, b.noisy);
        assert_ne!(a.noisy, a.clear);
        assert!(a.clear.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
