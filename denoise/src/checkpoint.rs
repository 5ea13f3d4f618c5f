use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{WaveletError, WaveletResult};
use crate::model::{DenoiseModel, Parameter};
use crate::optim::{Sgd, SgdState};

/// Minimum accuracy gain that replaces the best checkpoint.
pub const BEST_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredParameter {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Architecture name and depth, so inference can rebuild the model.
    pub arch: String,
    pub levels: usize,
    pub model: BTreeMap<String, StoredParameter>,
    pub optimizer: SgdState,
    pub acc: f64,
    pub epoch: usize,
}

impl CheckpointRecord {
    pub fn capture(model: &dyn DenoiseModel, optimizer: &Sgd, acc: f64, epoch: usize) -> Self {
        let params = model
            .parameters()
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    StoredParameter {
                        shape: p.shape.clone(),
                        data: p.value.clone(),
                    },
                )
            })
            .collect();
        Self {
            arch: model.name().to_string(),
            levels: model.levels(),
            model: params,
            optimizer: optimizer.state(),
            acc,
            epoch,
        }
    }

    /// Write to `path.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self).context("serializing checkpoint")?;
            writer.flush().context("flushing checkpoint")?;
        }
        fs::rename(&tmp, path).with_context(|| format!("moving checkpoint to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
        let record: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| WaveletError::checkpoint("record", e.to_string()))
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        Ok(record)
    }

    /// Copy parameters (and optimizer state, when given) into live objects.
    ///
    /// Everything is validated first; on error nothing has been modified.
    pub fn load_into(&self, model: &mut dyn DenoiseModel, optimizer: Option<&mut Sgd>) -> WaveletResult<()> {
        self.check_model(model.parameters())?;
        if optimizer.is_some() {
            self.check_optimizer(model.parameters())?;
        }

        for p in model.parameters_mut() {
            if let Some(stored) = self.model.get(&p.name) {
                p.value.copy_from_slice(&stored.data);
            }
        }
        if let Some(opt) = optimizer {
            opt.load_state(self.optimizer.clone());
        }
        Ok(())
    }

    fn check_model(&self, params: &[Parameter]) -> WaveletResult<()> {
        for p in params {
            let key = format!("model.{}", p.name);
            let stored = self
                .model
                .get(&p.name)
                .ok_or_else(|| WaveletError::checkpoint(&key, "missing"))?;
            if stored.shape != p.shape {
                return Err(WaveletError::checkpoint(
                    &key,
                    format!("shape {:?} does not match model shape {:?}", stored.shape, p.shape),
                ));
            }
            if stored.data.len() != p.len() {
                return Err(WaveletError::checkpoint(
                    &key,
                    format!("{} values for shape {:?}", stored.data.len(), stored.shape),
                ));
            }
        }
        if let Some(extra) = self.model.keys().find(|k| !params.iter().any(|p| &p.name == *k)) {
            return Err(WaveletError::checkpoint(format!("model.{}", extra), "unexpected parameter"));
        }
        Ok(())
    }

    fn check_optimizer(&self, params: &[Parameter]) -> WaveletResult<()> {
        for (name, velocity) in &self.optimizer.velocity {
            let key = format!("optimizer.velocity.{}", name);
            let p = params
                .iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| WaveletError::checkpoint(&key, "no such parameter"))?;
            if velocity.len() != p.len() {
                return Err(WaveletError::checkpoint(
                    &key,
                    format!("{} values for a parameter of {}", velocity.len(), p.len()),
                ));
            }
        }
        if !(self.optimizer.lr.is_finite() && self.optimizer.lr > 0.0) {
            return Err(WaveletError::checkpoint("optimizer.lr", format!("invalid rate {}", self.optimizer.lr)));
        }
        Ok(())
    }
}

/// `<experiment>/checkpoints/{last,best}.json`.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    pub fn new(experiment: &Path) -> Self {
        Self {
            dir: experiment.join("checkpoints"),
        }
    }

    pub fn last(&self) -> PathBuf {
        self.dir.join("last.json")
    }

    pub fn best(&self) -> PathBuf {
        self.dir.join("best.json")
    }
}

/// Best validation accuracy seen so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTracker {
    best: f64,
}

impl Default for BestTracker {
    fn default() -> Self {
        Self { best: 0.0 }
    }
}

impl BestTracker {
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Record `acc`; true when it beats the best by more than [`BEST_EPSILON`].
    pub fn update(&mut self, acc: f64) -> bool {
        if self.best - acc < -BEST_EPSILON {
            self.best = acc;
            true
        } else {
            false
        }
    }
}

/// Always write `last`; write `best` when the tracker accepts `record.acc`.
/// Returns whether `best` was replaced.
pub fn persist(dir: &CheckpointDir, tracker: &mut BestTracker, record: &CheckpointRecord) -> Result<bool> {
    record.save(&dir.last())?;
    let improved = tracker.update(record.acc);
    if improved {
        record.save(&dir.best())?;
        info!(epoch = record.epoch, acc = record.acc, "new best checkpoint");
    }
    Ok(improved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Tensor;
    use crate::model::{Mode, WaveletShrinkage};
    use tempfile::tempdir;

    fn trained_model() -> (WaveletShrinkage, Sgd) {
        let mut model = WaveletShrinkage::new(3, 2);
        for (i, v) in model.parameters_mut()[0].value.iter_mut().enumerate() {
            *v = 0.1 * i as f32;
        }
        let mut opt = Sgd::new(1e-3);
        for p in model.parameters_mut() {
            p.grad.iter_mut().for_each(|g| *g = 0.5);
        }
        opt.step(model.parameters_mut());
        (model, opt)
    }

    #[test]
    fn test_best_only_on_strict_improvement() {
        let mut tracker = BestTracker::default();
        let written: Vec<usize> = [10.0, 9.9, 10.2, 10.2000001]
            .iter()
            .enumerate()
            .filter(|(_, &acc)| tracker.update(acc))
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(written, vec![1, 3]);
        assert_eq!(tracker.best(), 10.2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints").join("last.json");
        let (model, opt) = trained_model();
        let record = CheckpointRecord::capture(&model, &opt, 27.5, 4);
        record.save(&path).unwrap();

        let loaded = CheckpointRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        let mut fresh = WaveletShrinkage::new(3, 2);
        let mut fresh_opt = Sgd::new(1.0);
        loaded.load_into(&mut fresh, Some(&mut fresh_opt)).unwrap();
        for (a, b) in fresh.parameters().iter().zip(model.parameters()) {
            assert_eq!(a.value, b.value, "{}", a.name);
        }
        assert_eq!(fresh_opt.state(), opt.state());

        let x = Tensor::from_elem((1, 3, 8, 8), 0.5);
        let mut model = model;
        let a = model.forward(&x, Mode::Eval).unwrap().image;
        let b = fresh.forward(&x, Mode::Eval).unwrap().image;
        assert_eq!(a, b);
    }

    #[test]
    fn test_incompatible_record_names_key_and_changes_nothing() {
        let (model, opt) = trained_model();
        let record = CheckpointRecord::capture(&model, &opt, 1.0, 1);

        // deeper model: detail_gain shape differs
        let mut deeper = WaveletShrinkage::new(3, 3);
        let before = deeper.parameters().to_vec();
        let err = record.load_into(&mut deeper, None).unwrap_err();
        match err {
            WaveletError::CheckpointLoad { key, .. } => assert_eq!(key, "model.detail_gain"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(deeper.parameters(), before.as_slice());

        let mut missing = record.clone();
        missing.model.remove("approx_bias");
        let mut target = WaveletShrinkage::new(3, 2);
        let err = missing.load_into(&mut target, None).unwrap_err();
        assert_eq!(err, WaveletError::checkpoint("model.approx_bias", "missing"));

        let mut bad_opt = record.clone();
        bad_opt.optimizer.velocity.insert("approx_gain".into(), vec![0.0; 7]);
        let mut target_opt = Sgd::new(0.5);
        assert!(matches!(
            bad_opt.load_into(&mut target, Some(&mut target_opt)),
            Err(WaveletError::CheckpointLoad { .. })
        ));
        assert_eq!(target_opt.lr(), 0.5);
        // model-only load ignores optimizer state
        bad_opt.load_into(&mut target, None).unwrap();
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("best.json");
        fs::write(&path, b"{\"model\": 3").unwrap();
        let err = CheckpointRecord::load(&path).unwrap_err();
        assert!(err.downcast_ref::<WaveletError>().is_some(), "{:#}", err);
    }

    #[test]
    fn test_persist_writes_last_always_best_on_improvement() {
        let dir = tempdir().unwrap();
        let ckpt = CheckpointDir::new(dir.path());
        let (model, opt) = trained_model();
        let mut tracker = BestTracker::default();

        let first = CheckpointRecord::capture(&model, &opt, 20.0, 1);
        assert!(persist(&ckpt, &mut tracker, &first).unwrap());
        let worse = CheckpointRecord::capture(&model, &opt, 19.0, 2);
        assert!(!persist(&ckpt, &mut tracker, &worse).unwrap());

        assert_eq!(CheckpointRecord::load(&ckpt.last()).unwrap().epoch, 2);
        assert_eq!(CheckpointRecord::load(&ckpt.best()).unwrap().epoch, 1);
    }
}
