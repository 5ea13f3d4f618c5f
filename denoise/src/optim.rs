use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Parameter;

/// Gradient norm ceiling applied before every step.
pub const MAX_GRAD_NORM: f32 = 2.0;

/// Tolerance of the learning-rate stop test.
const STOP_TOLERANCE: f64 = 1e-9;

/// Serializable optimizer state, keyed by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdState {
    pub lr: f64,
    pub momentum: f32,
    pub nesterov: bool,
    pub velocity: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f32,
    nesterov: bool,
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.9,
            nesterov: true,
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32, nesterov: bool) -> Self {
        self.momentum = momentum;
        self.nesterov = nesterov;
        self
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// `v = m * v + g; p -= lr * (g + m * v)` (Nesterov) or `p -= lr * v`.
    /// The first step seeds `v` with the raw gradient.
    pub fn step(&mut self, params: &mut [Parameter]) {
        let lr = self.lr as f32;
        let m = self.momentum;
        let nesterov = self.nesterov;
        for p in params.iter_mut() {
            if m == 0.0 {
                for (v, g) in p.value.iter_mut().zip(&p.grad) {
                    *v -= lr * g;
                }
                continue;
            }
            let buf = match self.velocity.entry(p.name.clone()) {
                Entry::Vacant(e) => e.insert(p.grad.clone()),
                Entry::Occupied(e) => {
                    let buf = e.into_mut();
                    if buf.len() == p.grad.len() {
                        for (b, g) in buf.iter_mut().zip(&p.grad) {
                            *b = m * *b + g;
                        }
                    } else {
                        *buf = p.grad.clone();
                    }
                    buf
                }
            };
            for ((v, g), b) in p.value.iter_mut().zip(&p.grad).zip(buf.iter()) {
                let d = if nesterov { g + m * b } else { *b };
                *v -= lr * d;
            }
        }
    }

    pub fn state(&self) -> SgdState {
        SgdState {
            lr: self.lr,
            momentum: self.momentum,
            nesterov: self.nesterov,
            velocity: self.velocity.clone(),
        }
    }

    pub fn load_state(&mut self, state: SgdState) {
        self.lr = state.lr;
        self.momentum = state.momentum;
        self.nesterov = state.nesterov;
        self.velocity = state.velocity;
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [Parameter], max_norm: f32) -> f32 {
    let total = params
        .iter()
        .flat_map(|p| p.grad.iter())
        .map(|&g| g as f64 * g as f64)
        .sum::<f64>()
        .sqrt() as f32;
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for g in params.iter_mut().flat_map(|p| p.grad.iter_mut()) {
            *g *= coef;
        }
    }
    total
}

/// Multiplies the learning rate by `gamma` each time the epoch counter
/// reaches a milestone.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
        }
    }

    /// `steps` milestones evenly spread over `epochs`, decaying by 0.1.
    /// `steps == 0` disables scheduling.
    pub fn from_steps(base_lr: f64, epochs: usize, steps: usize) -> Option<Self> {
        if steps == 0 {
            return None;
        }
        let span = epochs as f64 / (steps + 1) as f64;
        let milestones = (1..=steps).map(|i| (i as f64 * span) as usize).collect();
        Some(Self::new(base_lr, milestones, 0.1))
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn lr(&self) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= self.epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    /// Advance one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }

    /// Replay `epochs` steps, as when resuming a run.
    pub fn fast_forward(&mut self, epochs: usize) -> f64 {
        self.epoch += epochs;
        self.lr()
    }
}

/// The learning rate has decayed below the stop threshold.
pub fn lr_below_threshold(lr: f64, stop_criteria: f64) -> bool {
    lr - stop_criteria < -STOP_TOLERANCE
}
