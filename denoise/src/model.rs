use anyhow::{bail, Result};
use ndarray::{Axis, Zip};
use tracing::debug;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::haar;
use crate::core::objective::OutputGradient;
use crate::core::pyramid::{check_decomposable, WaveletLevel, WaveletPyramid};
use crate::core::window::{run_windowed, WindowConfig};
use crate::core::Tensor;

/// Execution mode passed explicitly to every forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Keep whatever `backward` needs.
    Train,
    Eval,
}

/// Restored image, its predicted pyramid (finest level first) and
/// visualization maps.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub image: Tensor,
    pub pyramid: WaveletPyramid,
    pub attention_maps: Vec<Tensor>,
}

/// Flat learnable tensor with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Parameter {
    pub fn filled(name: impl Into<String>, shape: Vec<usize>, v: f32) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            value: vec![v; len],
            grad: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

pub trait DenoiseModel: Send {
    fn name(&self) -> &str;

    /// Number of pyramid levels every output carries.
    fn levels(&self) -> usize;

    fn forward(&mut self, noisy: &Tensor, mode: Mode) -> WaveletResult<ModelOutput>;

    /// Accumulate parameter gradients for the last `Mode::Train` forward.
    fn backward(&mut self, grad: &OutputGradient) -> WaveletResult<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}

pub const WAVELET_SHRINKAGE: &str = "wavelet-shrinkage";

/// Build a model by its CLI name.
pub fn build_model(name: &str, levels: usize) -> Result<Box<dyn DenoiseModel>> {
    match name {
        WAVELET_SHRINKAGE | "shrinkage" => Ok(Box::new(WaveletShrinkage::new(3, levels))),
        _ => bail!("unknown model '{}'. Available: {}", name, WAVELET_SHRINKAGE),
    }
}

const DETAIL_GAIN: usize = 0;
const APPROX_GAIN: usize = 1;
const APPROX_BIAS: usize = 2;

/// Learned per-level, per-band, per-channel gains on the Haar detail bands of
/// the input, plus an affine map of the deepest approximation band. The
/// restored image is the chained inverse of the adjusted pyramid.
///
/// Gains start at 1 and the bias at 0, so an untrained model is the identity.
pub struct WaveletShrinkage {
    channels: usize,
    levels: usize,
    params: Vec<Parameter>,
    /// Decomposition of the last training input.
    cached: Option<WaveletPyramid>,
}

impl WaveletShrinkage {
    pub fn new(channels: usize, levels: usize) -> Self {
        let params = vec![
            Parameter::filled("detail_gain", vec![levels, 3 * channels], 1.0),
            Parameter::filled("approx_gain", vec![channels], 1.0),
            Parameter::filled("approx_bias", vec![channels], 0.0),
        ];
        Self {
            channels,
            levels,
            params,
            cached: None,
        }
    }

    fn detail_gains(&self, level: usize) -> &[f32] {
        let k = 3 * self.channels;
        &self.params[DETAIL_GAIN].value[level * k..(level + 1) * k]
    }

    fn check_input(&self, noisy: &Tensor) -> WaveletResult<()> {
        let (_, c, h, w) = noisy.dim();
        if c != self.channels {
            return Err(WaveletError::shape(format!(
                "model expects {} channels, got {}",
                self.channels, c
            )));
        }
        if self.levels == 0 {
            return Err(WaveletError::EmptyPyramid);
        }
        check_decomposable(h, w, self.levels)
    }
}

/// Channel mean of |detail| at each level, shaped (n, 1, h, w).
fn detail_energy(pyramid: &WaveletPyramid) -> Vec<Tensor> {
    pyramid
        .levels()
        .iter()
        .map(|level| {
            let k = level.detail.dim().1.max(1) as f32;
            level
                .detail
                .mapv(f32::abs)
                .sum_axis(Axis(1))
                .mapv(|v| v / k)
                .insert_axis(Axis(1))
        })
        .collect()
}

impl DenoiseModel for WaveletShrinkage {
    fn name(&self) -> &str {
        WAVELET_SHRINKAGE
    }

    fn levels(&self) -> usize {
        self.levels
    }

    fn forward(&mut self, noisy: &Tensor, mode: Mode) -> WaveletResult<ModelOutput> {
        self.check_input(noisy)?;
        let input = WaveletPyramid::decompose(noisy, self.levels)?;

        let mut details = Vec::with_capacity(self.levels);
        for (i, level) in input.levels().iter().enumerate() {
            let mut d = level.detail.clone();
            for (mut band, &g) in d.axis_iter_mut(Axis(1)).zip(self.detail_gains(i)) {
                band.mapv_inplace(|v| v * g);
            }
            details.push(d);
        }

        let deepest = input.deepest().ok_or(WaveletError::EmptyPyramid)?;
        let mut composed = deepest.approx.clone();
        let gain = &self.params[APPROX_GAIN].value;
        let bias = &self.params[APPROX_BIAS].value;
        for (c, mut plane) in composed.axis_iter_mut(Axis(1)).enumerate() {
            plane.mapv_inplace(|v| v * gain[c] + bias[c]);
        }

        // Coarsest first: each level's approximation is the composition of
        // everything below it.
        let mut levels = Vec::with_capacity(self.levels);
        for detail in details.into_iter().rev() {
            let (lh, hl, hh) = haar::split_details(&detail)?;
            let image = haar::inverse_bands(&composed, &lh, &hl, &hh)?;
            levels.push(WaveletLevel::new(composed, detail)?);
            composed = image;
        }
        levels.reverse();
        let pyramid = WaveletPyramid::new(levels)?;

        self.cached = match mode {
            Mode::Train => Some(input),
            Mode::Eval => None,
        };

        Ok(ModelOutput {
            attention_maps: detail_energy(&pyramid),
            image: composed,
            pyramid,
        })
    }

    fn backward(&mut self, grad: &OutputGradient) -> WaveletResult<()> {
        let input = self
            .cached
            .take()
            .ok_or_else(|| WaveletError::shape("backward without a Mode::Train forward"))?;
        if grad.pyramid.len() != input.len() {
            return Err(WaveletError::shape(format!(
                "gradient pyramid has {} levels, model has {}",
                grad.pyramid.len(),
                input.len()
            )));
        }

        let k = 3 * self.channels;
        let mut g = grad.image.clone();
        for (i, (level_in, level_grad)) in input.levels().iter().zip(grad.pyramid.levels()).enumerate() {
            let bands = haar::inverse_adjoint(&g)?;
            let mut g_detail = bands.detail()?;
            if g_detail.dim() != level_grad.detail.dim() {
                return Err(WaveletError::shape(format!(
                    "detail gradient {:?} does not match level {} shape {:?}",
                    level_grad.detail.dim(),
                    i,
                    g_detail.dim()
                )));
            }
            if bands.ll.dim() != level_grad.approx.dim() {
                return Err(WaveletError::shape(format!(
                    "approximation gradient {:?} does not match level {} shape {:?}",
                    level_grad.approx.dim(),
                    i,
                    bands.ll.dim()
                )));
            }
            g_detail += &level_grad.detail;

            let gains = &mut self.params[DETAIL_GAIN].grad[i * k..(i + 1) * k];
            for ((dg, gd), x) in gains
                .iter_mut()
                .zip(g_detail.axis_iter(Axis(1)))
                .zip(level_in.detail.axis_iter(Axis(1)))
            {
                *dg += Zip::from(gd).and(x).fold(0.0f32, |acc, &a, &b| acc + a * b);
            }

            g = bands.ll + &level_grad.approx;
        }

        let deepest = input.deepest().ok_or(WaveletError::EmptyPyramid)?;
        for (c, (gc, xc)) in g
            .axis_iter(Axis(1))
            .zip(deepest.approx.axis_iter(Axis(1)))
            .enumerate()
        {
            self.params[APPROX_GAIN].grad[c] += Zip::from(&gc).and(xc).fold(0.0f32, |acc, &a, &b| acc + a * b);
            self.params[APPROX_BIAS].grad[c] += gc.sum();
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

/// Restore a whole image of any size by tiled inference in eval mode.
pub fn denoise(model: &mut dyn DenoiseModel, image: &Tensor, cfg: &WindowConfig) -> WaveletResult<Tensor> {
    debug!(model = model.name(), dim = ?image.dim(), "denoise");
    run_windowed(image, cfg, |batch| Ok(model.forward(batch, Mode::Eval)?.image))
}
