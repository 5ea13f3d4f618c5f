use std::fmt;
use std::str::FromStr;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::ssim::MsSsimLoss;
use crate::core::Tensor;

/// PSNR reported for a perfect reconstruction.
pub const PSNR_CAP_DB: f32 = 100.0;

/// Share of the L1 term in [`PixelLoss::Mix`]; `1 - MS-SSIM` takes the rest.
pub const MIX_L1_WEIGHT: f32 = 0.84;

/// A scalar loss and its gradient with respect to the prediction.
#[derive(Debug, Clone)]
pub struct LossValue {
    pub value: f32,
    pub grad: Tensor,
}

/// Pixel loss, mean-reduced over every element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelLoss {
    L1,
    /// Quadratic below `beta`, linear above (PyTorch `SmoothL1Loss`).
    SmoothL1 { beta: f32 },
    Mse,
    /// `0.84 * L1 + 0.16 * (1 - MS-SSIM)` on a unit data range.
    Mix,
}

impl PixelLoss {
    pub fn smooth_l1() -> Self {
        PixelLoss::SmoothL1 { beta: 1.0 }
    }

    fn elementwise(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        check_same_shape(pred, target)?;
        let n = pred.len().max(1) as f64;
        let sum: f64 = Zip::from(pred)
            .and(target)
            .fold(0.0f64, |acc, &p, &t| acc + self.elem(p - t) as f64);
        Ok((sum / n) as f32)
    }

    pub fn value(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        let value = self.elementwise(pred, target)?;
        if *self != PixelLoss::Mix {
            return Ok(value);
        }
        let structural = MsSsimLoss::default().score(pred, target)?;
        Ok(MIX_L1_WEIGHT * value + (1.0 - MIX_L1_WEIGHT) * structural)
    }

    pub fn value_and_grad(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<LossValue> {
        let value = self.elementwise(pred, target)?;
        let inv_n = 1.0 / pred.len().max(1) as f32;
        let mut grad = Zip::from(pred)
            .and(target)
            .map_collect(|&p, &t| self.elem_grad(p - t) * inv_n);
        if *self != PixelLoss::Mix {
            return Ok(LossValue { value, grad });
        }

        let (structural, structural_grad) = MsSsimLoss::default().value_and_grad(pred, target)?;
        grad.mapv_inplace(|g| g * MIX_L1_WEIGHT);
        grad.scaled_add(1.0 - MIX_L1_WEIGHT, &structural_grad);
        Ok(LossValue {
            value: MIX_L1_WEIGHT * value + (1.0 - MIX_L1_WEIGHT) * structural,
            grad,
        })
    }

    #[inline]
    fn elem(&self, d: f32) -> f32 {
        match *self {
            PixelLoss::L1 | PixelLoss::Mix => d.abs(),
            PixelLoss::SmoothL1 { beta } => {
                let a = d.abs();
                if a < beta {
                    0.5 * d * d / beta
                } else {
                    a - 0.5 * beta
                }
            }
            PixelLoss::Mse => d * d,
        }
    }

    #[inline]
    fn elem_grad(&self, d: f32) -> f32 {
        match *self {
            PixelLoss::L1 | PixelLoss::Mix => sign(d),
            PixelLoss::SmoothL1 { beta } => {
                if d.abs() < beta {
                    d / beta
                } else {
                    sign(d)
                }
            }
            PixelLoss::Mse => 2.0 * d,
        }
    }
}

#[inline]
fn sign(d: f32) -> f32 {
    if d > 0.0 {
        1.0
    } else if d < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl fmt::Display for PixelLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLoss::L1 => write!(f, "l1"),
            PixelLoss::SmoothL1 { .. } => write!(f, "smooth-l1"),
            PixelLoss::Mse => write!(f, "mse"),
            PixelLoss::Mix => write!(f, "mix"),
        }
    }
}

impl FromStr for PixelLoss {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "l1" | "mae" => Ok(PixelLoss::L1),
            "smooth-l1" | "smooth_l1" | "huber" => Ok(PixelLoss::smooth_l1()),
            "mse" | "l2" => Ok(PixelLoss::Mse),
            "mix" | "ms-ssim-l1" => Ok(PixelLoss::Mix),
            _ => Err(format!("unknown pixel loss '{}'. Available: mix, l1, smooth-l1, mse", s)),
        }
    }
}

pub fn check_same_shape(pred: &Tensor, target: &Tensor) -> WaveletResult<()> {
    if pred.dim() != target.dim() {
        return Err(WaveletError::shape(format!(
            "prediction {:?} and target {:?} differ in shape",
            pred.dim(),
            target.dim()
        )));
    }
    Ok(())
}

/// A scoring collaborator (perceptual, structural, adversarial, ...).
///
/// Scorers that cannot provide a gradient still contribute to the reported
/// loss but leave the parameter update to the differentiable terms.
pub trait AuxiliaryLoss: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32>;

    fn gradient(&self, _pred: &Tensor, _target: &Tensor) -> WaveletResult<Option<Tensor>> {
        Ok(None)
    }
}

/// Primary image loss: the pixel term, optionally blended 50/50 with the
/// mean of the auxiliary scorers.
pub struct PhotometricLoss {
    pub pixel: PixelLoss,
    pub auxiliary: Vec<Box<dyn AuxiliaryLoss>>,
}

impl PhotometricLoss {
    pub fn new(pixel: PixelLoss) -> Self {
        Self {
            pixel,
            auxiliary: Vec::new(),
        }
    }

    pub fn with_auxiliary(mut self, aux: Box<dyn AuxiliaryLoss>) -> Self {
        self.auxiliary.push(aux);
        self
    }

    pub fn score(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<LossValue> {
        let mut out = self.pixel.value_and_grad(pred, target)?;
        if self.auxiliary.is_empty() {
            return Ok(out);
        }

        let share = 0.5 / self.auxiliary.len() as f32;
        let mut aux_sum = 0.0;
        out.grad.mapv_inplace(|g| g * 0.5);
        for aux in &self.auxiliary {
            aux_sum += aux.score(pred, target)?;
            if let Some(g) = aux.gradient(pred, target)? {
                check_same_shape(&g, pred)?;
                out.grad.scaled_add(share, &g);
            }
        }
        out.value = out.value * 0.5 + aux_sum * share;
        Ok(out)
    }

    /// Value only, for evaluation paths that never backpropagate.
    pub fn value(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        let px = self.pixel.value(pred, target)?;
        if self.auxiliary.is_empty() {
            return Ok(px);
        }
        let mut aux_sum = 0.0;
        for aux in &self.auxiliary {
            aux_sum += aux.score(pred, target)?;
        }
        Ok(px * 0.5 + aux_sum * 0.5 / self.auxiliary.len() as f32)
    }
}

/// Peak signal-to-noise ratio in dB.
pub fn psnr(pred: &Tensor, target: &Tensor, data_range: f32) -> WaveletResult<f32> {
    let mse = PixelLoss::Mse.value(pred, target)?;
    if mse <= 0.0 {
        return Ok(PSNR_CAP_DB);
    }
    Ok((10.0 * (data_range * data_range / mse).log10()).min(PSNR_CAP_DB))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ssim::SsimLoss;

    fn filled(v: f32) -> Tensor {
        Tensor::from_elem((1, 1, 2, 2), v)
    }

    #[test]
    fn test_smooth_l1_regions() {
        let pred = Tensor::from_shape_vec((1, 1, 1, 4), vec![0.0, 0.5, 2.0, -3.0]).unwrap();
        let target = Tensor::zeros((1, 1, 1, 4));
        let out = PixelLoss::smooth_l1().value_and_grad(&pred, &target).unwrap();
        // 0, 0.125, 1.5, 2.5 -> mean 1.03125
        assert!((out.value - 1.03125).abs() < 1e-6, "value {}", out.value);
        let g: Vec<f32> = out.grad.iter().copied().collect();
        assert_eq!(g, vec![0.0, 0.125, 0.25, -0.25]);
    }

    #[test]
    fn test_l1_and_mse() {
        let a = filled(0.75);
        let b = filled(0.25);
        assert!((PixelLoss::L1.value(&a, &b).unwrap() - 0.5).abs() < 1e-6);
        assert!((PixelLoss::Mse.value(&a, &b).unwrap() - 0.25).abs() < 1e-6);
        assert!(PixelLoss::L1.value(&a, &Tensor::zeros((1, 1, 2, 3))).is_err());
    }

    #[test]
    fn test_pixel_loss_parse() {
        assert_eq!("L1".parse::<PixelLoss>().unwrap(), PixelLoss::L1);
        assert_eq!("huber".parse::<PixelLoss>().unwrap(), PixelLoss::smooth_l1());
        assert_eq!("mix".parse::<PixelLoss>().unwrap(), PixelLoss::Mix);
        assert_eq!(PixelLoss::Mix.to_string(), "mix");
        assert!("ssim".parse::<PixelLoss>().is_err());
    }

    #[test]
    fn test_psnr() {
        let a = filled(0.5);
        assert_eq!(psnr(&a, &a, 1.0).unwrap(), PSNR_CAP_DB);
        // mse 0.01 -> 20 dB
        let b = filled(0.6);
        assert!((psnr(&a, &b, 1.0).unwrap() - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_mix_weighting() {
        let target = Tensor::from_shape_fn((1, 3, 16, 16), |(_, c, y, x)| ((x * 3 + y + c) % 7) as f32 / 7.0);
        let pred = target.mapv(|v| (v * 0.8 + 0.15).min(1.0));

        let l1 = PixelLoss::L1.value_and_grad(&pred, &target).unwrap();
        let (structural, structural_grad) = MsSsimLoss::default().value_and_grad(&pred, &target).unwrap();
        assert!(structural > 0.0);

        let mix = PixelLoss::Mix.value_and_grad(&pred, &target).unwrap();
        let expected = 0.84 * l1.value + 0.16 * structural;
        assert!((mix.value - expected).abs() < 1e-6, "{} vs {}", mix.value, expected);
        assert!((PixelLoss::Mix.value(&pred, &target).unwrap() - expected).abs() < 1e-6);
        Zip::from(&mix.grad)
            .and(&l1.grad)
            .and(&structural_grad)
            .for_each(|&m, &a, &b| assert!((m - (0.84 * a + 0.16 * b)).abs() < 1e-7));
        assert!(structural_grad.iter().any(|g| g.abs() > 1e-6));
    }

    struct Constant(f32);

    impl AuxiliaryLoss for Constant {
        fn name(&self) -> &str {
            "constant"
        }
        fn score(&self, _pred: &Tensor, _target: &Tensor) -> WaveletResult<f32> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_photometric_blend() {
        let a = filled(0.75);
        let b = filled(0.25);
        let plain = PhotometricLoss::new(PixelLoss::L1);
        assert!((plain.score(&a, &b).unwrap().value - 0.5).abs() < 1e-6);

        let blended = PhotometricLoss::new(PixelLoss::L1)
            .with_auxiliary(Box::new(Constant(0.1)))
            .with_auxiliary(Box::new(Constant(0.3)));
        let out = blended.score(&a, &b).unwrap();
        // 0.5 / 2 + mean(0.1, 0.3) / 2
        assert!((out.value - 0.35).abs() < 1e-6, "value {}", out.value);
        assert!((blended.value(&a, &b).unwrap() - 0.35).abs() < 1e-6);
        // pixel gradient is halved, scorers contribute none
        assert!(out.grad.iter().all(|&g| (g - 0.125).abs() < 1e-6));
    }

    #[test]
    fn test_ssim_auxiliary_steers_gradient() {
        let target = Tensor::from_shape_fn((1, 1, 16, 16), |(_, _, y, x)| ((x * 5 + y * 3) % 11) as f32 / 11.0);
        let pred = target.mapv(|v| 1.0 - v);

        let plain = PixelLoss::L1.value_and_grad(&pred, &target).unwrap();
        let mixed = PhotometricLoss::new(PixelLoss::L1)
            .with_auxiliary(Box::new(SsimLoss::default()))
            .score(&pred, &target)
            .unwrap();
        let max_diff = Zip::from(&plain.grad)
            .and(&mixed.grad)
            .fold(0.0f32, |acc, &p, &m| acc.max((0.5 * p - m).abs()));
        assert!(max_diff > 1e-5, "max diff {}", max_diff);
    }
}
