use tracing::trace;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::haar;
use crate::core::loss::PixelLoss;
use crate::core::pyramid::WaveletPyramid;
use crate::core::Tensor;

#[derive(Debug, Clone)]
pub struct PyramidLossOutput {
    /// Unweighted loss of each level, finest first.
    pub per_level: Vec<f32>,
    /// `sum(per_level[i] * factor^i)`.
    pub total: f32,
    /// Gradient of `total` with respect to the predicted pyramid. Only the
    /// detail bands are non-zero.
    pub grad: WaveletPyramid,
}

/// Detail-band supervision: the ground truth is decomposed one Haar step per
/// predicted level and compared with that level's detail bands.
#[derive(Debug, Clone, Copy)]
pub struct PyramidLoss {
    /// Geometric decay applied per level, in (0, 1].
    pub factor: f32,
    pub criterion: PixelLoss,
}

impl Default for PyramidLoss {
    fn default() -> Self {
        Self {
            factor: 1.0,
            criterion: PixelLoss::smooth_l1(),
        }
    }
}

impl PyramidLoss {
    pub fn with_factor(factor: f32) -> Self {
        Self {
            factor,
            ..Self::default()
        }
    }

    /// Weighted sum of already computed per-level losses.
    pub fn accumulate(&self, per_level: &[f32]) -> WaveletResult<f32> {
        if per_level.is_empty() {
            return Err(WaveletError::EmptyPyramid);
        }
        let mut scale = 1.0f32;
        let mut total = 0.0f32;
        for &loss in per_level {
            total += loss * scale;
            scale *= self.factor;
        }
        Ok(total)
    }

    pub fn score(&self, predicted: &WaveletPyramid, ground_truth: &Tensor) -> WaveletResult<PyramidLossOutput> {
        if predicted.is_empty() {
            return Err(WaveletError::EmptyPyramid);
        }

        let mut grad = predicted.zeros_like();
        let mut per_level = Vec::with_capacity(predicted.len());
        let mut current = ground_truth.clone();
        let mut scale = 1.0f32;
        let mut total = 0.0f32;

        for (i, (level, level_grad)) in predicted
            .levels()
            .iter()
            .zip(grad.levels_mut().iter_mut())
            .enumerate()
        {
            let bands = haar::forward(&current)?;
            let target = bands.detail()?;
            let loss = self.criterion.value_and_grad(&level.detail, &target)?;
            trace!(level = i, loss = loss.value, scale, "pyramid level");

            total += loss.value * scale;
            level_grad.detail = loss.grad.mapv(|g| g * scale);
            per_level.push(loss.value);

            scale *= self.factor;
            current = bands.ll;
        }

        Ok(PyramidLossOutput { per_level, total, grad })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pyramid::WaveletLevel;

    fn sample(dim: (usize, usize, usize, usize)) -> Tensor {
        Tensor::from_shape_fn(dim, |(b, c, y, x)| ((b * 3 + c * 11 + y * 5 + x * 7) % 23) as f32 / 23.0)
    }

    #[test]
    fn test_geometric_decay() {
        let loss = PyramidLoss::with_factor(0.5);
        let total = loss.accumulate(&[1.0, 1.0, 1.0]).unwrap();
        assert!((total - 1.75).abs() < 1e-6, "total {}", total);
        assert_eq!(PyramidLoss::default().accumulate(&[1.0, 1.0, 1.0]).unwrap(), 3.0);
    }

    #[test]
    fn test_exact_prediction_scores_zero() {
        let gt = sample((2, 3, 16, 16));
        let pred = WaveletPyramid::decompose(&gt, 3).unwrap();
        let out = PyramidLoss::default().score(&pred, &gt).unwrap();
        assert_eq!(out.per_level.len(), 3);
        assert!(out.total.abs() < 1e-7);
        assert!(out.grad.levels().iter().all(|l| l.detail.iter().all(|&g| g == 0.0)));
    }

    #[test]
    fn test_offset_details_decay_per_level() {
        let gt = sample((1, 3, 16, 16));
        let mut pred = WaveletPyramid::decompose(&gt, 3).unwrap();
        for level in pred.levels_mut() {
            // smooth-L1 of a constant 2.0 error is 1.5
            level.detail.mapv_inplace(|v| v + 2.0);
            // approximation bands are not scored
            level.approx.fill(9.0);
        }
        let out = PyramidLoss::with_factor(0.5).score(&pred, &gt).unwrap();
        for v in &out.per_level {
            assert!((v - 1.5).abs() < 1e-5, "per level {}", v);
        }
        assert!((out.total - 1.5 * 1.75).abs() < 1e-5, "total {}", out.total);

        // gradient of the third level carries factor^2
        let n = out.grad.levels()[2].detail.len() as f32;
        let g = out.grad.levels()[2].detail[[0, 0, 0, 0]];
        assert!((g - 0.25 / n).abs() < 1e-9, "grad {}", g);
        assert!(out.grad.levels()[0].approx.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let gt = sample((1, 3, 8, 8));
        let mut pred = WaveletPyramid::decompose(&gt, 2).unwrap();
        for level in pred.levels_mut() {
            level.detail.mapv_inplace(|v| v * 0.5 + 0.1);
        }
        let loss = PyramidLoss::with_factor(0.7);
        let out = loss.score(&pred, &gt).unwrap();

        let eps = 1e-3;
        let mut bumped = pred.clone();
        bumped.levels_mut()[1].detail[[0, 4, 1, 1]] += eps;
        let up = loss.score(&bumped, &gt).unwrap().total;
        bumped.levels_mut()[1].detail[[0, 4, 1, 1]] -= 2.0 * eps;
        let down = loss.score(&bumped, &gt).unwrap().total;

        let numeric = (up - down) / (2.0 * eps);
        let analytic = out.grad.levels()[1].detail[[0, 4, 1, 1]];
        assert!((numeric - analytic).abs() < 1e-4, "{} vs {}", numeric, analytic);
    }

    #[test]
    fn test_empty_pyramid_rejected() {
        let gt = sample((1, 3, 8, 8));
        let loss = PyramidLoss::default();
        assert!(matches!(
            loss.score(&WaveletPyramid::default(), &gt),
            Err(WaveletError::EmptyPyramid)
        ));
        assert_eq!(loss.accumulate(&[]), Err(WaveletError::EmptyPyramid));
    }

    #[test]
    fn test_mismatched_level_is_shape_error() {
        let gt = sample((1, 3, 8, 8));
        let level = WaveletLevel::new(Tensor::zeros((1, 3, 2, 2)), Tensor::zeros((1, 9, 2, 2))).unwrap();
        let pred = WaveletPyramid::new(vec![level]).unwrap();
        assert!(matches!(PyramidLoss::default().score(&pred, &gt), Err(WaveletError::Shape(_))));
    }
}
