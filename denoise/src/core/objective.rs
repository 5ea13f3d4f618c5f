use crate::core::error::WaveletResult;
use crate::core::loss::PhotometricLoss;
use crate::core::pyramid::WaveletPyramid;
use crate::core::pyramid_loss::PyramidLoss;
use crate::core::reconstruct::DeepInverseLoss;
use crate::core::Tensor;

/// Weight of the pyramid term in the total loss.
pub const WAVELET_LOSS_WEIGHT: f32 = 0.2;

/// Gradient with respect to each part of a model output.
#[derive(Debug, Clone)]
pub struct OutputGradient {
    pub image: Tensor,
    pub pyramid: WaveletPyramid,
}

/// Scalar terms of one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    pub pixel: f32,
    pub pyramid: f32,
    pub deep_inverse: Option<f32>,
    pub total: f32,
}

pub struct LossComposer {
    pub photometric: PhotometricLoss,
    pub pyramid: PyramidLoss,
    pub deep_inverse: DeepInverseLoss,
    /// Zero disables the deep inverse term entirely.
    pub deep_inverse_weight: f32,
}

impl LossComposer {
    pub fn new(photometric: PhotometricLoss, pyramid: PyramidLoss) -> Self {
        Self {
            photometric,
            pyramid,
            deep_inverse: DeepInverseLoss::default(),
            deep_inverse_weight: 0.0,
        }
    }

    pub fn with_deep_inverse(mut self, weight: f32, loss: DeepInverseLoss) -> Self {
        self.deep_inverse_weight = weight;
        self.deep_inverse = loss;
        self
    }

    /// Score a model output and pull the total back onto it.
    pub fn evaluate(
        &self,
        image: &Tensor,
        pyramid: &WaveletPyramid,
        ground_truth: &Tensor,
    ) -> WaveletResult<(LossTerms, OutputGradient)> {
        let pixel = self.photometric.score(image, ground_truth)?;
        let wavelet = self.pyramid.score(pyramid, ground_truth)?;

        let mut pyramid_grad = pyramid.zeros_like();
        pyramid_grad.accumulate(&wavelet.grad, WAVELET_LOSS_WEIGHT)?;

        let mut terms = LossTerms {
            pixel: pixel.value,
            pyramid: wavelet.total,
            deep_inverse: None,
            total: pixel.value + WAVELET_LOSS_WEIGHT * wavelet.total,
        };

        if self.deep_inverse_weight > 0.0 {
            let deep = self.deep_inverse.score(pyramid, ground_truth, &self.photometric)?;
            pyramid_grad.accumulate(&deep.grad, self.deep_inverse_weight)?;
            terms.deep_inverse = Some(deep.value);
            terms.total += self.deep_inverse_weight * deep.value;
        }

        Ok((
            terms,
            OutputGradient {
                image: pixel.grad,
                pyramid: pyramid_grad,
            },
        ))
    }

    /// Photometric value of a restored image alone, as used when only the
    /// stitched image is available.
    pub fn image_loss(&self, image: &Tensor, ground_truth: &Tensor) -> WaveletResult<f32> {
        self.photometric.value(image, ground_truth)
    }
}
