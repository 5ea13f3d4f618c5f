use tracing::debug;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::haar::{self, split_details, Subbands};
use crate::core::loss::PhotometricLoss;
use crate::core::pyramid::WaveletPyramid;
use crate::core::Tensor;

/// Normalization reapplied after every inversion step of the deep loss.
pub const DEFAULT_RESCALE: f32 = 2.0;

/// Invert the pyramid from its deepest approximation band upward, scaling
/// each intermediate image by `rescale`.
///
/// Only the deepest level's approximation is consumed; the approximation
/// bands of finer levels are ignored and replaced by the running composition.
pub fn compose(pyramid: &WaveletPyramid, rescale: f32) -> WaveletResult<Tensor> {
    let deepest = pyramid.deepest().ok_or(WaveletError::EmptyPyramid)?;
    let mut composed = deepest.approx.clone();

    for level in pyramid.levels().iter().rev() {
        let (lh, hl, hh) = split_details(&level.detail)?;
        let mut image = haar::inverse(&Subbands {
            ll: composed,
            lh,
            hl,
            hh,
        })?;
        if rescale != 1.0 {
            image.mapv_inplace(|v| v * rescale);
        }
        composed = image;
    }
    Ok(composed)
}

/// Transpose of [`compose`]: pulls a full-resolution gradient back onto the
/// pyramid. Every detail band receives a gradient; among the approximation
/// bands only the deepest one does.
pub fn compose_adjoint(
    pyramid: &WaveletPyramid,
    grad: &Tensor,
    rescale: f32,
) -> WaveletResult<WaveletPyramid> {
    if pyramid.is_empty() {
        return Err(WaveletError::EmptyPyramid);
    }
    let mut out = pyramid.zeros_like();
    let mut g = grad.clone();

    for (i, level) in out.levels_mut().iter_mut().enumerate() {
        if rescale != 1.0 {
            g.mapv_inplace(|v| v * rescale);
        }
        let bands = haar::inverse_adjoint(&g)?;
        if bands.ll.dim() != level.approx.dim() {
            return Err(WaveletError::shape(format!(
                "gradient at level {} has shape {:?}, pyramid level is {:?}",
                i,
                bands.ll.dim(),
                level.approx.dim()
            )));
        }
        level.detail = bands.detail()?;
        g = bands.ll;
    }

    if let Some(last) = out.levels_mut().last_mut() {
        last.approx = g;
    }
    Ok(out)
}

/// Result of scoring one predicted pyramid through full reconstruction.
#[derive(Debug, Clone)]
pub struct DeepInverseOutput {
    pub value: f32,
    pub reconstruction: Tensor,
    /// Gradient of `value` with respect to every band of the pyramid.
    pub grad: WaveletPyramid,
}

/// Reconstructs the image from the deepest predicted level upward and scores
/// it against the ground truth with the photometric criterion.
#[derive(Debug, Clone, Copy)]
pub struct DeepInverseLoss {
    pub rescale: f32,
}

impl Default for DeepInverseLoss {
    fn default() -> Self {
        Self {
            rescale: DEFAULT_RESCALE,
        }
    }
}

impl DeepInverseLoss {
    pub fn with_rescale(rescale: f32) -> Self {
        Self { rescale }
    }

    pub fn reconstruct(&self, pyramid: &WaveletPyramid) -> WaveletResult<Tensor> {
        compose(pyramid, self.rescale)
    }

    pub fn score(
        &self,
        pyramid: &WaveletPyramid,
        ground_truth: &Tensor,
        criterion: &PhotometricLoss,
    ) -> WaveletResult<DeepInverseOutput> {
        let reconstruction = self.reconstruct(pyramid)?;
        let loss = criterion.score(&reconstruction, ground_truth)?;
        let grad = compose_adjoint(pyramid, &loss.grad, self.rescale)?;
        debug!(
            levels = pyramid.len(),
            value = loss.value,
            "deep inverse loss"
        );
        Ok(DeepInverseOutput {
            value: loss.value,
            reconstruction,
            grad,
        })
    }
}
