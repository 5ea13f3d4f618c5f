use ndarray::{concatenate, s, Axis, Zip};

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::haar::{self, split_details, stack_details, Subbands};
use crate::core::Tensor;

/// One pyramid level: the approximation band plus the three detail bands
/// stacked on the channel axis (LH, HL, HH).
#[derive(Debug, Clone, PartialEq)]
pub struct WaveletLevel {
    pub approx: Tensor,
    pub detail: Tensor,
}

impl WaveletLevel {
    pub fn new(approx: Tensor, detail: Tensor) -> WaveletResult<Self> {
        let (n, c, h, w) = approx.dim();
        if detail.dim() != (n, c * 3, h, w) {
            return Err(WaveletError::shape(format!(
                "detail must be {:?} for approximation {:?}, got {:?}",
                (n, c * 3, h, w),
                approx.dim(),
                detail.dim()
            )));
        }
        Ok(Self { approx, detail })
    }

    pub fn from_subbands(bands: &Subbands) -> WaveletResult<Self> {
        Self::new(bands.ll.clone(), bands.detail()?)
    }

    /// Split the informal packed layout: first `channel` slice is the
    /// approximation, the remaining `3 × channel` are the detail bands.
    pub fn unpack(packed: &Tensor) -> WaveletResult<Self> {
        let channels = packed.dim().1;
        if channels == 0 || channels % 4 != 0 {
            return Err(WaveletError::shape(format!(
                "packed level must hold 4 × channel bands, got {} channels",
                channels
            )));
        }
        let c = channels / 4;
        Ok(Self {
            approx: packed.slice(s![.., 0..c, .., ..]).to_owned(),
            detail: packed.slice(s![.., c.., .., ..]).to_owned(),
        })
    }

    pub fn pack(&self) -> WaveletResult<Tensor> {
        concatenate(Axis(1), &[self.approx.view(), self.detail.view()])
            .map_err(|e| WaveletError::shape(format!("cannot pack level: {}", e)))
    }

    pub fn subbands(&self) -> WaveletResult<Subbands> {
        let (lh, hl, hh) = split_details(&self.detail)?;
        Ok(Subbands {
            ll: self.approx.clone(),
            lh,
            hl,
            hh,
        })
    }

    /// Build a level from an approximation and separate detail bands.
    pub fn from_bands(approx: Tensor, lh: &Tensor, hl: &Tensor, hh: &Tensor) -> WaveletResult<Self> {
        Self::new(approx, stack_details(lh, hl, hh)?)
    }

    pub fn channels(&self) -> usize {
        self.approx.dim().1
    }

    /// (height, width) of the bands at this level.
    pub fn spatial(&self) -> (usize, usize) {
        let (_, _, h, w) = self.approx.dim();
        (h, w)
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            approx: Tensor::zeros(self.approx.raw_dim()),
            detail: Tensor::zeros(self.detail.raw_dim()),
        }
    }
}

/// Ordered wavelet levels, finest (index 0) to coarsest.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WaveletPyramid {
    levels: Vec<WaveletLevel>,
}

impl WaveletPyramid {
    /// Each level must sit at exactly half the resolution of the previous one.
    pub fn new(levels: Vec<WaveletLevel>) -> WaveletResult<Self> {
        for pair in levels.windows(2) {
            let (h, w) = pair[0].spatial();
            let (nh, nw) = pair[1].spatial();
            if nh * 2 != h || nw * 2 != w || pair[0].channels() != pair[1].channels() {
                return Err(WaveletError::shape(format!(
                    "pyramid level {:?} does not follow {:?}",
                    pair[1].approx.dim(),
                    pair[0].approx.dim()
                )));
            }
        }
        Ok(Self { levels })
    }

    /// Build from packed (4 × channel) level tensors.
    pub fn from_packed(packed: &[Tensor]) -> WaveletResult<Self> {
        let levels = packed
            .iter()
            .map(WaveletLevel::unpack)
            .collect::<WaveletResult<Vec<_>>>()?;
        Self::new(levels)
    }

    pub fn to_packed(&self) -> WaveletResult<Vec<Tensor>> {
        self.levels.iter().map(WaveletLevel::pack).collect()
    }

    /// Recursively decompose `image` into `depth` levels.
    pub fn decompose(image: &Tensor, depth: usize) -> WaveletResult<Self> {
        let mut levels = Vec::with_capacity(depth);
        let mut current = image.clone();
        for _ in 0..depth {
            let bands = haar::forward(&current)?;
            let level = WaveletLevel::from_subbands(&bands)?;
            current = bands.ll;
            levels.push(level);
        }
        Ok(Self { levels })
    }

    /// Plain chained inversion from the deepest approximation (no rescale).
    pub fn reconstruct(&self) -> WaveletResult<Tensor> {
        crate::core::reconstruct::compose(self, 1.0)
    }

    pub fn levels(&self) -> &[WaveletLevel] {
        &self.levels
    }

    pub fn levels_mut(&mut self) -> &mut [WaveletLevel] {
        &mut self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn deepest(&self) -> Option<&WaveletLevel> {
        self.levels.last()
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            levels: self.levels.iter().map(WaveletLevel::zeros_like).collect(),
        }
    }

    /// Element-wise `self += scale * other`, level by level.
    pub fn accumulate(&mut self, other: &WaveletPyramid, scale: f32) -> WaveletResult<()> {
        if other.len() != self.len() {
            return Err(WaveletError::shape(format!(
                "cannot accumulate a {}-level pyramid into a {}-level one",
                other.len(),
                self.len()
            )));
        }
        for (dst, src) in self.levels.iter_mut().zip(other.levels.iter()) {
            if dst.approx.dim() != src.approx.dim() || dst.detail.dim() != src.detail.dim() {
                return Err(WaveletError::shape("pyramid level shapes differ"));
            }
            Zip::from(&mut dst.approx)
                .and(&src.approx)
                .for_each(|d, &s| *d += scale * s);
            Zip::from(&mut dst.detail)
                .and(&src.detail)
                .for_each(|d, &s| *d += scale * s);
        }
        Ok(())
    }
}

/// Deepest pyramid the trainer and denoiser accept.
pub const MAX_LEVELS: usize = 16;

/// Side length an image must be divisible by to survive `depth` Haar steps.
pub fn required_multiple(depth: usize) -> WaveletResult<usize> {
    u32::try_from(depth)
        .ok()
        .and_then(|d| 1usize.checked_shl(d))
        .ok_or_else(|| WaveletError::shape(format!("{} decomposition levels overflow the image side", depth)))
}

/// Check that an (h, w) image can be decomposed `depth` times.
pub fn check_decomposable(h: usize, w: usize, depth: usize) -> WaveletResult<()> {
    let m = required_multiple(depth)?;
    if h == 0 || w == 0 || h % m != 0 || w % m != 0 {
        return Err(WaveletError::shape(format!(
            "{}x{} image cannot be decomposed {} times (needs multiples of {})",
            h, w, depth, m
        )));
    }
    Ok(())
}
