//! 2D Haar transform pair on (batch, channel, height, width) tensors.
//!
//! Every 2×2 block `[a b; c d]` of each plane maps to one coefficient in each
//! of the four sub-bands:
//!
//! ```text
//! LL = (a + b + c + d) / 4     a = LL + LH + HL + HH
//! LH = (a - b + c - d) / 4     b = LL - LH + HL - HH
//! HL = (a + b - c - d) / 4     c = LL + LH - HL - HH
//! HH = (a - b - c + d) / 4     d = LL - LH - HL + HH
//! ```
//!
//! Analysis averages, synthesis sums, so `inverse(forward(x)) == x` up to
//! rounding. Both directions are linear; their adjoints are exposed so
//! gradients can be pulled back through either direction.

use ndarray::{concatenate, s, Array4, ArrayView4, Axis};

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::Tensor;

/// The four half-resolution sub-bands of one Haar step.
#[derive(Debug, Clone, PartialEq)]
pub struct Subbands {
    pub ll: Tensor,
    pub lh: Tensor,
    pub hl: Tensor,
    pub hh: Tensor,
}

impl Subbands {
    pub fn zeros_like(t: &Tensor) -> Self {
        let z = Tensor::zeros(t.raw_dim());
        Self {
            ll: z.clone(),
            lh: z.clone(),
            hl: z.clone(),
            hh: z,
        }
    }

    /// (batch, channel, height, width) shared by all four bands.
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.ll.dim()
    }

    /// LH, HL, HH stacked along the channel axis (3 × channel channels).
    pub fn detail(&self) -> WaveletResult<Tensor> {
        stack_details(&self.lh, &self.hl, &self.hh)
    }

    fn check_shapes(&self) -> WaveletResult<()> {
        let dim = self.ll.dim();
        for (name, band) in [("LH", &self.lh), ("HL", &self.hl), ("HH", &self.hh)] {
            if band.dim() != dim {
                return Err(WaveletError::shape(format!(
                    "sub-band {} has shape {:?}, LL has {:?}",
                    name,
                    band.dim(),
                    dim
                )));
            }
        }
        Ok(())
    }
}

/// Concatenate three detail bands along the channel axis.
pub fn stack_details(lh: &Tensor, hl: &Tensor, hh: &Tensor) -> WaveletResult<Tensor> {
    concatenate(Axis(1), &[lh.view(), hl.view(), hh.view()])
        .map_err(|e| WaveletError::shape(format!("cannot stack detail bands: {}", e)))
}

/// Split a (b, 3c, h, w) detail tensor back into (LH, HL, HH).
pub fn split_details(detail: &Tensor) -> WaveletResult<(Tensor, Tensor, Tensor)> {
    let channels = detail.dim().1;
    if channels == 0 || channels % 3 != 0 {
        return Err(WaveletError::shape(format!(
            "detail tensor must hold 3 × channel bands, got {} channels",
            channels
        )));
    }
    let c = channels / 3;
    Ok((
        detail.slice(s![.., 0..c, .., ..]).to_owned(),
        detail.slice(s![.., c..2 * c, .., ..]).to_owned(),
        detail.slice(s![.., 2 * c.., .., ..]).to_owned(),
    ))
}

fn quads(x: &Tensor) -> [ArrayView4<'_, f32>; 4] {
    [
        x.slice(s![.., .., 0..;2, 0..;2]),
        x.slice(s![.., .., 0..;2, 1..;2]),
        x.slice(s![.., .., 1..;2, 0..;2]),
        x.slice(s![.., .., 1..;2, 1..;2]),
    ]
}

/// Analysis step: image → (LL, LH, HL, HH) at half resolution.
pub fn forward(image: &Tensor) -> WaveletResult<Subbands> {
    let (_, _, h, w) = image.dim();
    if h == 0 || w == 0 || h % 2 != 0 || w % 2 != 0 {
        return Err(WaveletError::shape(format!(
            "Haar forward needs even, non-zero height and width, got {}x{}",
            h, w
        )));
    }

    let [a, b, c, d] = quads(image);
    let ll = (&a + &b + &c + &d) * 0.25;
    let lh = (&a - &b + &c - &d) * 0.25;
    let hl = (&a + &b - &c - &d) * 0.25;
    let hh = (&a - &b - &c + &d) * 0.25;

    Ok(Subbands { ll, lh, hl, hh })
}

/// Synthesis step: (LL, LH, HL, HH) → image at double resolution.
pub fn inverse(bands: &Subbands) -> WaveletResult<Tensor> {
    bands.check_shapes()?;
    let (n, ch, h, w) = bands.dim();
    let Subbands { ll, lh, hl, hh } = bands;

    let mut out = Array4::<f32>::zeros((n, ch, h * 2, w * 2));
    out.slice_mut(s![.., .., 0..;2, 0..;2])
        .assign(&(ll + lh + hl + hh));
    out.slice_mut(s![.., .., 0..;2, 1..;2])
        .assign(&(ll - lh + hl - hh));
    out.slice_mut(s![.., .., 1..;2, 0..;2])
        .assign(&(ll + lh - hl - hh));
    out.slice_mut(s![.., .., 1..;2, 1..;2])
        .assign(&(ll - lh - hl + hh));
    Ok(out)
}

/// Convenience wrapper taking the four bands separately.
pub fn inverse_bands(ll: &Tensor, lh: &Tensor, hl: &Tensor, hh: &Tensor) -> WaveletResult<Tensor> {
    inverse(&Subbands {
        ll: ll.clone(),
        lh: lh.clone(),
        hl: hl.clone(),
        hh: hh.clone(),
    })
}

/// Transpose of [`forward`]: pulls sub-band gradients back to the image.
pub fn forward_adjoint(grad: &Subbands) -> WaveletResult<Tensor> {
    let mut out = inverse(grad)?;
    out.mapv_inplace(|v| v * 0.25);
    Ok(out)
}

/// Transpose of [`inverse`]: pulls an image gradient back to the sub-bands.
pub fn inverse_adjoint(grad: &Tensor) -> WaveletResult<Subbands> {
    let mut bands = forward(grad)?;
    for band in [&mut bands.ll, &mut bands.lh, &mut bands.hl, &mut bands.hh] {
        band.mapv_inplace(|v| v * 4.0);
    }
    Ok(bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dot;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_tensor(dim: (usize, usize, usize, usize), seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Tensor::from_shape_fn(dim, |_| rng.random::<f32>())
    }

    #[test]
    fn test_roundtrip() {
        let x = random_tensor((2, 3, 16, 24), 7);
        let y = inverse(&forward(&x).unwrap()).unwrap();
        let max_err = x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-4, "roundtrip error {}", max_err);
    }

    #[test]
    fn test_constant_image_has_no_detail() {
        let x = Tensor::from_elem((1, 3, 8, 8), 0.6);
        let bands = forward(&x).unwrap();
        assert_eq!(bands.dim(), (1, 3, 4, 4));
        assert!(bands.ll.iter().all(|&v| (v - 0.6).abs() < 1e-6));
        assert!(bands.detail().unwrap().iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn test_odd_dimensions_rejected() {
        let x = Tensor::zeros((1, 3, 7, 8));
        assert!(matches!(forward(&x), Err(WaveletError::Shape(_))));
        let x = Tensor::zeros((1, 3, 8, 5));
        assert!(matches!(forward(&x), Err(WaveletError::Shape(_))));
    }

    #[test]
    fn test_mismatched_bands_rejected() {
        let mut bands = Subbands::zeros_like(&Tensor::zeros((1, 3, 4, 4)));
        bands.hh = Tensor::zeros((1, 3, 4, 2));
        assert!(matches!(inverse(&bands), Err(WaveletError::Shape(_))));
    }

    #[test]
    fn test_adjoint_identities() {
        // <F x, y> == <x, F^T y> and <I z, v> == <z, I^T v>
        let x = random_tensor((1, 2, 8, 8), 1);
        let y = Subbands {
            ll: random_tensor((1, 2, 4, 4), 2),
            lh: random_tensor((1, 2, 4, 4), 3),
            hl: random_tensor((1, 2, 4, 4), 4),
            hh: random_tensor((1, 2, 4, 4), 5),
        };

        let fx = forward(&x).unwrap();
        let lhs = dot(&fx.ll, &y.ll) + dot(&fx.lh, &y.lh) + dot(&fx.hl, &y.hl) + dot(&fx.hh, &y.hh);
        let rhs = dot(&x, &forward_adjoint(&y).unwrap());
        assert!((lhs - rhs).abs() < 1e-4, "forward adjoint: {} vs {}", lhs, rhs);

        let v = random_tensor((1, 2, 8, 8), 6);
        let iz = inverse(&y).unwrap();
        let itv = inverse_adjoint(&v).unwrap();
        let lhs = dot(&iz, &v);
        let rhs = dot(&y.ll, &itv.ll) + dot(&y.lh, &itv.lh) + dot(&y.hl, &itv.hl) + dot(&y.hh, &itv.hh);
        assert!((lhs - rhs).abs() < 1e-3, "inverse adjoint: {} vs {}", lhs, rhs);
    }

    #[test]
    fn test_split_details_roundtrip() {
        let bands = forward(&random_tensor((1, 3, 4, 4), 9)).unwrap();
        let (lh, hl, hh) = split_details(&bands.detail().unwrap()).unwrap();
        assert_eq!(lh, bands.lh);
        assert_eq!(hl, bands.hl);
        assert_eq!(hh, bands.hh);
        assert!(split_details(&Tensor::zeros((1, 4, 2, 2))).is_err());
    }
}
