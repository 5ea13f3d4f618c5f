use ndarray::{s, Array2, ArrayView2, Zip};
use rayon::prelude::*;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::loss::{check_same_shape, AuxiliaryLoss};
use crate::core::Tensor;

const K1: f32 = 0.01;
const K2: f32 = 0.03;

/// Per-scale exponents of multi-scale SSIM, finest first.
pub const MS_SSIM_WEIGHTS: [f32; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];

fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let center = (size / 2) as f32;
    let mut k: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = k.iter().sum();
    k.iter_mut().for_each(|v| *v /= sum);
    k
}

/// Separable 'valid' convolution with a symmetric 1D kernel.
fn filter_valid(plane: ArrayView2<'_, f32>, k: &[f32]) -> Array2<f32> {
    let (h, w) = plane.dim();
    let size = k.len();
    let ow = w + 1 - size;
    let oh = h + 1 - size;

    let mut rows = Array2::<f32>::zeros((h, ow));
    for y in 0..h {
        for x in 0..ow {
            let mut acc = 0.0;
            for (i, &kv) in k.iter().enumerate() {
                acc += kv * plane[[y, x + i]];
            }
            rows[[y, x]] = acc;
        }
    }
    let mut out = Array2::<f32>::zeros((oh, ow));
    for y in 0..oh {
        for x in 0..ow {
            let mut acc = 0.0;
            for (i, &kv) in k.iter().enumerate() {
                acc += kv * rows[[y + i, x]];
            }
            out[[y, x]] = acc;
        }
    }
    out
}

/// Transpose of [`filter_valid`]: spreads an (oh, ow) map back onto (h, w).
fn filter_valid_adjoint(map: &Array2<f32>, k: &[f32], h: usize, w: usize) -> Array2<f32> {
    let (oh, ow) = map.dim();
    let mut rows = Array2::<f32>::zeros((h, ow));
    for y in 0..oh {
        for x in 0..ow {
            let v = map[[y, x]];
            for (i, &kv) in k.iter().enumerate() {
                rows[[y + i, x]] += kv * v;
            }
        }
    }
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..ow {
            let v = rows[[y, x]];
            for (i, &kv) in k.iter().enumerate() {
                out[[y, x + i]] += kv * v;
            }
        }
    }
    out
}

/// 2x2 average pooling; odd sides get one zero of padding on each end,
/// counted in the average.
fn avg_pool2(plane: &Array2<f32>) -> Array2<f32> {
    let (h, w) = plane.dim();
    let (py, px) = (h % 2, w % 2);
    let (oh, ow) = (h.div_ceil(2), w.div_ceil(2));
    Array2::from_shape_fn((oh, ow), |(i, j)| {
        let mut acc = 0.0;
        for dy in 0..2 {
            for dx in 0..2 {
                let y = (2 * i + dy).checked_sub(py);
                let x = (2 * j + dx).checked_sub(px);
                if let (Some(y), Some(x)) = (y, x) {
                    if y < h && x < w {
                        acc += plane[[y, x]];
                    }
                }
            }
        }
        acc * 0.25
    })
}

fn avg_pool2_adjoint(grad: &Array2<f32>, h: usize, w: usize) -> Array2<f32> {
    let (py, px) = (h % 2, w % 2);
    let mut out = Array2::<f32>::zeros((h, w));
    for ((i, j), &g) in grad.indexed_iter() {
        for dy in 0..2 {
            for dx in 0..2 {
                let y = (2 * i + dy).checked_sub(py);
                let x = (2 * j + dx).checked_sub(px);
                if let (Some(y), Some(x)) = (y, x) {
                    if y < h && x < w {
                        out[[y, x]] += g * 0.25;
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    /// Full SSIM: luminance x contrast-structure.
    Ssim,
    /// Contrast-structure only.
    Cs,
}

/// Windowed first and second moments of one (pred, target) plane pair.
struct LocalStats {
    kernel: Vec<f32>,
    mu_x: Array2<f32>,
    mu_y: Array2<f32>,
    e_xx: Array2<f32>,
    e_yy: Array2<f32>,
    e_xy: Array2<f32>,
    c1: f32,
    c2: f32,
}

impl LocalStats {
    /// The window shrinks to the largest odd size that fits the plane.
    fn new(x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>, window: usize, sigma: f32, data_range: f32) -> Self {
        let (h, w) = x.dim();
        let mut size = window.min(h).min(w).max(1);
        if size % 2 == 0 {
            size -= 1;
        }
        let kernel = gaussian_kernel(size, sigma);
        let xx = &x * &x;
        let yy = &y * &y;
        let xy = &x * &y;
        Self {
            mu_x: filter_valid(x, &kernel),
            mu_y: filter_valid(y, &kernel),
            e_xx: filter_valid(xx.view(), &kernel),
            e_yy: filter_valid(yy.view(), &kernel),
            e_xy: filter_valid(xy.view(), &kernel),
            kernel,
            c1: (K1 * data_range).powi(2),
            c2: (K2 * data_range).powi(2),
        }
    }

    /// Map means of (ssim, cs).
    fn means(&self) -> (f32, f32) {
        let (c1, c2) = (self.c1, self.c2);
        let mut ssim = 0.0f64;
        let mut cs = 0.0f64;
        Zip::from(&self.mu_x)
            .and(&self.mu_y)
            .and(&self.e_xx)
            .and(&self.e_yy)
            .and(&self.e_xy)
            .for_each(|&mx, &my, &sxx, &syy, &sxy| {
                let a1 = 2.0 * mx * my + c1;
                let b1 = mx * mx + my * my + c1;
                let a2 = 2.0 * (sxy - mx * my) + c2;
                let b2 = (sxx - mx * mx) + (syy - my * my) + c2;
                let c = a2 / b2;
                cs += c as f64;
                ssim += (a1 / b1 * c) as f64;
            });
        let n = self.mu_x.len().max(1) as f64;
        ((ssim / n) as f32, (cs / n) as f32)
    }

    /// Gradient of the mean of `term` with respect to the prediction plane.
    fn pullback(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>, term: Term) -> Array2<f32> {
        let (c1, c2) = (self.c1, self.c2);
        let dim = self.mu_x.raw_dim();
        let mut d_mu = Array2::<f32>::zeros(dim.clone());
        let mut d_xx = Array2::<f32>::zeros(dim.clone());
        let mut d_xy = Array2::<f32>::zeros(dim);
        let inv_n = 1.0 / self.mu_x.len().max(1) as f32;

        for ((idx, dm), (&mx, &my)) in d_mu
            .indexed_iter_mut()
            .zip(self.mu_x.iter().zip(self.mu_y.iter()))
        {
            let sxx = self.e_xx[idx];
            let syy = self.e_yy[idx];
            let sxy = self.e_xy[idx];
            let a2 = 2.0 * (sxy - mx * my) + c2;
            let b2 = (sxx - mx * mx) + (syy - my * my) + c2;
            let cs = a2 / b2;
            let cs_mu = (2.0 * mx * a2 - 2.0 * my * b2) / (b2 * b2);
            let cs_xx = -a2 / (b2 * b2);
            let cs_xy = 2.0 / b2;

            let (g_mu, g_xx, g_xy) = match term {
                Term::Cs => (cs_mu, cs_xx, cs_xy),
                Term::Ssim => {
                    let a1 = 2.0 * mx * my + c1;
                    let b1 = mx * mx + my * my + c1;
                    let l = a1 / b1;
                    let l_mu = (2.0 * my * b1 - 2.0 * mx * a1) / (b1 * b1);
                    (l_mu * cs + l * cs_mu, l * cs_xx, l * cs_xy)
                }
            };
            *dm = g_mu * inv_n;
            d_xx[idx] = g_xx * inv_n;
            d_xy[idx] = g_xy * inv_n;
        }

        let (h, w) = x.dim();
        let mut grad = filter_valid_adjoint(&d_mu, &self.kernel, h, w);
        let back_xx = filter_valid_adjoint(&d_xx, &self.kernel, h, w);
        let back_xy = filter_valid_adjoint(&d_xy, &self.kernel, h, w);
        Zip::from(&mut grad)
            .and(&back_xx)
            .and(&back_xy)
            .and(&x)
            .and(&y)
            .for_each(|g, &bxx, &bxy, &xv, &yv| *g += 2.0 * xv * bxx + yv * bxy);
        grad
    }
}

type PlaneResult = (f32, Option<Array2<f32>>);

/// Apply `f` to every (batch, channel) plane pair; returns the mean value and,
/// when `f` yields them, the per-plane gradients scaled by `scale / planes`.
fn over_planes<F>(pred: &Tensor, target: &Tensor, scale: f32, f: F) -> WaveletResult<(f32, Option<Tensor>)>
where
    F: Fn(ArrayView2<'_, f32>, ArrayView2<'_, f32>) -> PlaneResult + Sync,
{
    check_same_shape(pred, target)?;
    let (n, c, _, _) = pred.dim();
    let planes: Vec<(usize, usize)> = (0..n).flat_map(|b| (0..c).map(move |ch| (b, ch))).collect();
    if planes.is_empty() {
        return Err(WaveletError::shape("structural similarity of an empty tensor"));
    }
    let results: Vec<PlaneResult> = planes
        .par_iter()
        .map(|&(b, ch)| f(pred.slice(s![b, ch, .., ..]), target.slice(s![b, ch, .., ..])))
        .collect();

    let count = planes.len() as f32;
    let mean = results.iter().map(|(v, _)| *v as f64).sum::<f64>() / planes.len() as f64;
    if results.iter().any(|(_, g)| g.is_none()) {
        return Ok((mean as f32, None));
    }
    let mut grad = Tensor::zeros(pred.raw_dim());
    for (&(b, ch), (_, g)) in planes.iter().zip(results) {
        if let Some(g) = g {
            grad.slice_mut(s![b, ch, .., ..]).assign(&(g * (scale / count)));
        }
    }
    Ok((mean as f32, Some(grad)))
}

/// `1 - SSIM` with a Gaussian window, averaged over every (batch, channel) plane.
#[derive(Debug, Clone)]
pub struct SsimLoss {
    pub window: usize,
    pub sigma: f32,
    pub data_range: f32,
}

impl Default for SsimLoss {
    fn default() -> Self {
        Self {
            window: 11,
            sigma: 1.5,
            data_range: 1.0,
        }
    }
}

impl SsimLoss {
    fn plane(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>, with_grad: bool) -> PlaneResult {
        let stats = LocalStats::new(x, y, self.window, self.sigma, self.data_range);
        let (ssim, _) = stats.means();
        let grad = with_grad.then(|| stats.pullback(x, y, Term::Ssim));
        (ssim, grad)
    }

    pub fn ssim(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        Ok(over_planes(pred, target, 1.0, |x, y| self.plane(x, y, false))?.0)
    }

    /// `(1 - SSIM, d/dpred)`.
    pub fn value_and_grad(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<(f32, Tensor)> {
        let (ssim, grad) = over_planes(pred, target, -1.0, |x, y| self.plane(x, y, true))?;
        let grad = grad.ok_or_else(|| WaveletError::shape("SSIM gradient unavailable"))?;
        Ok((1.0 - ssim, grad))
    }
}

impl AuxiliaryLoss for SsimLoss {
    fn name(&self) -> &str {
        "ssim"
    }

    fn score(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        Ok(1.0 - self.ssim(pred, target)?)
    }

    fn gradient(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<Option<Tensor>> {
        Ok(Some(self.value_and_grad(pred, target)?.1))
    }
}

/// `1 - MS-SSIM`: contrast-structure at each finer scale and full SSIM at the
/// coarsest, combined as a weighted geometric mean.
///
/// Scales stop once a 2x pooling would drop the short side below the window;
/// the weights of the scales in use are renormalized to sum to 1.
#[derive(Debug, Clone)]
pub struct MsSsimLoss {
    pub window: usize,
    pub sigma: f32,
    pub data_range: f32,
    pub weights: Vec<f32>,
}

impl Default for MsSsimLoss {
    fn default() -> Self {
        Self {
            window: 11,
            sigma: 1.5,
            data_range: 1.0,
            weights: MS_SSIM_WEIGHTS.to_vec(),
        }
    }
}

impl MsSsimLoss {
    /// Number of scales used for an (h, w) plane.
    pub fn scales(&self, h: usize, w: usize) -> usize {
        let (mut h, mut w) = (h, w);
        let mut scales = 1;
        while scales < self.weights.len() && h.div_ceil(2).min(w.div_ceil(2)) >= self.window {
            h = h.div_ceil(2);
            w = w.div_ceil(2);
            scales += 1;
        }
        scales
    }

    fn plane(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>, with_grad: bool) -> PlaneResult {
        let (h, w) = x.dim();
        let scales = self.scales(h, w);
        let total: f32 = self.weights[..scales].iter().sum();
        let weights: Vec<f32> = self.weights[..scales].iter().map(|w| w / total).collect();

        let mut xs = vec![x.to_owned()];
        let mut ys = vec![y.to_owned()];
        for j in 1..scales {
            xs.push(avg_pool2(&xs[j - 1]));
            ys.push(avg_pool2(&ys[j - 1]));
        }

        let stats: Vec<LocalStats> = (0..scales)
            .map(|j| LocalStats::new(xs[j].view(), ys[j].view(), self.window, self.sigma, self.data_range))
            .collect();
        let term = |j: usize| if j + 1 == scales { Term::Ssim } else { Term::Cs };
        let values: Vec<f32> = stats
            .iter()
            .enumerate()
            .map(|(j, st)| {
                let (ssim, cs) = st.means();
                let v = if term(j) == Term::Ssim { ssim } else { cs };
                v.max(0.0)
            })
            .collect();
        let ms: f32 = values.iter().zip(&weights).map(|(v, w)| v.powf(*w)).product();

        if !with_grad {
            return (ms, None);
        }
        if values.iter().any(|&v| v <= 0.0) {
            return (ms, Some(Array2::zeros((h, w))));
        }

        let mut acc: Option<Array2<f32>> = None;
        for j in (0..scales).rev() {
            let coef = weights[j] * ms / values[j];
            let mut g = stats[j].pullback(xs[j].view(), ys[j].view(), term(j)) * coef;
            if let Some(coarse) = acc {
                let (hj, wj) = xs[j].dim();
                g += &avg_pool2_adjoint(&coarse, hj, wj);
            }
            acc = Some(g);
        }
        (ms, acc)
    }

    pub fn ms_ssim(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        Ok(over_planes(pred, target, 1.0, |x, y| self.plane(x, y, false))?.0)
    }

    /// `(1 - MS-SSIM, d/dpred)`.
    pub fn value_and_grad(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<(f32, Tensor)> {
        let (ms, grad) = over_planes(pred, target, -1.0, |x, y| self.plane(x, y, true))?;
        let grad = grad.ok_or_else(|| WaveletError::shape("MS-SSIM gradient unavailable"))?;
        Ok((1.0 - ms, grad))
    }
}

impl AuxiliaryLoss for MsSsimLoss {
    fn name(&self) -> &str {
        "ms-ssim"
    }

    fn score(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<f32> {
        Ok(1.0 - self.ms_ssim(pred, target)?)
    }

    fn gradient(&self, pred: &Tensor, target: &Tensor) -> WaveletResult<Option<Tensor>> {
        Ok(Some(self.value_and_grad(pred, target)?.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dot;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn textured(dim: (usize, usize, usize, usize), seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Tensor::from_shape_fn(dim, |(_, c, y, x)| {
            0.3 + 0.2 * (((x * 3 + y * 5 + c) % 7) as f32 / 7.0) + 0.2 * rng.random::<f32>()
        })
    }

    fn near(target: &Tensor, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        target.mapv(|v| v + 0.1 * (rng.random::<f32>() - 0.5))
    }

    /// Central differences of `f` at a few positions against `grad`.
    fn check_gradient<F>(pred: &Tensor, grad: &Tensor, f: F)
    where
        F: Fn(&Tensor) -> f32,
    {
        let (_, c, h, w) = pred.dim();
        let eps = 5e-3;
        for &(ch, y, x) in &[(0, 0, 0), (0, 2, 3), (c - 1, h / 2, w / 2), (c - 1, h - 1, w - 1)] {
            let mut bumped = pred.clone();
            bumped[[0, ch, y, x]] += eps;
            let up = f(&bumped);
            bumped[[0, ch, y, x]] -= 2.0 * eps;
            let down = f(&bumped);
            let numeric = (up - down) / (2.0 * eps);
            let analytic = grad[[0, ch, y, x]];
            assert!(
                (numeric - analytic).abs() < 2e-4 + 0.05 * analytic.abs(),
                "({}, {}, {}): {} vs {}",
                ch,
                y,
                x,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_ssim_identical_and_different() {
        let x = Tensor::from_shape_fn((1, 3, 16, 16), |(_, c, y, x)| ((x + y + c) % 5) as f32 / 5.0);
        let ssim = SsimLoss::default();
        assert!(ssim.score(&x, &x).unwrap().abs() < 1e-4);
        let y = x.mapv(|v| 1.0 - v);
        assert!(ssim.score(&x, &y).unwrap() > 0.5);
    }

    #[test]
    fn test_ssim_gradient_matches_finite_difference() {
        let target = textured((1, 2, 12, 12), 3);
        let pred = near(&target, 4);
        let loss = SsimLoss {
            window: 7,
            ..SsimLoss::default()
        };
        let (value, grad) = loss.value_and_grad(&pred, &target).unwrap();
        assert!((value - loss.score(&pred, &target).unwrap()).abs() < 1e-6);
        check_gradient(&pred, &grad, |p| loss.score(p, &target).unwrap());
    }

    #[test]
    fn test_ssim_gradient_descends() {
        let target = textured((1, 1, 16, 16), 5);
        let pred = target.mapv(|v| 1.0 - v);
        let grad = SsimLoss::default().gradient(&pred, &target).unwrap().unwrap();
        assert!(grad.iter().any(|g| g.abs() > 1e-6));
        // descending the gradient improves similarity
        let stepped = &pred - &(&grad * 0.5);
        let loss = SsimLoss::default();
        assert!(loss.score(&stepped, &target).unwrap() < loss.score(&pred, &target).unwrap());
    }

    #[test]
    fn test_filter_and_pool_adjoints() {
        let x = textured((1, 1, 9, 7), 1);
        let plane = x.slice(s![0, 0, .., ..]).to_owned();
        let k = gaussian_kernel(5, 1.5);

        let fx = filter_valid(plane.view(), &k);
        let g = textured((1, 1, fx.dim().0, fx.dim().1), 2).slice(s![0, 0, .., ..]).to_owned();
        let lhs: f32 = (&fx * &g).sum();
        let rhs: f32 = (&plane * &filter_valid_adjoint(&g, &k, 9, 7)).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{} vs {}", lhs, rhs);

        let px = avg_pool2(&plane);
        assert_eq!(px.dim(), (5, 4));
        let gp = textured((1, 1, 5, 4), 6);
        let gp = gp.slice(s![0, 0, .., ..]).to_owned();
        let lhs: f32 = (&px * &gp).sum();
        let rhs: f32 = (&plane * &avg_pool2_adjoint(&gp, 9, 7)).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{} vs {}", lhs, rhs);
    }

    #[test]
    fn test_ms_ssim_scales() {
        let loss = MsSsimLoss::default();
        assert_eq!(loss.scales(512, 512), 5);
        assert_eq!(loss.scales(16, 16), 1);
        assert_eq!(loss.scales(44, 60), 3);

        // a single scale is plain SSIM
        let target = textured((1, 3, 16, 16), 8);
        let pred = near(&target, 9);
        let ms = loss.ms_ssim(&pred, &target).unwrap();
        let ss = SsimLoss::default().ssim(&pred, &target).unwrap();
        assert!((ms - ss).abs() < 1e-5, "{} vs {}", ms, ss);
        assert!(loss.score(&target, &target).unwrap().abs() < 1e-4);
    }

    #[test]
    fn test_ms_ssim_gradient_matches_finite_difference() {
        // 12x11 with a 5 window: two scales, odd width pooled with padding
        let target = textured((1, 1, 12, 11), 10);
        let pred = near(&target, 11);
        let loss = MsSsimLoss {
            window: 5,
            ..MsSsimLoss::default()
        };
        assert_eq!(loss.scales(12, 11), 2);
        let (_, grad) = loss.value_and_grad(&pred, &target).unwrap();
        check_gradient(&pred, &grad, |p| loss.score(p, &target).unwrap());
    }

    #[test]
    fn test_gradient_is_zero_on_identical_images() {
        let target = textured((1, 2, 12, 12), 12);
        let (value, grad) = SsimLoss::default().value_and_grad(&target, &target).unwrap();
        assert!(value.abs() < 1e-5);
        assert!(dot(&grad, &grad) < 1e-8);
    }
}
