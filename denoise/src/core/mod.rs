pub mod color;
pub mod error;
pub mod haar;
pub mod loss;
pub mod objective;
pub mod pyramid;
pub mod pyramid_loss;
pub mod reconstruct;
pub mod ssim;
pub mod window;

pub use error::{WaveletError, WaveletResult};

/// Image batch laid out as (batch, channel, height, width).
pub type Tensor = ndarray::Array4<f32>;

/// Inner product of two equally shaped tensors, accumulated in f64.
pub fn dot(a: &Tensor, b: &Tensor) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
}
