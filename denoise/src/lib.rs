pub mod checkpoint;
pub mod core;
pub mod dataset;
pub mod denoise;
pub mod model;
pub mod optim;
pub mod train;

pub use crate::core::{Tensor, WaveletError, WaveletResult};
pub use model::{DenoiseModel, Mode};
