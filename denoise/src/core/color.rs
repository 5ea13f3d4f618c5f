use image::RgbImage;
use ndarray::Axis;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::Tensor;

/// RGB in [0, 1] → (Y, Cr, Cb) in [0, 1].
#[inline]
pub fn rgb_to_ycrcb(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = 0.5 * r - 0.418688 * g - 0.081312 * b + 0.5;
    let cb = -0.168736 * r - 0.331264 * g + 0.5 * b + 0.5;
    (y, cr, cb)
}

/// (Y, Cr, Cb) in [0, 1] → RGB, not clamped.
#[inline]
pub fn ycrcb_to_rgb(y: f32, cr: f32, cb: f32) -> (f32, f32, f32) {
    let cr = cr - 0.5;
    let cb = cb - 0.5;
    let r = y + 1.402 * cr;
    let g = y - 0.344136 * cb - 0.714136 * cr;
    let b = y + 1.772 * cb;
    (r, g, b)
}

/// 8-bit YCrCb → RGB, rounding once at the end.
#[inline]
pub fn ycrcb_to_rgb_u8(y: u8, cr: u8, cb: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let cr = cr as f32 - 128.0;
    let cb = cb as f32 - 128.0;

    let r = (y + 1.402 * cr).round().clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * cb - 0.714136 * cr).round().clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * cb).round().clamp(0.0, 255.0) as u8;

    (r, g, b)
}

/// Decode an RGB image into a (1, 3, h, w) YCrCb tensor.
pub fn tensor_from_rgb(img: &RgbImage) -> Tensor {
    let (w, h) = img.dimensions();
    let mut t = Tensor::zeros((1, 3, h as usize, w as usize));
    for (x, y, px) in img.enumerate_pixels() {
        let [r, g, b] = px.0;
        let (yy, cr, cb) = rgb_to_ycrcb(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
        let (x, y) = (x as usize, y as usize);
        t[[0, 0, y, x]] = yy;
        t[[0, 1, y, x]] = cr;
        t[[0, 2, y, x]] = cb;
    }
    t
}

/// Encode batch item `index` of a YCrCb tensor as a displayable RGB image.
///
/// Planes are clipped to [0, 1] and truncated to 8 bits before the color
/// conversion, which then rounds once.
pub fn rgb_from_tensor(t: &Tensor, index: usize) -> WaveletResult<RgbImage> {
    let (n, c, h, w) = t.dim();
    if c != 3 || index >= n {
        return Err(WaveletError::shape(format!(
            "cannot take RGB image {} from tensor {:?}",
            index,
            t.dim()
        )));
    }
    let plane = t.index_axis(Axis(0), index);
    let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;

    let mut img = RgbImage::new(w as u32, h as u32);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let (xi, yi) = (x as usize, y as usize);
        let (r, g, b) = ycrcb_to_rgb_u8(
            quantize(plane[[0, yi, xi]]),
            quantize(plane[[1, yi, xi]]),
            quantize(plane[[2, yi, xi]]),
        );
        px.0 = [r, g, b];
    }
    Ok(img)
}
