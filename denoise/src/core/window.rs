//! Overlapping-window inference for images larger than the model window.
//!
//! Each axis is cut into windows of `window` pixels advancing by
//! `window - 2 * crop`. A window keeps its output except for `crop` pixels on
//! every interior edge; edges that touch the image border are kept whole.
//! When the image length is not reachable by whole strides the last window is
//! shifted inward to end on the border, so no synthetic padding is ever fed to
//! the model. Kept regions partition the axis: every output pixel comes from
//! exactly one window.

use ndarray::{s, Array4};
use tracing::debug;

use crate::core::error::{WaveletError, WaveletResult};
use crate::core::Tensor;

/// One window position along an axis and the output span it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSegment {
    pub window_start: usize,
    pub keep_start: usize,
    pub keep_end: usize,
}

impl AxisSegment {
    /// Kept span in window-local coordinates.
    pub fn local(&self) -> (usize, usize) {
        (
            self.keep_start - self.window_start,
            self.keep_end - self.window_start,
        )
    }
}

/// Plan the windows along one axis of length `len`.
pub fn plan_axis(len: usize, window: usize, crop: usize) -> WaveletResult<Vec<AxisSegment>> {
    if window == 0 {
        return Err(WaveletError::InvalidWindow("window size must be positive".into()));
    }
    if window > len {
        return Err(WaveletError::InvalidWindow(format!(
            "window {} is larger than image side {}",
            window, len
        )));
    }
    if crop * 2 >= window {
        return Err(WaveletError::InvalidWindow(format!(
            "crop {} leaves nothing of a {} window",
            crop, window
        )));
    }

    let stride = window - 2 * crop;
    let mut segments = Vec::new();
    let mut covered = 0;
    let mut pos = 0;
    loop {
        let start = pos.min(len - window);
        let last = start + window >= len;
        let keep_end = if last { len } else { start + window - crop };
        segments.push(AxisSegment {
            window_start: start,
            keep_start: covered,
            keep_end,
        });
        covered = keep_end;
        if last {
            break;
        }
        pos += stride;
    }
    Ok(segments)
}

/// Window size, per-call batch and discarded margin of a tiled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub window_size: usize,
    pub batch_size: usize,
    pub crop_size: usize,
}

impl WindowConfig {
    /// Margin defaults to 1/32 of the window.
    pub fn new(window_size: usize, batch_size: usize) -> Self {
        Self {
            window_size,
            batch_size,
            crop_size: window_size / 32,
        }
    }

    pub fn with_crop(mut self, crop_size: usize) -> Self {
        self.crop_size = crop_size;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Tile {
    batch: usize,
    y: AxisSegment,
    x: AxisSegment,
}

/// Full tiling plan for an (n, c, h, w) image.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    rows: Vec<AxisSegment>,
    cols: Vec<AxisSegment>,
    tiles: Vec<Tile>,
}

impl WindowPlan {
    pub fn new(dim: (usize, usize, usize, usize), cfg: &WindowConfig) -> WaveletResult<Self> {
        let (n, _, h, w) = dim;
        let rows = plan_axis(h, cfg.window_size, cfg.crop_size)?;
        let cols = plan_axis(w, cfg.window_size, cfg.crop_size)?;
        let mut tiles = Vec::with_capacity(n * rows.len() * cols.len());
        for batch in 0..n {
            for y in &rows {
                for x in &cols {
                    tiles.push(Tile { batch, y: *y, x: *x });
                }
            }
        }
        Ok(Self { rows, cols, tiles })
    }

    pub fn rows(&self) -> &[AxisSegment] {
        &self.rows
    }

    pub fn cols(&self) -> &[AxisSegment] {
        &self.cols
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

/// Copy the window at (y0, x0) of batch item `b` into slot `slot` of `dst`.
fn extract_window(src: &Tensor, b: usize, y0: usize, x0: usize, size: usize, dst: &mut Tensor, slot: usize) {
    dst.slice_mut(s![slot, .., .., ..])
        .assign(&src.slice(s![b, .., y0..y0 + size, x0..x0 + size]));
}

/// Place the kept part of one window output into the mosaic.
fn copy_window_into_mosaic(tile_out: &Tensor, slot: usize, tile: &Tile, mosaic: &mut Tensor) {
    let (ly0, ly1) = tile.y.local();
    let (lx0, lx1) = tile.x.local();
    mosaic
        .slice_mut(s![
            tile.batch,
            ..,
            tile.y.keep_start..tile.y.keep_end,
            tile.x.keep_start..tile.x.keep_end
        ])
        .assign(&tile_out.slice(s![slot, .., ly0..ly1, lx0..lx1]));
}

/// Run `infer` over overlapping windows of `image` and stitch the outputs.
///
/// `infer` receives (k, c, window, window) batches with `k <= batch_size` and
/// must return (k, c_out, window, window). The result has the input's batch
/// and spatial size and `c_out` channels.
pub fn run_windowed<F>(image: &Tensor, cfg: &WindowConfig, mut infer: F) -> WaveletResult<Tensor>
where
    F: FnMut(&Tensor) -> WaveletResult<Tensor>,
{
    if cfg.batch_size == 0 {
        return Err(WaveletError::InvalidWindow("batch size must be positive".into()));
    }
    let (n, c, h, w) = image.dim();
    let plan = WindowPlan::new(image.dim(), cfg)?;
    let size = cfg.window_size;
    debug!(
        height = h,
        width = w,
        window = size,
        crop = cfg.crop_size,
        rows = plan.rows.len(),
        cols = plan.cols.len(),
        "windowed inference plan"
    );

    let mut mosaic: Option<Tensor> = None;
    for chunk in plan.tiles.chunks(cfg.batch_size) {
        let mut batch = Array4::<f32>::zeros((chunk.len(), c, size, size));
        for (slot, tile) in chunk.iter().enumerate() {
            extract_window(image, tile.batch, tile.y.window_start, tile.x.window_start, size, &mut batch, slot);
        }

        let out = infer(&batch)?;
        let (k, c_out, oh, ow) = out.dim();
        if k != chunk.len() || oh != size || ow != size {
            return Err(WaveletError::shape(format!(
                "window model returned {:?} for a {:?} batch",
                out.dim(),
                batch.dim()
            )));
        }

        let target = mosaic.get_or_insert_with(|| Array4::<f32>::zeros((n, c_out, h, w)));
        if target.dim().1 != c_out {
            return Err(WaveletError::shape(format!(
                "window model changed output channels from {} to {}",
                target.dim().1,
                c_out
            )));
        }
        for (slot, tile) in chunk.iter().enumerate() {
            copy_window_into_mosaic(&out, slot, tile, target);
        }
    }

    mosaic.ok_or_else(|| WaveletError::InvalidWindow("image produced no windows".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_partition(len: usize, window: usize, crop: usize) {
        let segs = plan_axis(len, window, crop).unwrap();
        assert_eq!(segs[0].keep_start, 0);
        assert_eq!(segs.last().unwrap().keep_end, len);
        for pair in segs.windows(2) {
            assert_eq!(pair[0].keep_end, pair[1].keep_start, "gap or overlap");
        }
        for (i, seg) in segs.iter().enumerate() {
            assert!(seg.window_start + window <= len);
            assert!(seg.keep_start < seg.keep_end);
            let (l0, l1) = seg.local();
            assert!(l1 <= window);
            // interior edges drop at least `crop` pixels
            if i > 0 {
                assert!(l0 >= crop, "len {} seg {:?}", len, seg);
            }
            if i + 1 < segs.len() {
                assert!(l1 + crop <= window, "len {} seg {:?}", len, seg);
            }
        }
    }

    #[test]
    fn test_axis_partition() {
        for len in [128, 129, 200, 224, 255, 256, 300, 511, 1000] {
            check_partition(len, 128, 16);
            check_partition(len, 128, 0);
        }
        check_partition(64, 64, 8);
    }

    #[test]
    fn test_300_plan() {
        let segs = plan_axis(300, 128, 16).unwrap();
        assert_eq!(
            segs,
            vec![
                AxisSegment { window_start: 0, keep_start: 0, keep_end: 112 },
                AxisSegment { window_start: 96, keep_start: 112, keep_end: 208 },
                AxisSegment { window_start: 172, keep_start: 208, keep_end: 300 },
            ]
        );
    }

    #[test]
    fn test_identity_model_reproduces_input() {
        let image = Tensor::from_shape_fn((1, 3, 300, 300), |(_, c, y, x)| {
            ((y * 31 + x * 17 + c * 7) % 255) as f32 / 255.0
        });
        let cfg = WindowConfig::new(128, 4).with_crop(16);
        let mut calls = 0;
        let out = run_windowed(&image, &cfg, |batch| {
            calls += 1;
            assert!(batch.dim().0 <= 4);
            Ok(batch.clone())
        })
        .unwrap();
        assert_eq!(out.dim(), (1, 3, 300, 300));
        assert_eq!(out, image);
        // 3 x 3 windows in batches of 4
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_every_pixel_written_once() {
        let plan = WindowPlan::new((1, 1, 300, 257), &WindowConfig::new(128, 8).with_crop(16)).unwrap();
        let mut hits = vec![0u32; 300 * 257];
        for tile in &plan.tiles {
            for y in tile.y.keep_start..tile.y.keep_end {
                for x in tile.x.keep_start..tile.x.keep_end {
                    hits[y * 257 + x] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_window_larger_than_image() {
        let image = Tensor::zeros((1, 3, 100, 300));
        let cfg = WindowConfig::new(128, 4);
        let res = run_windowed(&image, &cfg, |b| Ok(b.clone()));
        assert!(matches!(res, Err(WaveletError::InvalidWindow(_))));
    }

    #[test]
    fn test_crop_too_large() {
        assert!(matches!(plan_axis(300, 32, 16), Err(WaveletError::InvalidWindow(_))));
    }

    #[test]
    fn test_model_output_shape_checked() {
        let image = Tensor::zeros((1, 3, 64, 64));
        let cfg = WindowConfig::new(32, 2);
        let res = run_windowed(&image, &cfg, |b| Ok(Tensor::zeros((b.dim().0, 3, 16, 16))));
        assert!(matches!(res, Err(WaveletError::Shape(_))));
    }
}
