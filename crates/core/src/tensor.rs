//! Planar (channel-major) float tensors.
//!
//! [`TensorBuffer`] owns a contiguous `(C, H, W)` buffer. The batch dimension
//! the inference capability expects is added at the model boundary only.

use anyhow::{bail, Context, Result};
use ndarray::{s, Array3, ArrayView3};

/// Contiguous CHW float buffer, values nominally in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    data: Array3<f32>,
}

impl TensorBuffer {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((channels, height, width)),
        }
    }

    pub fn from_vec(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        let expected = channels * height * width;
        if data.len() != expected {
            bail!(
                "TensorBuffer: data length mismatch: expected {} ({}x{}x{}), got {}",
                expected,
                channels,
                height,
                width,
                data.len()
            );
        }
        let data = Array3::from_shape_vec((channels, height, width), data)
            .context("TensorBuffer: failed to reshape data")?;
        Ok(Self { data })
    }

    /// Wraps an array, forcing standard (C-contiguous) layout.
    pub fn from_array(data: Array3<f32>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }

    /// `(channels, height, width)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels(), self.height(), self.width())
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Flat CHW data. `None` only if the layout invariant was broken.
    pub fn as_slice(&self) -> Option<&[f32]> {
        self.data.as_slice()
    }

    /// Zero-copy view of the `height x width` rectangle at `(y, x)`.
    pub fn crop(&self, y: usize, x: usize, height: usize, width: usize) -> Result<ArrayView3<'_, f32>> {
        self.check_rect("crop", y, x, height, width)?;
        Ok(self.data.slice(s![.., y..y + height, x..x + width]))
    }

    pub fn crop_owned(&self, y: usize, x: usize, height: usize, width: usize) -> Result<Self> {
        Ok(Self::from_array(self.crop(y, x, height, width)?.to_owned()))
    }

    /// Copies `src` into this buffer with its top-left corner at `(y, x)`.
    pub fn paste(&mut self, src: ArrayView3<'_, f32>, y: usize, x: usize) -> Result<()> {
        let (c, h, w) = src.dim();
        if c != self.channels() {
            bail!(
                "paste: channel mismatch: destination has {}, source has {}",
                self.channels(),
                c
            );
        }
        self.check_rect("paste", y, x, h, w)?;
        self.data
            .slice_mut(s![.., y..y + h, x..x + w])
            .assign(&src);
        Ok(())
    }

    fn check_rect(&self, op: &str, y: usize, x: usize, height: usize, width: usize) -> Result<()> {
        if y + height > self.height() || x + width > self.width() {
            bail!(
                "{op}: rectangle {}x{} at ({}, {}) exceeds tensor bounds {}x{}",
                height,
                width,
                y,
                x,
                self.height(),
                self.width()
            );
        }
        Ok(())
    }

    /// Interleaved RGB8 → planar 3-channel tensor in `[0, 1]`.
    pub fn from_rgb8(data: &[u8], width: u32, height: u32) -> Result<Self> {
        Self::from_interleaved_u8(data, width, height, 3)
    }

    /// Interleaved RGBA8 → planar 3-channel tensor; alpha is dropped.
    pub fn from_rgba8(data: &[u8], width: u32, height: u32) -> Result<Self> {
        Self::from_interleaved_u8(data, width, height, 4)
    }

    fn from_interleaved_u8(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Self> {
        let h = height as usize;
        let w = width as usize;
        if data.len() != h * w * stride {
            bail!(
                "Data length mismatch: expected {} ({}x{}x{}), got {}",
                h * w * stride,
                h,
                w,
                stride,
                data.len()
            );
        }

        let hw = h * w;
        let mut planar = vec![0.0f32; 3 * hw];
        for (pixel_idx, px) in data.chunks_exact(stride).enumerate() {
            planar[pixel_idx] = px[0] as f32 / 255.0;
            planar[hw + pixel_idx] = px[1] as f32 / 255.0;
            planar[2 * hw + pixel_idx] = px[2] as f32 / 255.0;
        }
        Self::from_vec(3, h, w, planar)
    }

    /// Planar 3-channel tensor → interleaved RGB8 with `*255`, rounding and clamping.
    pub fn to_rgb8(&self) -> Result<Vec<u8>> {
        view_to_rgb8(self.view())
    }
}

/// Converts any 3-channel CHW view (contiguous or not) to interleaved RGB8.
pub fn view_to_rgb8(view: ArrayView3<'_, f32>) -> Result<Vec<u8>> {
    let (c, h, w) = view.dim();
    if c != 3 {
        bail!("expected 3 channels for RGB conversion, got {c}");
    }

    let mut rgb = vec![0u8; h * w * 3];
    for y in 0..h {
        for x in 0..w {
            let dst = (y * w + x) * 3;
            rgb[dst] = (view[[0, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8;
            rgb[dst + 1] = (view[[1, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8;
            rgb[dst + 2] = (view[[2, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(c: usize, h: usize, w: usize) -> TensorBuffer {
        let data = (0..c * h * w).map(|v| v as f32).collect();
        TensorBuffer::from_vec(c, h, w, data).unwrap()
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let err = TensorBuffer::from_vec(3, 2, 2, vec![0.0; 11]).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn test_crop_is_a_view_of_the_right_region() {
        let t = ramp(1, 4, 5);
        let view = t.crop(1, 2, 2, 3).unwrap();
        assert_eq!(view.dim(), (1, 2, 3));
        assert_eq!(view[[0, 0, 0]], 7.0);
        assert_eq!(view[[0, 1, 2]], 14.0);
    }

    #[test]
    fn test_crop_out_of_bounds_fails() {
        let t = ramp(3, 4, 4);
        assert!(t.crop(2, 0, 3, 4).is_err());
        assert!(t.crop(0, 1, 4, 4).is_err());
    }

    #[test]
    fn test_paste_places_region() {
        let mut dst = TensorBuffer::zeros(1, 4, 4);
        let src = ramp(1, 2, 2);
        dst.paste(src.view(), 1, 2).unwrap();
        assert_eq!(dst.view()[[0, 1, 2]], 0.0);
        assert_eq!(dst.view()[[0, 1, 3]], 1.0);
        assert_eq!(dst.view()[[0, 2, 2]], 2.0);
        assert_eq!(dst.view()[[0, 2, 3]], 3.0);
        assert_eq!(dst.view()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_paste_rejects_channel_mismatch() {
        let mut dst = TensorBuffer::zeros(3, 4, 4);
        let src = ramp(1, 2, 2);
        assert!(dst.paste(src.view(), 0, 0).is_err());
    }

    #[test]
    fn test_rgb8_is_planar() {
        let data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 51, 102, 153];
        let t = TensorBuffer::from_rgb8(&data, 2, 2).unwrap();
        assert_eq!(t.shape(), (3, 2, 2));
        assert_eq!(t.view()[[0, 0, 0]], 1.0);
        assert_eq!(t.view()[[1, 0, 0]], 0.0);
        assert_eq!(t.view()[[1, 0, 1]], 1.0);
        assert_eq!(t.view()[[2, 1, 0]], 1.0);
        assert!((t.view()[[0, 1, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_rgba8_drops_alpha() {
        let data = vec![10, 20, 30, 0, 40, 50, 60, 255];
        let t = TensorBuffer::from_rgba8(&data, 2, 1).unwrap();
        assert_eq!(t.shape(), (3, 1, 2));
        assert_eq!(t.to_rgb8().unwrap(), vec![10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_to_rgb8_clamps() {
        let t = TensorBuffer::from_vec(3, 1, 1, vec![1.5, -0.2, 0.5]).unwrap();
        assert_eq!(t.to_rgb8().unwrap(), vec![255, 0, 128]);
    }

    #[test]
    fn test_rgb8_roundtrip_is_lossless() {
        let data: Vec<u8> = (0..4 * 4 * 3).map(|i| (i * 5) as u8).collect();
        let t = TensorBuffer::from_rgb8(&data, 4, 4).unwrap();
        assert_eq!(t.to_rgb8().unwrap(), data);
    }
}
