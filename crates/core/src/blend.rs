//! Blend weight masks for seam blending.

use anyhow::Result;
use ndarray::Array3;
use tracing::debug;

use crate::error::UpscaleError;
use crate::planner::BLEND_SIZE;
use crate::tensor::TensorBuffer;

/// Produces the per-pixel weight mask applied to every tile output of a stage.
///
/// The mask must be strictly positive so that every buffer pixel a tile touches
/// gains weight, and deterministic for a given `(scale, offset, tile_size)`.
pub trait BlendFilterProvider: Send + Sync {
    fn generate(&self, scale: usize, offset: usize, tile_size: usize) -> Result<TensorBuffer>;
}

/// Linear ramp that falls off over the outer `blend_size` pixels of a tile.
///
/// Pixels deeper than `blend_size` from every edge get weight 1. The outermost
/// pixel gets `1 / (blend_size + 1)`.
#[derive(Debug, Clone, Copy)]
pub struct RampBlendFilter {
    pub blend_size: usize,
    pub channels: usize,
}

impl Default for RampBlendFilter {
    fn default() -> Self {
        Self {
            blend_size: BLEND_SIZE,
            channels: 3,
        }
    }
}

impl RampBlendFilter {
    pub fn new(blend_size: usize) -> Self {
        Self {
            blend_size,
            ..Self::default()
        }
    }

    fn edge_weight(&self, distance: usize) -> f32 {
        if distance >= self.blend_size {
            1.0
        } else {
            let gap = (self.blend_size - distance) as f32;
            1.0 - gap / (self.blend_size + 1) as f32
        }
    }
}

impl BlendFilterProvider for RampBlendFilter {
    fn generate(&self, scale: usize, offset: usize, tile_size: usize) -> Result<TensorBuffer> {
        let size = (tile_size * scale)
            .checked_sub(2 * offset)
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                UpscaleError::geometry(format!(
                    "blend filter for tile {tile_size} at scale {scale} has no pixels after offset {offset}"
                ))
            })?;

        let ramp: Vec<f32> = (0..size)
            .map(|p| self.edge_weight(p.min(size - 1 - p)))
            .collect();
        let filter = Array3::from_shape_fn((self.channels, size, size), |(_, y, x)| {
            ramp[y].min(ramp[x])
        });

        debug!(
            scale,
            offset,
            tile_size,
            size,
            blend_size = self.blend_size,
            "Generated blend filter"
        );
        Ok(TensorBuffer::from_array(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_matches_tile_output() {
        let filter = RampBlendFilter::default().generate(2, 16, 64).unwrap();
        assert_eq!(filter.shape(), (3, 96, 96));
    }

    #[test]
    fn test_weights_positive_and_bounded() {
        let filter = RampBlendFilter::default().generate(4, 32, 40).unwrap();
        assert!(filter.as_slice().unwrap().iter().all(|w| *w > 0.0 && *w <= 1.0));
    }

    #[test]
    fn test_ramp_profile() {
        let filter = RampBlendFilter::new(4).generate(1, 0, 12).unwrap();
        let v = filter.view();
        assert!((v[[0, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((v[[0, 6, 1]] - 0.4).abs() < 1e-6);
        assert_eq!(v[[0, 6, 6]], 1.0);
        assert_eq!(v[[2, 5, 11]], v[[2, 5, 0]]);
        // symmetric about both axes
        for y in 0..12 {
            for x in 0..12 {
                assert_eq!(v[[1, y, x]], v[[1, 11 - y, x]]);
                assert_eq!(v[[1, y, x]], v[[1, y, 11 - x]]);
            }
        }
    }

    #[test]
    fn test_zero_blend_is_flat() {
        let filter = RampBlendFilter::new(0).generate(1, 0, 8).unwrap();
        assert!(filter.as_slice().unwrap().iter().all(|w| *w == 1.0));
    }

    #[test]
    fn test_offset_consuming_whole_tile_fails() {
        assert!(RampBlendFilter::default().generate(1, 8, 16).is_err());
    }
}
