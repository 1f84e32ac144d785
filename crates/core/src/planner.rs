//! Tiling geometry.
//!
//! Pure functions that turn an image size plus a stage's geometric constants into
//! a [`TilingPlan`]: how many tiles, where they start, how far the input must be
//! padded, and how large the output accumulation buffer is.

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::error::UpscaleError;

/// Overlap margin between neighbouring tile outputs, in output pixels.
pub const BLEND_SIZE: usize = 16;

/// Bytes per tensor element (f32).
const ELEMENT_BYTES: u64 = 4;

/// Border extension, in input pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Padding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

/// Immutable per-stage tiling geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilingPlan {
    pub h_blocks: usize,
    pub w_blocks: usize,
    pub input_tile_step: usize,
    pub output_tile_step: usize,
    pub pad: Padding,
    pub buffer_height: usize,
    pub buffer_width: usize,
    /// Tile edge actually fed to the model (differs from the requested size in the
    /// single-tile fallback).
    pub effective_tile_size: usize,
    /// Edge of the square region each tile contributes to the buffer.
    pub tile_output_size: usize,
    pub scale: usize,
    pub input_offset: usize,
    /// Buffer coordinate of output pixel `(0, 0)`.
    pub output_origin: usize,
    pub output_height: usize,
    pub output_width: usize,
    pub single_tile: bool,
}

impl TilingPlan {
    pub fn tile_count(&self) -> usize {
        self.h_blocks * self.w_blocks
    }

    pub fn padded_height(&self, height: usize) -> usize {
        height + self.pad.top + self.pad.bottom
    }

    pub fn padded_width(&self, width: usize) -> usize {
        width + self.pad.left + self.pad.right
    }

    /// Top-left corner of tile `(row, col)` in the padded input.
    pub fn input_origin(&self, row: usize, col: usize) -> (usize, usize) {
        (row * self.input_tile_step, col * self.input_tile_step)
    }

    /// Top-left corner of tile `(row, col)` in the accumulation buffer.
    pub fn output_placement(&self, row: usize, col: usize) -> (usize, usize) {
        (row * self.output_tile_step, col * self.output_tile_step)
    }
}

fn check_dims(height: usize, width: usize, scale: usize, tile_size: usize) -> Result<()> {
    if height == 0 || width == 0 {
        return Err(UpscaleError::geometry(format!("image has zero extent ({height}x{width})")).into());
    }
    if scale == 0 {
        return Err(UpscaleError::geometry("scale must be at least 1").into());
    }
    if tile_size == 0 {
        return Err(UpscaleError::geometry("tile size must be at least 1").into());
    }
    Ok(())
}

/// Grows the block count until tiles of `tile_size` at `step` stride cover
/// `target`. Returns `(blocks, covered_extent)`.
fn grow_blocks(target: usize, step: usize, tile_size: usize) -> (usize, usize) {
    let mut blocks = 0;
    let mut extent = 0;
    while extent < target {
        extent = blocks * step + tile_size;
        blocks += 1;
    }
    (blocks, extent)
}

/// Plans a seam-blended stage.
///
/// `offset` is the number of border output pixels the model consumes as context
/// and drops from its output; `blend_size` is the overlap between neighbouring
/// tile outputs. A tile too small to hold its own context collapses to a single
/// tile spanning the whole image.
pub fn plan_tiles(
    height: usize,
    width: usize,
    scale: usize,
    offset: usize,
    tile_size: usize,
    blend_size: usize,
) -> Result<TilingPlan> {
    check_dims(height, width, scale, tile_size)?;

    let input_offset = offset.div_ceil(scale);
    let input_blend = blend_size.div_ceil(scale);
    let context = 2 * input_offset + input_blend;

    let single_tile = tile_size <= context;
    let (tile_size, input_tile_step, h_blocks, w_blocks, padded_h, padded_w) = if single_tile {
        let longest = height.max(width);
        let tile = longest + 2 * input_offset;
        (tile, longest, 1, 1, tile, tile)
    } else {
        let step = tile_size - context;
        let (h_blocks, padded_h) = grow_blocks(height + 2 * input_offset, step, tile_size);
        let (w_blocks, padded_w) = grow_blocks(width + 2 * input_offset, step, tile_size);
        (tile_size, step, h_blocks, w_blocks, padded_h, padded_w)
    };

    if h_blocks == 0 || w_blocks == 0 {
        return Err(UpscaleError::geometry(format!(
            "grid has zero blocks ({h_blocks}x{w_blocks}) for {height}x{width}"
        ))
        .into());
    }

    let tile_output_size = (tile_size * scale)
        .checked_sub(2 * offset)
        .filter(|size| *size > 0)
        .ok_or_else(|| {
            UpscaleError::geometry(format!(
                "tile {tile_size} at scale {scale} leaves no output after offset {offset}"
            ))
        })?;

    let plan = TilingPlan {
        h_blocks,
        w_blocks,
        input_tile_step,
        output_tile_step: input_tile_step * scale,
        pad: Padding {
            left: input_offset,
            right: padded_w - (width + input_offset),
            top: input_offset,
            bottom: padded_h - (height + input_offset),
        },
        buffer_height: padded_h * scale,
        buffer_width: padded_w * scale,
        effective_tile_size: tile_size,
        tile_output_size,
        scale,
        input_offset,
        output_origin: input_offset * scale - offset,
        output_height: height * scale,
        output_width: width * scale,
        single_tile,
    };

    debug!(
        height,
        width,
        scale,
        offset,
        tile_size = plan.effective_tile_size,
        h_blocks = plan.h_blocks,
        w_blocks = plan.w_blocks,
        step = plan.input_tile_step,
        single_tile,
        "Planned seam-blended tiling"
    );

    Ok(plan)
}

/// Plans an overlap-crop stage: tiles overlap by `overlap` input pixels on each
/// side, and that margin is cut from every tile output before pasting.
///
/// Leading edges are padded by `overlap` and trailing edges by whatever makes the
/// grid exact, so every tile has the same `tile_size` shape.
pub fn plan_overlap_tiles(
    height: usize,
    width: usize,
    scale: usize,
    tile_size: usize,
    overlap: usize,
) -> Result<TilingPlan> {
    check_dims(height, width, scale, tile_size)?;

    let single_tile = tile_size <= 2 * overlap;
    let (step, h_blocks, w_blocks) = if single_tile {
        (height.max(width), 1, 1)
    } else {
        let step = tile_size - 2 * overlap;
        (step, height.div_ceil(step), width.div_ceil(step))
    };
    let tile_size = step + 2 * overlap;

    let plan = TilingPlan {
        h_blocks,
        w_blocks,
        input_tile_step: step,
        output_tile_step: step * scale,
        pad: Padding {
            left: overlap,
            right: w_blocks * step + overlap - width,
            top: overlap,
            bottom: h_blocks * step + overlap - height,
        },
        buffer_height: h_blocks * step * scale,
        buffer_width: w_blocks * step * scale,
        effective_tile_size: tile_size,
        tile_output_size: step * scale,
        scale,
        input_offset: overlap,
        output_origin: 0,
        output_height: height * scale,
        output_width: width * scale,
        single_tile,
    };

    debug!(
        height,
        width,
        scale,
        overlap,
        tile_size,
        h_blocks,
        w_blocks,
        step,
        single_tile,
        "Planned overlap-crop tiling"
    );

    Ok(plan)
}

/// Largest square tile whose in-flight input and output fit in `budget_bytes`.
pub fn tile_ceiling_for_budget(budget_bytes: u64, channels: usize, scale: usize) -> usize {
    let per_pixel = ELEMENT_BYTES * channels as u64 * (1 + (scale * scale) as u64);
    if per_pixel == 0 {
        return 0;
    }
    let pixels = budget_bytes / per_pixel;
    let mut side = (pixels as f64).sqrt() as u64;
    while side * side > pixels {
        side -= 1;
    }
    while (side + 1) * (side + 1) <= pixels {
        side += 1;
    }
    side as usize
}

/// Smallest tile that still yields a multi-tile grid for the given constants.
pub fn minimum_viable_tile(scale: usize, offset: usize, blend_size: usize) -> usize {
    let scale = scale.max(1);
    2 * offset.div_ceil(scale) + blend_size.div_ceil(scale) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every row/column of the padded image is covered by some tile and no tile
    /// leaves the padded bounds.
    fn assert_covers(plan: &TilingPlan, height: usize, width: usize) {
        let padded_h = plan.padded_height(height);
        let padded_w = plan.padded_width(width);
        let tile = plan.effective_tile_size;

        let mut rows = vec![false; padded_h];
        for r in 0..plan.h_blocks {
            let (y, _) = plan.input_origin(r, 0);
            assert!(y + tile <= padded_h, "row tile {r} leaves padded bounds");
            rows[y..y + tile].iter_mut().for_each(|c| *c = true);
        }
        let mut cols = vec![false; padded_w];
        for c in 0..plan.w_blocks {
            let (_, x) = plan.input_origin(0, c);
            assert!(x + tile <= padded_w, "col tile {c} leaves padded bounds");
            cols[x..x + tile].iter_mut().for_each(|c| *c = true);
        }
        assert!(rows.iter().all(|c| *c), "gap in rows for {height}x{width}");
        assert!(cols.iter().all(|c| *c), "gap in cols for {height}x{width}");
    }

    #[test]
    fn test_worked_example_100x80() {
        let plan = plan_tiles(80, 100, 2, 16, 64, 16).unwrap();
        assert_eq!(plan.input_offset, 8);
        assert_eq!(plan.input_tile_step, 40);
        assert_eq!(plan.output_tile_step, 80);
        assert_eq!(plan.h_blocks, 2);
        assert_eq!(plan.w_blocks, 3);
        assert_eq!(plan.pad.left, 8);
        assert_eq!(plan.pad.top, 8);
        // padded width 144 = 2 * 40 + 64, padded height 104 = 40 + 64
        assert_eq!(plan.padded_width(100), 144);
        assert_eq!(plan.padded_height(80), 104);
        assert_eq!(plan.pad.right, 36);
        assert_eq!(plan.pad.bottom, 16);
        assert_eq!(plan.output_width, 200);
        assert_eq!(plan.output_height, 160);
        assert_eq!(plan.tile_output_size, 96);
        assert_eq!(plan.output_origin, 0);
        assert!(!plan.single_tile);
        assert_covers(&plan, 80, 100);
    }

    #[test]
    fn test_coverage_over_parameter_grid() {
        for &(scale, offset) in &[(1, 0), (1, 8), (2, 16), (4, 32), (2, 36), (1, 28)] {
            for &tile in &[32, 64, 100, 112, 256] {
                for &(h, w) in &[(1, 1), (17, 5), (80, 100), (257, 129), (64, 64)] {
                    let plan = plan_tiles(h, w, scale, offset, tile, BLEND_SIZE).unwrap();
                    assert_covers(&plan, h, w);
                    assert_eq!(plan.buffer_height, plan.padded_height(h) * scale);
                    assert_eq!(plan.buffer_width, plan.padded_width(w) * scale);
                    assert!(plan.padded_height(h) >= h + 2 * plan.input_offset);
                    assert!(plan.padded_width(w) >= w + 2 * plan.input_offset);
                    // last tile output must still land inside the buffer
                    let (y, x) = plan.output_placement(plan.h_blocks - 1, plan.w_blocks - 1);
                    assert!(y + plan.tile_output_size <= plan.buffer_height);
                    assert!(x + plan.tile_output_size <= plan.buffer_width);
                }
            }
        }
    }

    #[test]
    fn test_neighbouring_outputs_overlap_by_blend_size() {
        let plan = plan_tiles(300, 300, 2, 16, 112, BLEND_SIZE).unwrap();
        assert_eq!(plan.tile_output_size - plan.output_tile_step, BLEND_SIZE);
    }

    #[test]
    fn test_tile_too_small_falls_back_to_single_tile() {
        // context = 2 * ceil(16/2) + ceil(16/2) = 24
        let plan = plan_tiles(80, 100, 2, 16, 20, 16).unwrap();
        assert!(plan.single_tile);
        assert_eq!(plan.h_blocks, 1);
        assert_eq!(plan.w_blocks, 1);
        assert_eq!(plan.input_tile_step, 100);
        assert_eq!(plan.effective_tile_size, 116);
        assert_eq!(plan.padded_height(80), 116);
        assert_eq!(plan.padded_width(100), 116);
        assert_eq!(plan.tile_output_size, 116 * 2 - 32);
        assert_covers(&plan, 80, 100);
    }

    #[test]
    fn test_tile_equal_to_context_is_single_tile() {
        let plan = plan_tiles(50, 30, 2, 16, 24, 16).unwrap();
        assert!(plan.single_tile);
        assert_eq!(plan.effective_tile_size, 50 + 16);
    }

    #[test]
    fn test_zero_extent_is_geometry_error() {
        let err = plan_tiles(0, 10, 2, 16, 64, 16).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpscaleError>(),
            Some(UpscaleError::Geometry(_))
        ));
    }

    #[test]
    fn test_zero_scale_is_geometry_error() {
        let err = plan_tiles(10, 10, 0, 16, 64, 16).unwrap_err();
        assert!(err.to_string().contains("scale"));
    }

    #[test]
    fn test_single_tile_output_still_covers_image() {
        let plan = plan_tiles(1, 1, 4, 32, 4, 16).unwrap();
        assert!(plan.single_tile);
        assert_eq!(plan.effective_tile_size, 17);
        assert_eq!(plan.tile_output_size, 4);
        assert!(plan.tile_output_size >= plan.output_height);
    }

    #[test]
    fn test_identity_geometry_has_no_leading_pad() {
        let plan = plan_tiles(37, 53, 1, 0, 32, BLEND_SIZE).unwrap();
        assert_eq!(plan.pad.left, 0);
        assert_eq!(plan.pad.top, 0);
        assert_eq!(plan.input_tile_step, 16);
        assert_covers(&plan, 37, 53);
    }

    #[test]
    fn test_overlap_plan_is_exact_grid() {
        let plan = plan_overlap_tiles(50, 70, 4, 64, 16).unwrap();
        assert_eq!(plan.input_tile_step, 32);
        assert_eq!(plan.h_blocks, 2);
        assert_eq!(plan.w_blocks, 3);
        assert_eq!(plan.padded_height(50), 2 * 32 + 32);
        assert_eq!(plan.padded_width(70), 3 * 32 + 32);
        assert_eq!(plan.buffer_height, 2 * 32 * 4);
        assert_eq!(plan.buffer_width, 3 * 32 * 4);
        assert_eq!(plan.tile_output_size, 128);
        assert_covers(&plan, 50, 70);
    }

    #[test]
    fn test_overlap_plan_single_tile_fallback() {
        let plan = plan_overlap_tiles(20, 12, 2, 32, 16).unwrap();
        assert!(plan.single_tile);
        assert_eq!(plan.effective_tile_size, 20 + 32);
        assert_eq!(plan.buffer_height, 40);
        assert_eq!(plan.buffer_width, 40);
        assert_covers(&plan, 20, 12);
    }

    #[test]
    fn test_budget_ceiling() {
        // 3 channels, scale 2: 4 * 3 * 5 = 60 bytes per tile pixel
        assert_eq!(tile_ceiling_for_budget(60 * 64 * 64, 3, 2), 64);
        assert_eq!(tile_ceiling_for_budget(60 * 64 * 64 - 1, 3, 2), 63);
        assert_eq!(tile_ceiling_for_budget(0, 3, 2), 0);
    }

    #[test]
    fn test_minimum_viable_tile() {
        assert_eq!(minimum_viable_tile(2, 16, 16), 25);
        let plan = plan_tiles(100, 100, 2, 16, minimum_viable_tile(2, 16, 16), 16).unwrap();
        assert!(!plan.single_tile);
        assert_eq!(plan.input_tile_step, 1);
    }
}
