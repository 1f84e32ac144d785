//! Weighted running accumulation of overlapping tile outputs.
//!
//! Each update folds one tile into a running weighted mean: after every tile
//! touching a pixel has been incorporated, the pixel holds
//! `sum(filter_k * value_k) / sum(filter_k)` regardless of the order the tiles
//! arrived in.

use anyhow::{bail, Result};
use ndarray::{s, Array3, ArrayView3, Zip};
use tracing::debug;

use crate::error::UpscaleError;
use crate::planner::TilingPlan;
use crate::tensor::TensorBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Building,
    Finalized,
}

/// Pixel and weight buffers for one stage.
pub struct SeamBlendAccumulator {
    plan: TilingPlan,
    filter: TensorBuffer,
    pixels: Array3<f32>,
    weights: Array3<f32>,
    visited: Vec<bool>,
    remaining: usize,
    state: AccumulatorState,
}

impl SeamBlendAccumulator {
    /// Allocates zeroed buffers sized to the plan. The filter must cover exactly
    /// one tile output.
    pub fn new(plan: TilingPlan, filter: TensorBuffer) -> Result<Self> {
        let (channels, fh, fw) = filter.shape();
        let size = plan.tile_output_size;
        if fh != size || fw != size {
            return Err(UpscaleError::geometry(format!(
                "blend filter is {fh}x{fw}, tile output is {size}x{size}"
            ))
            .into());
        }
        let tiles = plan.tile_count();
        if tiles == 0 {
            return Err(UpscaleError::geometry("tiling plan has no tiles").into());
        }

        let shape = (channels, plan.buffer_height, plan.buffer_width);
        debug!(
            channels,
            buffer_height = plan.buffer_height,
            buffer_width = plan.buffer_width,
            tiles,
            "Allocated accumulation buffers"
        );

        Ok(Self {
            pixels: Array3::zeros(shape),
            weights: Array3::zeros(shape),
            visited: vec![false; tiles],
            remaining: tiles,
            state: AccumulatorState::Building,
            plan,
            filter,
        })
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    /// Tiles still expected before the buffer finalizes.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn weights(&self) -> ArrayView3<'_, f32> {
        self.weights.view()
    }

    pub fn pixels(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }

    /// Folds the output of tile `(row, col)` into the buffer and returns the
    /// blended pixels under that tile's footprint.
    pub fn update(&mut self, tile: ArrayView3<'_, f32>, row: usize, col: usize) -> Result<ArrayView3<'_, f32>> {
        if self.state == AccumulatorState::Finalized {
            bail!("accumulator is finalized; tile ({row}, {col}) arrived after the last tile");
        }
        if row >= self.plan.h_blocks || col >= self.plan.w_blocks {
            bail!(
                "tile ({row}, {col}) is outside the {}x{} grid",
                self.plan.h_blocks,
                self.plan.w_blocks
            );
        }
        if tile.dim() != self.filter.shape() {
            bail!(
                "tile ({row}, {col}) has shape {:?}, expected {:?}",
                tile.dim(),
                self.filter.shape()
            );
        }
        let index = row * self.plan.w_blocks + col;
        if self.visited[index] {
            bail!("tile ({row}, {col}) was already incorporated");
        }

        let size = self.plan.tile_output_size;
        let (y, x) = self.plan.output_placement(row, col);
        if y + size > self.plan.buffer_height || x + size > self.plan.buffer_width {
            return Err(UpscaleError::geometry(format!(
                "tile ({row}, {col}) at ({y}, {x}) overruns the {}x{} buffer",
                self.plan.buffer_height, self.plan.buffer_width
            ))
            .into());
        }

        let region = s![.., y..y + size, x..x + size];
        Zip::from(self.pixels.slice_mut(region))
            .and(self.weights.slice_mut(region))
            .and(tile)
            .and(self.filter.view())
            .for_each(|pixel, weight, &value, &filter| {
                let next = *weight + filter;
                if next > 0.0 {
                    *pixel += (value - *pixel) * (filter / next);
                } else {
                    *pixel = value;
                }
                *weight = next;
            });

        self.visited[index] = true;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.state = AccumulatorState::Finalized;
            debug!(tiles = self.plan.tile_count(), "Accumulator finalized");
        }

        Ok(self.pixels.slice(region))
    }

    /// Crops the finalized buffer to the stage output, `(C, h*scale, w*scale)`.
    pub fn into_output(self) -> Result<TensorBuffer> {
        if self.state != AccumulatorState::Finalized {
            bail!(
                "accumulator still building: {} of {} tiles missing",
                self.remaining,
                self.plan.tile_count()
            );
        }
        let origin = self.plan.output_origin;
        let (h, w) = (self.plan.output_height, self.plan.output_width);
        if origin + h > self.plan.buffer_height || origin + w > self.plan.buffer_width {
            return Err(UpscaleError::geometry(format!(
                "output {h}x{w} at origin {origin} exceeds the {}x{} buffer",
                self.plan.buffer_height, self.plan.buffer_width
            ))
            .into());
        }
        let output = self
            .pixels
            .slice(s![.., origin..origin + h, origin..origin + w])
            .to_owned();
        Ok(TensorBuffer::from_array(output))
    }
}
