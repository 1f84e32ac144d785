//! Tile loops.
//!
//! Both schedulers walk the grid in row-major order, one tile at a time, and
//! report every finished tile on the event sink before starting the next one.
//! A failing tile aborts the stage.

use std::time::Instant;

use anyhow::Result;
use ndarray::{s, ArrayView3};
use tracing::{debug, trace};

use crate::accumulator::SeamBlendAccumulator;
use crate::error::UpscaleError;
use crate::event::{estimate_eta, EventSink, PipelineEvent};
use crate::inference::Inference;
use crate::planner::TilingPlan;
use crate::tensor::{view_to_rgb8, TensorBuffer};

/// Identity of the running stage, stamped on every event it produces.
#[derive(Debug, Clone, Copy)]
pub struct StageLabel<'a> {
    pub name: &'a str,
    pub index: usize,
    pub count: usize,
}

/// Grid coordinates in row-major order.
pub fn row_major(plan: &TilingPlan) -> impl Iterator<Item = (usize, usize)> {
    let w_blocks = plan.w_blocks;
    (0..plan.h_blocks).flat_map(move |row| (0..w_blocks).map(move |col| (row, col)))
}

/// Part of a tile footprint that lands inside the stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputClip {
    /// Offset of the visible part within the footprint.
    local_y: usize,
    local_x: usize,
    height: usize,
    width: usize,
    /// Placement in stage output coordinates.
    out_y: usize,
    out_x: usize,
}

fn clip_to_output(plan: &TilingPlan, y: usize, x: usize, size: usize) -> Option<OutputClip> {
    let origin = plan.output_origin;
    let y_start = y.max(origin);
    let x_start = x.max(origin);
    let y_end = (y + size).min(origin + plan.output_height);
    let x_end = (x + size).min(origin + plan.output_width);
    if y_start >= y_end || x_start >= x_end {
        return None;
    }
    Some(OutputClip {
        local_y: y_start - y,
        local_x: x_start - x,
        height: y_end - y_start,
        width: x_end - x_start,
        out_y: y_start - origin,
        out_x: x_start - origin,
    })
}

struct TileReporter<'a> {
    stage: StageLabel<'a>,
    events: &'a EventSink,
    total: usize,
    started: Instant,
}

impl<'a> TileReporter<'a> {
    fn new(stage: StageLabel<'a>, events: &'a EventSink, total: usize) -> Self {
        Self {
            stage,
            events,
            total,
            started: Instant::now(),
        }
    }

    fn inference_error(&self, row: usize, col: usize, message: String) -> anyhow::Error {
        UpscaleError::Inference {
            stage: self.stage.name.to_string(),
            row,
            col,
            message,
        }
        .into()
    }

    /// Emits the preview of a finished tile followed by the progress update.
    fn tile_done(
        &self,
        done: usize,
        row: usize,
        col: usize,
        footprint: ArrayView3<'_, f32>,
        clip: Option<OutputClip>,
    ) -> Result<()> {
        if let Some(clip) = clip {
            let visible = footprint.slice(s![
                ..,
                clip.local_y..clip.local_y + clip.height,
                clip.local_x..clip.local_x + clip.width
            ]);
            self.events.emit(PipelineEvent::TileResult {
                stage_index: self.stage.index,
                pixels: view_to_rgb8(visible)?,
                width: clip.width,
                height: clip.height,
                x_offset: clip.out_x,
                y_offset: clip.out_y,
            });
        }

        let ratio = done as f64 / self.total as f64;
        let eta_seconds = estimate_eta(self.started.elapsed(), ratio);
        trace!(stage = self.stage.name, row, col, ratio, "Tile done");
        self.events.emit(PipelineEvent::Progress {
            stage: self.stage.name.to_string(),
            stage_index: self.stage.index,
            stage_count: self.stage.count,
            ratio,
            row,
            col,
            eta_seconds,
        });
        Ok(())
    }
}

fn crop_tile<'t>(padded: &'t TensorBuffer, plan: &TilingPlan, row: usize, col: usize) -> Result<ArrayView3<'t, f32>> {
    let (y, x) = plan.input_origin(row, col);
    let size = plan.effective_tile_size;
    padded
        .crop(y, x, size, size)
        .map_err(|e| UpscaleError::geometry(format!("tile ({row}, {col}): {e:#}")).into())
}

/// Seam-blending tile loop.
pub struct TileScheduler<'a> {
    stage: StageLabel<'a>,
    events: &'a EventSink,
}

impl<'a> TileScheduler<'a> {
    pub fn new(stage: StageLabel<'a>, events: &'a EventSink) -> Self {
        Self { stage, events }
    }

    /// Runs every tile of `padded` through `model` into `accumulator` and returns
    /// the finalized stage output.
    pub fn run(
        &self,
        padded: &TensorBuffer,
        mut accumulator: SeamBlendAccumulator,
        model: &mut dyn Inference,
    ) -> Result<TensorBuffer> {
        let plan = accumulator.plan().clone();
        let size = plan.tile_output_size;
        let expected = (padded.channels(), size, size);
        let reporter = TileReporter::new(self.stage, self.events, plan.tile_count());

        debug!(
            stage = self.stage.name,
            tiles = plan.tile_count(),
            tile_size = plan.effective_tile_size,
            "Starting seam-blended tile loop"
        );

        for (done, (row, col)) in row_major(&plan).enumerate() {
            let input = crop_tile(padded, &plan, row, col)?;
            let output = model
                .run(input)
                .map_err(|e| reporter.inference_error(row, col, format!("{e:#}")))?;
            if output.shape() != expected {
                return Err(reporter.inference_error(
                    row,
                    col,
                    format!("model returned shape {:?}, expected {:?}", output.shape(), expected),
                ));
            }

            let (y, x) = plan.output_placement(row, col);
            let footprint = accumulator.update(output.view(), row, col)?;
            reporter.tile_done(done + 1, row, col, footprint, clip_to_output(&plan, y, x, size))?;
        }

        accumulator.into_output()
    }
}

/// Direct-paste tile loop: the overlap margin is cut from every tile output and
/// the remaining centre is written without blending.
pub struct OverlapCropScheduler<'a> {
    stage: StageLabel<'a>,
    events: &'a EventSink,
}

impl<'a> OverlapCropScheduler<'a> {
    pub fn new(stage: StageLabel<'a>, events: &'a EventSink) -> Self {
        Self { stage, events }
    }

    pub fn run(&self, padded: &TensorBuffer, plan: &TilingPlan, model: &mut dyn Inference) -> Result<TensorBuffer> {
        let channels = padded.channels();
        let full = plan.effective_tile_size * plan.scale;
        let expected = (channels, full, full);
        let margin = plan.input_offset * plan.scale;
        let keep = plan.tile_output_size;
        let mut buffer = TensorBuffer::zeros(channels, plan.buffer_height, plan.buffer_width);
        let reporter = TileReporter::new(self.stage, self.events, plan.tile_count());

        debug!(
            stage = self.stage.name,
            tiles = plan.tile_count(),
            tile_size = plan.effective_tile_size,
            margin,
            "Starting overlap-crop tile loop"
        );

        for (done, (row, col)) in row_major(plan).enumerate() {
            let input = crop_tile(padded, plan, row, col)?;
            let output = model
                .run(input)
                .map_err(|e| reporter.inference_error(row, col, format!("{e:#}")))?;
            if output.shape() != expected {
                return Err(reporter.inference_error(
                    row,
                    col,
                    format!("model returned shape {:?}, expected {:?}", output.shape(), expected),
                ));
            }

            let centre = output.crop(margin, margin, keep, keep)?;
            let (y, x) = plan.output_placement(row, col);
            buffer.paste(centre, y, x)?;
            reporter.tile_done(done + 1, row, col, centre, clip_to_output(plan, y, x, keep))?;
        }

        buffer.crop_owned(0, 0, plan.output_height, plan.output_width)
    }
}
