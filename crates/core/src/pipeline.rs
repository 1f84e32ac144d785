//! Stage chaining.
//!
//! [`PipelineOrchestrator`] runs its stages strictly in order. Each stage plans
//! its grid for the current image, pads it, runs the matching tile scheduler,
//! and hands its output to the next stage as input.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accumulator::SeamBlendAccumulator;
use crate::arch::{resolve_stages, ModelResolver, PipelineStage, StageGeometry, UpscaleConfig};
use crate::blend::{BlendFilterProvider, RampBlendFilter};
use crate::error::UpscaleError;
use crate::event::{event_channel, EventSink, PipelineEvent};
use crate::inference::ModelCache;
use crate::padding::{pad_tensor, BorderFill, FoldingBorderFill};
use crate::planner::{tile_ceiling_for_budget, TilingPlan};
use crate::scheduler::{OverlapCropScheduler, StageLabel, TileScheduler};
use crate::tensor::TensorBuffer;

const RGB_CHANNELS: usize = 3;

/// Final image of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub tensor: TensorBuffer,
}

impl PipelineOutput {
    pub fn width(&self) -> usize {
        self.tensor.width()
    }

    pub fn height(&self) -> usize {
        self.tensor.height()
    }

    /// Interleaved RGB8 pixels.
    pub fn to_rgb8(&self) -> Result<Vec<u8>> {
        self.tensor.to_rgb8()
    }
}

/// Geometry one stage will use for a given input size.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub stage: PipelineStage,
    pub input_height: usize,
    pub input_width: usize,
    pub tile_size: usize,
    pub plan: TilingPlan,
}

/// A pipeline running on a blocking worker.
pub struct PipelineRun {
    pub events: mpsc::Receiver<PipelineEvent>,
    pub handle: JoinHandle<Result<PipelineOutput>>,
}

impl PipelineRun {
    /// Drains the event stream into `on_event` and waits for the result.
    pub async fn collect(mut self, mut on_event: impl FnMut(PipelineEvent)) -> Result<PipelineOutput> {
        while let Some(event) = self.events.recv().await {
            on_event(event);
        }
        self.handle.await.context("pipeline worker panicked")?
    }
}

pub struct PipelineOrchestrator {
    stages: Vec<PipelineStage>,
    cache: ModelCache,
    resolver: ModelResolver,
    border_fill: Arc<dyn BorderFill>,
    /// Overrides the stage's own ramp filter when set.
    blend_filter: Option<Arc<dyn BlendFilterProvider>>,
    tile_size: usize,
    memory_budget: Option<u64>,
}

impl PipelineOrchestrator {
    /// Resolves the stage list for `config`. Configuration errors surface here,
    /// before any model is loaded or any tile is run.
    pub fn new(config: &UpscaleConfig, cache: ModelCache, resolver: ModelResolver) -> Result<Self> {
        if config.tile_size == 0 {
            return Err(UpscaleError::config("tile size must be at least 1").into());
        }
        let stages = resolve_stages(config)?;
        Ok(Self::from_stages(stages, cache, resolver, config.tile_size).with_memory_budget(config.memory_budget))
    }

    pub fn from_stages(
        stages: Vec<PipelineStage>,
        cache: ModelCache,
        resolver: ModelResolver,
        tile_size: usize,
    ) -> Self {
        Self {
            stages,
            cache,
            resolver,
            border_fill: Arc::new(FoldingBorderFill),
            blend_filter: None,
            tile_size,
            memory_budget: None,
        }
    }

    pub fn with_border_fill(mut self, border_fill: Arc<dyn BorderFill>) -> Self {
        self.border_fill = border_fill;
        self
    }

    pub fn with_blend_filter(mut self, blend_filter: Arc<dyn BlendFilterProvider>) -> Self {
        self.blend_filter = Some(blend_filter);
        self
    }

    pub fn with_memory_budget(mut self, memory_budget: Option<u64>) -> Self {
        self.memory_budget = memory_budget;
        self
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Requested tile size adjusted to what the stage's model accepts. With a
    /// memory budget, the adjusted tile is the largest the rule can produce
    /// that fits the budget without dropping below the stage's minimum viable
    /// tile. When even that tile does not fit, the minimum viable tile is used.
    pub fn stage_tile_size(&self, stage: &PipelineStage) -> usize {
        let rule = stage.geometry.tile_rule();
        let tile = rule.apply(self.tile_size);
        let Some(budget) = self.memory_budget else {
            return tile;
        };
        let ceiling = tile_ceiling_for_budget(budget, RGB_CHANNELS, stage.geometry.scale());
        if tile <= ceiling {
            return tile;
        }

        let viable = stage.geometry.minimum_tile();
        // Both rules are monotone in the request, so the first fit is the largest.
        let fitted = (1..self.tile_size)
            .rev()
            .map(|requested| rule.apply(requested))
            .find(|t| *t <= ceiling && *t >= viable);
        match fitted {
            Some(fitted) => {
                warn!(
                    stage = %stage.name,
                    requested = self.tile_size,
                    tile,
                    capped = fitted,
                    budget_bytes = budget,
                    "Tile size reduced to fit memory budget"
                );
                fitted
            }
            None => {
                let floor = rule.apply(viable).min(tile);
                warn!(
                    stage = %stage.name,
                    requested = self.tile_size,
                    tile = floor,
                    ceiling,
                    budget_bytes = budget,
                    "Memory budget is below the smallest usable tile; using it anyway"
                );
                floor
            }
        }
    }

    pub fn plan_stage(&self, stage: &PipelineStage, height: usize, width: usize) -> Result<TilingPlan> {
        stage
            .geometry
            .plan(height, width, self.stage_tile_size(stage))
    }

    /// Plans every stage for an input of `height x width`, chaining sizes.
    pub fn plan_all(&self, height: usize, width: usize) -> Result<Vec<StagePlan>> {
        let (mut h, mut w) = (height, width);
        let mut plans = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let plan = self.plan_stage(stage, h, w)?;
            plans.push(StagePlan {
                stage: stage.clone(),
                input_height: h,
                input_width: w,
                tile_size: plan.effective_tile_size,
                plan: plan.clone(),
            });
            h = plan.output_height;
            w = plan.output_width;
        }
        Ok(plans)
    }

    /// Runs all stages on the calling thread. On failure a `FatalError` event is
    /// emitted and partial output is discarded.
    pub fn run_blocking(&self, input: TensorBuffer, events: &EventSink) -> Result<PipelineOutput> {
        match self.run_stages(input, events) {
            Ok(output) => Ok(output),
            Err(e) => {
                error!("{e:#}");
                events.emit(PipelineEvent::FatalError {
                    message: format!("{e:#}"),
                });
                Err(e)
            }
        }
    }

    /// Moves the pipeline onto a blocking worker and returns its event stream.
    pub fn spawn(self, input: TensorBuffer) -> PipelineRun {
        let (sink, events) = event_channel();
        let handle = tokio::task::spawn_blocking(move || self.run_blocking(input, &sink));
        PipelineRun { events, handle }
    }

    fn run_stages(&self, input: TensorBuffer, events: &EventSink) -> Result<PipelineOutput> {
        let (channels, height, width) = input.shape();
        if channels != RGB_CHANNELS {
            bail!("expected a {RGB_CHANNELS}-channel image, got {channels} channels");
        }
        if height == 0 || width == 0 {
            return Err(UpscaleError::geometry(format!("image has zero extent ({height}x{width})")).into());
        }

        if self.stages.is_empty() {
            info!(height, width, "No stages to run; returning input unchanged");
            events.status("Nothing to do; returning the original image.");
            return Ok(PipelineOutput { tensor: input });
        }

        let count = self.stages.len();
        let mut current = input;
        for (index, stage) in self.stages.iter().enumerate() {
            let label = StageLabel {
                name: &stage.name,
                index,
                count,
            };
            events.status(format!("Stage {}/{}: {}", index + 1, count, stage.model));
            current = self.run_stage(stage, label, current, events)?;
            events.emit(PipelineEvent::StageDone {
                stage: stage.name.clone(),
                stage_index: index,
                width: current.width(),
                height: current.height(),
            });
        }

        Ok(PipelineOutput { tensor: current })
    }

    fn run_stage(
        &self,
        stage: &PipelineStage,
        label: StageLabel<'_>,
        input: TensorBuffer,
        events: &EventSink,
    ) -> Result<TensorBuffer> {
        let handle = self.resolver.resolve(&stage.model);
        let model = self.cache.get_or_load(&handle)?;
        let mut model = model
            .lock()
            .map_err(|_| anyhow!("model {} lock poisoned", stage.model))?;

        let plan = self.plan_stage(stage, input.height(), input.width())?;
        info!(
            stage = %stage.name,
            model = %stage.model,
            input_height = input.height(),
            input_width = input.width(),
            tiles = plan.tile_count(),
            tile_size = plan.effective_tile_size,
            single_tile = plan.single_tile,
            "Running stage"
        );

        let padded = pad_tensor(self.border_fill.as_ref(), &input, plan.pad, stage.geometry.padding())?;
        drop(input);

        let output = match stage.geometry {
            StageGeometry::Blended {
                scale,
                offset,
                blend_size,
                ..
            } => {
                let filter = match &self.blend_filter {
                    Some(provider) => provider.generate(scale, offset, plan.effective_tile_size)?,
                    None => RampBlendFilter::new(blend_size).generate(scale, offset, plan.effective_tile_size)?,
                };
                let accumulator = SeamBlendAccumulator::new(plan, filter)?;
                TileScheduler::new(label, events).run(&padded, accumulator, &mut **model)?
            }
            StageGeometry::OverlapCrop { .. } => {
                OverlapCropScheduler::new(label, events).run(&padded, &plan, &mut **model)?
            }
        };

        info!(
            stage = %stage.name,
            output_height = output.height(),
            output_width = output.width(),
            "Stage finished"
        );
        Ok(output)
    }
}
