//! Tiled super-resolution engine.
//!
//! An image is split into overlapping tiles, each tile goes through an
//! inference capability, and the outputs are stitched back with weighted seam
//! blending (or a plain overlap crop, depending on the architecture). Stages
//! chain so that a denoise pass can feed an upscale pass.

pub mod accumulator;
pub mod arch;
pub mod backend;
pub mod blend;
pub mod config;
pub mod error;
pub mod event;
pub mod inference;
pub mod logging;
pub mod padding;
pub mod pipeline;
pub mod planner;
pub mod scheduler;
pub mod tensor;

pub use arch::{Architecture, NoiseLevel, Style, UpscaleConfig};
pub use error::UpscaleError;
pub use event::PipelineEvent;
pub use pipeline::{PipelineOrchestrator, PipelineOutput, PipelineRun};
pub use tensor::TensorBuffer;
