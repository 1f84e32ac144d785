//! Execution provider selection for ONNX Runtime sessions.
//!
//! [`build_session`] turns an [`InferenceBackend`] into an `ort::Session`. GPU
//! providers fall back to the next provider in the chain, and ultimately to the
//! CPU provider, when their runtime libraries are missing.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const DEFAULT_TRT_CACHE_DIR: &str = "trt_cache";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    /// TensorRT with CUDA as fallback. Engines are cached on disk, so the first
    /// run for a given tile shape is slow.
    Tensorrt,
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

impl FromStr for InferenceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            other => bail!("unknown inference backend '{other}' (expected cpu, cuda or tensorrt)"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Builds a session for `config.model_path` on the requested backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_error = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", model = %config.model_path.display(), "Building session");
            builder.commit_from_file(config.model_path).with_context(load_error)?
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", model = %config.model_path.display(), "Building session");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_error)?
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new(DEFAULT_TRT_CACHE_DIR));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                model = %config.model_path.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let started = Instant::now();
            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_error)?;
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                "TensorRT session ready"
            );
            session
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("cpu".parse::<InferenceBackend>().unwrap(), InferenceBackend::Cpu);
        assert_eq!("CUDA".parse::<InferenceBackend>().unwrap(), InferenceBackend::Cuda);
        assert_eq!("trt".parse::<InferenceBackend>().unwrap(), InferenceBackend::Tensorrt);
        assert_eq!(
            "TensorRT".parse::<InferenceBackend>().unwrap(),
            InferenceBackend::Tensorrt
        );
        assert!("directml".parse::<InferenceBackend>().is_err());
    }

    #[test]
    fn test_backend_default_is_cpu() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_display_roundtrips() {
        for backend in [InferenceBackend::Cpu, InferenceBackend::Cuda, InferenceBackend::Tensorrt] {
            assert_eq!(backend.to_string().parse::<InferenceBackend>().unwrap(), backend);
        }
    }

    #[test]
    fn test_backend_serde_lowercase() {
        let json = serde_json::to_string(&InferenceBackend::Tensorrt).unwrap();
        assert_eq!(json, "\"tensorrt\"");
        let parsed: InferenceBackend = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(parsed, InferenceBackend::Cuda);
    }
}
