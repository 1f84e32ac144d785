//! The inference capability and the explicit model cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{ArrayD, ArrayView3, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::arch::{ModelHandle, ModelId};
use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::tensor::TensorBuffer;

/// A loaded model. Maps a `(C, H, W)` tile to `(C, H', W')`.
pub trait Inference: Send {
    fn run(&mut self, input: ArrayView3<'_, f32>) -> Result<TensorBuffer>;
}

/// Turns a resolved model file into a runnable [`Inference`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, handle: &ModelHandle) -> Result<Box<dyn Inference>>;
}

pub type SharedInference = Arc<Mutex<Box<dyn Inference>>>;

/// Caller-owned cache of loaded models, keyed by [`ModelId`].
///
/// Clones share the same entries. Models load lazily on first use and stay
/// loaded until evicted or until the last clone is dropped.
#[derive(Clone)]
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    entries: Arc<Mutex<HashMap<ModelId, SharedInference>>>,
}

impl ModelCache {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self::with_loader(Arc::new(loader))
    }

    pub fn with_loader(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_or_load(&self, handle: &ModelHandle) -> Result<SharedInference> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("model cache lock poisoned"))?;
        if let Some(model) = entries.get(&handle.id) {
            debug!(model = %handle.id, "Model cache hit");
            return Ok(Arc::clone(model));
        }

        info!(model = %handle.id, path = %handle.path.display(), "Loading model");
        let model = self
            .loader
            .load(handle)
            .with_context(|| format!("failed to load model {}", handle.id))?;
        let model = Arc::new(Mutex::new(model));
        entries.insert(handle.id, Arc::clone(&model));
        Ok(model)
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops one model. Returns whether it was loaded.
    pub fn evict(&self, id: &ModelId) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(id).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Loads ONNX models through ONNX Runtime.
#[derive(Debug, Clone, Default)]
pub struct OrtLoader {
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
}

impl ModelLoader for OrtLoader {
    fn load(&self, handle: &ModelHandle) -> Result<Box<dyn Inference>> {
        if !handle.path.is_file() {
            bail!("model file not found: {}", handle.path.display());
        }
        let session = build_session(&SessionConfig {
            model_path: &handle.path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        })?;
        Ok(Box::new(OrtInference::new(session)?))
    }
}

/// ONNX Runtime session wrapper. FP16 models are fed and read through `half`.
pub struct OrtInference {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OrtInference {
    pub fn new(session: Session) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("model declares no inputs")?;
        let input_name = input.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .context("model declares no outputs")?
            .name()
            .to_string();

        debug!(%input_name, %output_name, is_fp16, "Inspected model signature");
        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run_f32(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }

    fn run_f16(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let f32_slice = input
            .as_slice()
            .context("input must be contiguous for f16 conversion")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);
        let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;

        let tensor = Tensor::from_array(fp16_array)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        let contiguous = view.as_standard_layout();
        let fp16_slice = contiguous
            .as_slice()
            .context("standard-layout output is not contiguous")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);
        Ok(ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?)
    }
}

impl Inference for OrtInference {
    fn run(&mut self, input: ArrayView3<'_, f32>) -> Result<TensorBuffer> {
        let batched = input
            .insert_axis(Axis(0))
            .as_standard_layout()
            .into_owned()
            .into_dyn();
        let output = if self.is_fp16 {
            self.run_f16(batched)?
        } else {
            self.run_f32(batched)?
        };

        let output = output
            .into_dimensionality::<Ix4>()
            .context("model output is not NCHW")?;
        if output.shape()[0] != 1 {
            bail!("expected batch size 1, model returned {}", output.shape()[0]);
        }
        Ok(TensorBuffer::from_array(output.index_axis_move(Axis(0), 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, ModelKind, Style};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl Inference for Echo {
        fn run(&mut self, input: ArrayView3<'_, f32>) -> Result<TensorBuffer> {
            Ok(TensorBuffer::from_array(input.to_owned()))
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, _: &ModelHandle) -> Result<Box<dyn Inference>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Echo))
        }
    }

    fn handle(kind: ModelKind) -> ModelHandle {
        let id = ModelId {
            architecture: Architecture::SwinUnet,
            style: Style::Art,
            kind,
        };
        ModelHandle {
            id,
            path: PathBuf::from("unused.onnx"),
        }
    }

    #[test]
    fn test_cache_loads_once_per_id() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = ModelCache::new(CountingLoader {
            loads: Arc::clone(&loads),
        });
        let shared = cache.clone();

        cache.get_or_load(&handle(ModelKind::Scale(2))).unwrap();
        shared.get_or_load(&handle(ModelKind::Scale(2))).unwrap();
        cache.get_or_load(&handle(ModelKind::Noise(1))).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(shared.len(), 2);
        assert!(cache.contains(&handle(ModelKind::Noise(1)).id));
    }

    #[test]
    fn test_evict_forces_reload() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = ModelCache::new(CountingLoader {
            loads: Arc::clone(&loads),
        });
        let h = handle(ModelKind::Scale(4));
        cache.get_or_load(&h).unwrap();
        assert!(cache.evict(&h.id));
        assert!(!cache.evict(&h.id));
        cache.get_or_load(&h).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ort_loader_reports_missing_file() {
        let cache = ModelCache::new(OrtLoader::default());
        let err = cache.get_or_load(&handle(ModelKind::Scale(2))).err().unwrap();
        assert!(format!("{err:#}").contains("model file not found"));
    }

    /// Needs a real model: `SEAMSCALE_TEST_MODEL=/path/to/scale2x.onnx`.
    #[test]
    #[ignore]
    fn test_ort_inference_on_real_model() {
        let path = PathBuf::from(std::env::var("SEAMSCALE_TEST_MODEL").unwrap());
        let mut h = handle(ModelKind::Scale(2));
        h.path = path;
        let mut model = OrtLoader::default().load(&h).unwrap();
        let input = ndarray::Array3::<f32>::from_elem((3, 64, 64), 0.5);
        let output = model.run(input.view()).unwrap();
        assert_eq!(output.channels(), 3);
    }
}
