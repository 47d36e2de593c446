use super::preprocess::Preprocessor;
use super::types::{Backend, Mask, RunningMode, SegmentationEngine};
use anyhow::{Context, Result};
use image::RgbaImage;
use ndarray::Ix4;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// DeepLab v3 semantic segmentation over ONNX Runtime
///
/// The model is stateless, so Image and Video modes share one code path; the
/// mode is tracked for logging and to honor the engine contract.
pub struct DeepLab {
    session: Session,
    preprocessor: Preprocessor,
    mode: RunningMode,
}

impl DeepLab {
    /// Load a DeepLab ONNX export
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `backend` - Preferred execution provider; CPU is always registered as
    ///   the fallback
    /// * `input_edge` - Square input size the model was exported with
    pub fn new<P: AsRef<Path>>(model_path: P, backend: Backend, input_edge: u32) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!(
            "Loading DeepLab model from {} (backend={:?}, input={}x{})",
            path.display(),
            backend,
            input_edge,
            input_edge
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .with_execution_providers(execution_providers(backend))?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("DeepLab model loaded successfully");

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(input_edge, input_edge),
            mode: RunningMode::Image,
        })
    }
}

fn execution_providers(backend: Backend) -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::with_capacity(3);
    if backend == Backend::TensorRt {
        providers.push(TensorRTExecutionProvider::default().build());
    }
    if matches!(backend, Backend::Cuda | Backend::TensorRt) {
        providers.push(CUDAExecutionProvider::default().build());
    }
    providers.push(CPUExecutionProvider::default().build());
    providers
}

impl SegmentationEngine for DeepLab {
    fn configure(&mut self, mode: RunningMode) -> Result<()> {
        if self.mode != mode {
            tracing::debug!("DeepLab running mode {} -> {}", self.mode, mode);
            self.mode = mode;
        }
        Ok(())
    }

    fn segment(&mut self, frame: &RgbaImage, timestamp_ms: f64) -> Result<Option<Mask>> {
        let _span = tracing::debug_span!("deeplab_segment", mode = %self.mode, timestamp_ms).entered();

        let input = Tensor::from_array(self.preprocessor.preprocess(frame))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        // Logits are the first output (shape: [1, classes, H, W])
        let logits = outputs[0]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()
            .context("Model output is not a 4D logits tensor")?;

        let (frame_width, frame_height) = frame.dimensions();
        let mask = Preprocessor::logits_to_mask(logits, frame_width, frame_height)?;

        Ok(Some(mask))
    }
}
