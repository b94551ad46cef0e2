use crate::device::Device;
use ort::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch, GraphOptimizationLevel, Session,
};
use std::path::Path;
use tracing::debug;

pub(crate) struct ONNXModelConfig {
    pub num_intra_thread: usize,
    pub optimization_level: GraphOptimizationLevel,
    pub device: Device,
}

impl Default for ONNXModelConfig {
    fn default() -> Self {
        Self {
            num_intra_thread: 16,
            optimization_level: GraphOptimizationLevel::Level3,
            device: Device::Cpu,
        }
    }
}

/// Providers are tried in order, CPU always comes last as the fallback.
pub(crate) fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cuda => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        Device::CoreMl => vec![
            CoreMLExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
    }
}

/// Load ONNX model from file with some predefined config
pub(crate) fn load_onnx_model(
    model_path: impl AsRef<Path>,
    config: Option<ONNXModelConfig>,
) -> anyhow::Result<Session> {
    let config = config.unwrap_or_default();
    debug!(
        "loading onnx model {} on {}",
        model_path.as_ref().display(),
        config.device
    );

    let session = Session::builder()?
        .with_execution_providers(execution_providers(config.device))?
        .with_intra_threads(config.num_intra_thread)?
        .with_optimization_level(config.optimization_level)?
        .commit_from_file(model_path)?;

    Ok(session)
}
