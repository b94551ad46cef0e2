use ort::{CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::debug;

/// Where the ONNX sessions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    #[strum(to_string = "coreml", serialize = "mps")]
    #[serde(rename = "coreml", alias = "mps")]
    CoreMl,
    Cpu,
}

impl Device {
    /// Priority is CUDA, then CoreML, then CPU.
    pub fn select(cuda_available: bool, coreml_available: bool) -> Self {
        if cuda_available {
            Device::Cuda
        } else if coreml_available {
            Device::CoreMl
        } else {
            Device::Cpu
        }
    }

    /// Ask the ONNX Runtime build which accelerators it can use.
    pub fn detect() -> Self {
        let cuda_available = CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false);
        let coreml_available = CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false);
        debug!(cuda_available, coreml_available, "execution providers probed");

        Self::select(cuda_available, coreml_available)
    }

    pub fn resolve(preference: Option<Device>) -> Self {
        match preference {
            Some(device) => device,
            None => Self::detect(),
        }
    }
}
