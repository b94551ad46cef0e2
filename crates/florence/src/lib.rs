mod loader;
mod ort;
mod traits;

pub mod device;
pub mod florence2;
pub mod generation;
pub mod remote_code;
pub mod tokenizer;

pub use device::Device;
pub use florence2::{Florence2, Florence2Config, Task, TaskAnswer};
pub use tokenizers;
pub use traits::*;

use tokio::sync::oneshot;

pub type HandlerPayload<TItem, TOutput> = (
    Vec<TItem>,
    oneshot::Sender<anyhow::Result<Vec<anyhow::Result<TOutput>>>>,
);
