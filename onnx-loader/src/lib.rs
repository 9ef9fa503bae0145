//! ONNX Runtime backend for `ortgen-generation`
//!
//! - [`OnnxSession`]: an `ort` session implementing the generation core's
//!   `InferenceSession` trait
//! - [`load_pretrained`]: model directory (`config.json`,
//!   `generation_config.json`, `onnx/*.onnx`) to a `PreTrainedModel`
//! - [`TextGenerator`]: token-id generation with streaming and interruption

pub mod config;
pub mod convert;
pub mod error;
pub mod loader;
pub mod session;
pub mod text_generation;

pub use config::{Provider, SessionConfig};
pub use error::{OnnxError, Result};
pub use loader::{load_pretrained, LoadOptions};
pub use session::OnnxSession;
pub use text_generation::TextGenerator;

/// Re-export of `ort` for direct session access
pub use ort;

/// Initialize ONNX Runtime environment
pub fn init() -> Result<()> {
    log::info!("Initializing ONNX Runtime loader");
    ort::init()
        .with_name("ortgen")
        .commit()
        .map_err(|e| OnnxError::EnvironmentCreationFailed(e.to_string()))?;
    Ok(())
}
