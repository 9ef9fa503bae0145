use ortgen_generation::GenerationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OnnxError>;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("Failed to create ONNX environment: {0}")]
    EnvironmentCreationFailed(String),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Failed to create session: {0}")]
    SessionCreationFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Unsupported tensor type: {0}")]
    UnsupportedType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<OnnxError> for GenerationError {
    fn from(err: OnnxError) -> Self {
        match err {
            OnnxError::Generation(inner) => inner,
            OnnxError::IoError(inner) => GenerationError::Io(inner),
            OnnxError::InvalidInput(message) => GenerationError::InvalidInput(message),
            other => GenerationError::Session(other.to_string()),
        }
    }
}
