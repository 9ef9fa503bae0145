use crate::tensor::DataType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenerationError>;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("{}", no_head_message(.class_name, .alternatives))]
    NoLanguageModelHead {
        class_name: String,
        alternatives: Vec<String>,
    },

    #[error("The encoder outputs have a different batch size ({encoder}) than the decoder inputs ({decoder})")]
    BatchSizeMismatch { encoder: usize, decoder: usize },

    #[error("`decoder_start_token_id` expected to have length {expected} but got {actual}")]
    InvalidDecoderStartIds { expected: usize, actual: usize },

    #[error("Missing the following inputs: {}", .names.join(", "))]
    MissingInputs { names: Vec<String> },

    #[error("Ragged batch (row lengths {lengths:?}); pad or truncate the inputs before generation")]
    RaggedBatch { lengths: Vec<usize> },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Expected a {expected} tensor, got {actual}")]
    DataType { expected: DataType, actual: DataType },

    #[error("Model output not found: {0}")]
    MissingOutput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Session failed: {0}")]
    Session(String),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Streamer failed: {0}")]
    Streamer(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn no_head_message(class_name: &str, alternatives: &[String]) -> String {
    let mut message = format!(
        "The current model class ({}) is not compatible with `generate()`, as it doesn't have a language model head.",
        class_name
    );
    if !alternatives.is_empty() {
        message.push_str(&format!(
            " Please use the following class instead: {}",
            alternatives.join(", ")
        ));
    }
    message
}
