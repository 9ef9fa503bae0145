//! Autoregressive generation over exported transformer graphs
//!
//! - Key/value cache management across forward passes
//! - Logits processors, stopping criteria and sampling
//! - Forward dispatch for encoder-only, decoder-only, encoder-decoder and
//!   multimodal models
//! - The generation loop with streaming and cancellation
//!
//! Graph execution is abstracted behind [`InferenceSession`]; see
//! `ortgen-onnx-loader` for the ONNX Runtime implementation.

pub mod cache;
pub mod config;
pub mod error;
pub mod forward;
pub mod generate;
pub mod logits_process;
pub mod model;
pub mod model_config;
pub mod registry;
pub mod sampler;
pub mod session;
pub mod stopping_criteria;
pub mod streamer;
pub mod tensor;

pub use cache::{CacheBundle, CacheLayout, CacheManager};
pub use config::{ConfigWarning, GenerationConfig, GenerationOptions, TokenIds};
pub use error::{GenerationError, Result};
pub use forward::ModelInputs;
pub use generate::{generate, GenerateDict, GenerateOutput, GenerateRequest};
pub use logits_process::{LogitsProcessor, LogitsProcessorList};
pub use model::{Architecture, Modality, PreTrainedModel, SharedSession};
pub use model_config::ModelConfig;
pub use registry::{ArchitectureKind, ModelClass, ModelRegistry};
pub use sampler::Sampler;
pub use session::{Feeds, InferenceSession};
pub use stopping_criteria::{InterruptableStoppingCriteria, StoppingCriteria, StoppingCriteriaList};
pub use streamer::{CallbackStreamer, ChannelStreamer, StreamEvent, Streamer};
pub use tensor::{DataType, Location, NamedTensors, Tensor};
