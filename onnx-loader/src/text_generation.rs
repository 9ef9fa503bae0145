//! Token-id text generation over a loaded model
//!
//! Tokenization stays with the caller: prompts go in and come out as ids.

use crate::error::{OnnxError, Result};
use crate::loader::{load_pretrained, LoadOptions};
use ortgen_generation::{
    CallbackStreamer, GenerateRequest, GenerationOptions, InterruptableStoppingCriteria,
    ModelRegistry, PreTrainedModel, Tensor,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Text generator with autoregressive decoding
pub struct TextGenerator {
    model: PreTrainedModel,
    options: GenerationOptions,
    /// Parent of every in-flight call's token; replaced after each interrupt
    interrupt: Mutex<CancellationToken>,
}

impl TextGenerator {
    pub fn new(model: PreTrainedModel) -> Self {
        Self {
            model,
            options: GenerationOptions::default(),
            interrupt: Mutex::new(CancellationToken::new()),
        }
    }

    /// Load a model directory with the built-in model classes
    pub fn load<P: AsRef<Path>>(dir: P, options: &LoadOptions) -> Result<Self> {
        let model = load_pretrained(dir, Arc::new(ModelRegistry::builtin()), options)?;
        Ok(Self::new(model))
    }

    /// Per-call options layered over the model's stored defaults
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &PreTrainedModel {
        &self.model
    }

    /// Stops every generation in flight after its current step. Later calls
    /// are unaffected.
    pub fn interrupt(&self) {
        if let Ok(mut current) = self.interrupt.lock() {
            current.cancel();
            *current = CancellationToken::new();
        }
    }

    fn stopping_criteria(&self) -> Result<InterruptableStoppingCriteria> {
        let parent = self
            .interrupt
            .lock()
            .map_err(|e| OnnxError::InferenceFailed(format!("Failed to lock interrupt: {}", e)))?;
        Ok(InterruptableStoppingCriteria::new(parent.child_token()))
    }

    fn request(&self, prompt_ids: &[i64]) -> Result<GenerateRequest> {
        if prompt_ids.is_empty() {
            return Err(OnnxError::InvalidInput("prompt is empty".to_string()));
        }
        let input_ids = Tensor::from_rows(&[prompt_ids.to_vec()])?;
        let attention_mask = input_ids.ones_like();

        Ok(GenerateRequest::new(input_ids)
            .with_input("attention_mask", attention_mask)
            .with_options(self.options.clone())
            .with_stopping_criteria(self.stopping_criteria()?))
    }

    /// Generated ids, without the prompt (or the decoder start token).
    fn new_tokens(&self, sequence: Vec<i64>, prompt_len: usize) -> Vec<i64> {
        let skip = if self.model.class().kind.is_encoder_decoder() {
            1
        } else {
            prompt_len
        };
        sequence.into_iter().skip(skip).collect()
    }

    /// Generate token ids for a single prompt
    pub async fn generate(&self, prompt_ids: &[i64]) -> Result<Vec<i64>> {
        log::info!("Starting text generation: {} input tokens", prompt_ids.len());
        let output = self.model.generate(self.request(prompt_ids)?).await?;
        let sequence = output
            .sequences()
            .to_rows_i64()?
            .into_iter()
            .next()
            .unwrap_or_default();
        let generated = self.new_tokens(sequence, prompt_ids.len());
        log::info!("Generation complete: {} new tokens generated", generated.len());
        Ok(generated)
    }

    /// Generate with a callback invoked for every new token
    pub async fn generate_stream<F>(&self, prompt_ids: &[i64], mut callback: F) -> Result<Vec<i64>>
    where
        F: FnMut(i64) -> Result<()> + Send + 'static,
    {
        let streamer = CallbackStreamer::new(move |tokens: &[Vec<i64>]| {
            for token in tokens.iter().filter_map(|row| row.first()) {
                callback(*token)?;
            }
            Ok(())
        });
        let request = self.request(prompt_ids)?.with_streamer(streamer);
        let output = self.model.generate(request).await?;
        let sequence = output
            .sequences()
            .to_rows_i64()?
            .into_iter()
            .next()
            .unwrap_or_default();
        Ok(self.new_tokens(sequence, prompt_ids.len()))
    }
}
