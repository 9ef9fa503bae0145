//! The autoregressive generation loop
//!
//! `INIT` resolves configuration, inputs, encoder outputs and decoder start
//! ids. Each `STEP` prepares inputs, runs one forward pass, processes the last
//! position's logits and samples one token per row. Rows are checked against
//! the stopping criteria after every step; once all are done the loop halts,
//! otherwise the cache and inputs are carried into the next step.

use crate::cache::{release_if_device, CacheBundle};
use crate::config::{ConfigWarning, GenerationConfig, GenerationOptions, TokenIds};
use crate::error::{GenerationError, Result};
use crate::forward::{run_encoder, ModelInputs};
use crate::logits_process::{LogitsProcessor, LogitsProcessorList};
use crate::model::{Architecture, PreTrainedModel};
use crate::sampler::sampler_for;
use crate::stopping_criteria::{StoppingCriteria, StoppingCriteriaList};
use crate::streamer::Streamer;
use crate::tensor::{NamedTensors, Tensor};
use log::{debug, info};
use std::collections::BTreeMap;

/// Output name prefixes collected when attentions are requested
const ATTENTION_PREFIXES: &[&str] = &["cross_attentions", "encoder_attentions", "decoder_attentions"];

/// Everything one `generate` call needs from the caller
#[derive(Default)]
pub struct GenerateRequest {
    /// Main model input (`input_ids`, `input_features` or `pixel_values`)
    pub inputs: Option<Tensor>,
    pub model_inputs: NamedTensors,
    pub generation_config: GenerationOptions,
    pub logits_processor: Vec<Box<dyn LogitsProcessor>>,
    pub stopping_criteria: Vec<Box<dyn StoppingCriteria>>,
    pub streamer: Option<Box<dyn Streamer>>,
    /// Extra output names to collect every step
    pub auxiliary_outputs: Vec<String>,
}

impl GenerateRequest {
    pub fn new(inputs: Tensor) -> Self {
        Self {
            inputs: Some(inputs),
            ..Default::default()
        }
    }

    /// Request built from named inputs only.
    pub fn from_model_inputs(model_inputs: NamedTensors) -> Self {
        Self {
            model_inputs,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.model_inputs.insert(name.into(), tensor);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.generation_config = options;
        self
    }

    pub fn with_logits_processor<P: LogitsProcessor + 'static>(mut self, processor: P) -> Self {
        self.logits_processor.push(Box::new(processor));
        self
    }

    pub fn with_stopping_criteria<C: StoppingCriteria + 'static>(mut self, criteria: C) -> Self {
        self.stopping_criteria.push(Box::new(criteria));
        self
    }

    pub fn with_streamer<S: Streamer + 'static>(mut self, streamer: S) -> Self {
        self.streamer = Some(Box::new(streamer));
        self
    }

    pub fn with_auxiliary_output(mut self, name: impl Into<String>) -> Self {
        self.auxiliary_outputs.push(name.into());
        self
    }
}

/// Detailed result, returned when `return_dict_in_generate` is set
#[derive(Debug)]
pub struct GenerateDict {
    /// `[rows, len]` int64
    pub sequences: Tensor,
    pub past_key_values: Option<CacheBundle>,
    /// Prefix -> per step -> per layer
    pub attentions: BTreeMap<String, Vec<Vec<Tensor>>>,
    /// Output name -> per step
    pub auxiliary: BTreeMap<String, Vec<Tensor>>,
    /// Summed log-probability of each row's generated tokens
    pub scores: Vec<f32>,
    /// Length of each row up to and including its final real token
    pub lengths: Vec<usize>,
    pub steps: usize,
    pub warnings: Vec<ConfigWarning>,
}

#[derive(Debug)]
pub enum GenerateOutput {
    Sequences(Tensor),
    Dict(Box<GenerateDict>),
}

impl GenerateOutput {
    pub fn sequences(&self) -> &Tensor {
        match self {
            Self::Sequences(sequences) => sequences,
            Self::Dict(dict) => &dict.sequences,
        }
    }

    pub fn into_dict(self) -> Option<GenerateDict> {
        match self {
            Self::Dict(dict) => Some(*dict),
            Self::Sequences(_) => None,
        }
    }
}

impl PreTrainedModel {
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutput> {
        generate(self, request).await
    }
}

/// Runs the encoder once and stores `encoder_outputs`, doubling for
/// classifier-free guidance or broadcasting a batch-1 encoder to the
/// caller's decoder batch.
async fn prepare_encoder_outputs(
    model: &PreTrainedModel,
    inputs: &mut ModelInputs,
    config: &GenerationConfig,
) -> Result<()> {
    let Architecture::EncoderDecoder {
        encoder,
        embed_tokens,
        ..
    } = model.architecture()
    else {
        return Ok(());
    };
    if inputs.tensors.contains_key("encoder_outputs") {
        return Ok(());
    }

    let mut outputs =
        run_encoder(encoder.as_ref(), embed_tokens.as_deref(), &[&inputs.tensors]).await?;
    let mut hidden = outputs
        .remove("last_hidden_state")
        .ok_or_else(|| GenerationError::MissingOutput("last_hidden_state".to_string()))?;
    for (_, leftover) in outputs {
        release_if_device(encoder.as_ref(), leftover);
    }

    if config.uses_guidance() {
        hidden = Tensor::concat(&[&hidden, &hidden.zeros_like()], 0)?;
        if let Some(mask) = inputs.get("attention_mask") {
            let doubled = Tensor::concat(&[mask, &mask.zeros_like()], 0)?;
            inputs.insert("attention_mask", doubled);
        }
    } else if let Some(decoder_input_ids) = inputs.get("decoder_input_ids") {
        let decoder_batch = decoder_input_ids.dim(0)?;
        let encoder_batch = hidden.dim(0)?;
        if decoder_batch != encoder_batch {
            if encoder_batch != 1 {
                return Err(GenerationError::BatchSizeMismatch {
                    encoder: encoder_batch,
                    decoder: decoder_batch,
                });
            }
            hidden = hidden.repeat_batch(decoder_batch)?;
        }
    }

    inputs.insert("encoder_outputs", hidden);
    Ok(())
}

/// Decoder start rows: caller ids when given, otherwise
/// `decoder_start_token_id` (falling back to `bos_token_id`).
fn prepare_decoder_input_ids(
    model: &PreTrainedModel,
    inputs: &mut ModelInputs,
    batch_size: usize,
    config: &GenerationConfig,
) -> Result<Vec<Vec<i64>>> {
    let rows = match inputs.remove("decoder_input_ids") {
        Some(ids) => ids.to_rows_i64()?,
        None => {
            let start = config
                .decoder_start_token_id
                .clone()
                .or_else(|| config.bos_token_id.map(TokenIds::Single))
                .ok_or_else(|| {
                    GenerationError::InvalidConfig(
                        "neither `decoder_start_token_id` nor `bos_token_id` is set".to_string(),
                    )
                })?;
            match (model.config().num_codebooks(), start) {
                (Some(codebooks), start) => {
                    let id = start.first().ok_or_else(|| {
                        GenerationError::InvalidConfig("empty `decoder_start_token_id`".to_string())
                    })?;
                    vec![vec![id]; batch_size * codebooks]
                }
                (None, TokenIds::Many(ids)) => {
                    if ids.len() != batch_size {
                        return Err(GenerationError::InvalidDecoderStartIds {
                            expected: batch_size,
                            actual: ids.len(),
                        });
                    }
                    ids.into_iter().map(|id| vec![id]).collect()
                }
                (None, TokenIds::Single(id)) => vec![vec![id]; batch_size],
            }
        }
    };
    let decoder_input_ids = Tensor::from_rows(&rows)?;
    inputs.insert("decoder_attention_mask", decoder_input_ids.ones_like());
    Ok(rows)
}

/// Carries the step's tokens into the next step's inputs.
fn update_model_inputs(
    inputs: &mut ModelInputs,
    new_tokens: &[Vec<i64>],
    is_encoder_decoder: bool,
) -> Result<()> {
    inputs.insert("input_ids", Tensor::from_rows(new_tokens)?);
    if !is_encoder_decoder {
        inputs.remove("inputs_embeds");
        if let Some(mask) = inputs.get("attention_mask") {
            let column = Tensor::ones(mask.dtype(), &[mask.dim(0)?, 1]);
            let extended = Tensor::concat(&[mask, &column], 1)?;
            inputs.insert("attention_mask", extended);
        }
    }
    inputs.remove("position_ids");
    Ok(())
}

fn collect_attentions(
    outputs: &mut NamedTensors,
    attentions: &mut BTreeMap<String, Vec<Vec<Tensor>>>,
) {
    for prefix in ATTENTION_PREFIXES {
        let mut names: Vec<String> = outputs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        if names.is_empty() {
            continue;
        }
        names.sort();
        let layers = names
            .iter()
            .filter_map(|name| outputs.remove(name))
            .collect();
        attentions
            .entry(prefix.to_string())
            .or_default()
            .push(layers);
    }
}

pub async fn generate(model: &PreTrainedModel, request: GenerateRequest) -> Result<GenerateOutput> {
    // INIT
    model.ensure_can_generate()?;
    let GenerateRequest {
        inputs,
        model_inputs,
        generation_config: options,
        logits_processor,
        stopping_criteria,
        mut streamer,
        auxiliary_outputs,
    } = request;

    let config = GenerationConfig::resolve(model.config(), model.generation_config(), &options);
    let (mut config, warnings) = config.normalized();
    config.validate()?;

    let kind = model.class().kind;
    if config.uses_guidance() && !kind.is_encoder_decoder() {
        return Err(GenerationError::Unsupported(format!(
            "classifier-free guidance is only available for encoder-decoder models, not {}",
            model.class().name
        )));
    }

    let main_input_name = model.class().main_input_name;
    let mut tensors = model_inputs;
    if let Some(inputs) = inputs {
        if tensors.contains_key(main_input_name) {
            return Err(GenerationError::InvalidInput(format!(
                "`{0}` was passed both as `inputs` and as a named input; pass only one of them",
                main_input_name
            )));
        }
        tensors.insert(main_input_name.to_string(), inputs);
    }
    let main_input = tensors
        .get(main_input_name)
        .ok_or_else(|| GenerationError::MissingInputs {
            names: vec![main_input_name.to_string()],
        })?;
    let batch_size = main_input.dim(0)?;

    let mut model_inputs = ModelInputs::new(tensors);
    let mut sequences = if kind.is_encoder_decoder() {
        prepare_encoder_outputs(model, &mut model_inputs, &config).await?;
        prepare_decoder_input_ids(model, &mut model_inputs, batch_size, &config)?
    } else {
        model_inputs
            .get("input_ids")
            .ok_or_else(|| GenerationError::MissingInputs {
                names: vec!["input_ids".to_string()],
            })?
            .to_rows_i64()?
    };

    let input_len = sequences.first().map(Vec::len).unwrap_or(0);
    config.max_length = config.effective_max_length(input_len);

    let mut processors = LogitsProcessorList::from_config(&config, input_len);
    processors.extend(logits_processor);
    let mut criteria =
        StoppingCriteriaList::from_config(&config, model.config().max_position_embeddings());
    criteria.extend(stopping_criteria);
    let mut sampler = sampler_for(&config);

    let rows = sequences.len();
    let fill_token = config.fill_token_id();
    let mut scores = vec![0.0f32; rows];
    let mut lengths = vec![input_len; rows];
    let mut finished = vec![false; rows];
    let mut attentions = BTreeMap::new();
    let mut auxiliary: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
    let collect_attention = config.output_attentions && config.return_dict_in_generate;
    let session = model.architecture().decoder_session();

    info!(
        "Starting generation with {}: {} rows, {} input tokens, max_length {}",
        model.class().name,
        rows,
        input_len,
        config.max_length
    );
    if let Some(streamer) = streamer.as_mut() {
        streamer.put(&sequences)?;
    }

    let mut steps = 0usize;
    let mut outputs = loop {
        // STEP
        model_inputs = model.prepare_inputs_for_generation(&sequences, model_inputs, &config)?;
        let mut outputs = model.forward(&model_inputs).await?;
        steps += 1;

        if collect_attention {
            collect_attentions(&mut outputs, &mut attentions);
        }
        for name in &auxiliary_outputs {
            if let Some(tensor) = outputs.remove(name) {
                auxiliary.entry(name.clone()).or_default().push(tensor);
            }
        }

        let raw_logits = outputs
            .remove("logits")
            .ok_or_else(|| GenerationError::MissingOutput("logits".to_string()))?;
        let logits = raw_logits.last_position_logits()?;
        release_if_device(session, raw_logits);
        let logits = processors.process(&sequences, logits)?;
        if logits.nrows() < rows {
            return Err(GenerationError::ShapeMismatch(format!(
                "expected logits for {} rows, got {}",
                rows,
                logits.nrows()
            )));
        }

        let mut new_tokens = Vec::with_capacity(rows);
        for (i, row) in logits.outer_iter().take(rows).enumerate() {
            let (token, log_prob) = sampler
                .sample(row)?
                .into_iter()
                .next()
                .ok_or_else(|| GenerationError::Sampling("no candidate returned".to_string()))?;
            if finished[i] {
                new_tokens.push(vec![fill_token.unwrap_or(token)]);
            } else {
                scores[i] += log_prob;
                lengths[i] += 1;
                new_tokens.push(vec![token]);
            }
        }
        for (sequence, token) in sequences.iter_mut().zip(&new_tokens) {
            sequence.extend_from_slice(token);
        }
        if let Some(streamer) = streamer.as_mut() {
            streamer.put(&new_tokens)?;
        }

        for (finished, done) in finished.iter_mut().zip(criteria.is_done(&sequences)) {
            *finished |= done;
        }
        debug!(
            "step {}: {} of {} rows finished",
            steps,
            finished.iter().filter(|&&f| f).count(),
            rows
        );
        if finished.iter().all(|&f| f) {
            break outputs;
        }

        // CONTINUE
        let previous = model_inputs.past_key_values.take();
        model_inputs.past_key_values =
            Some(model.cache().extract_cache(&mut outputs, previous, session));
        model.release_outputs(outputs);
        update_model_inputs(&mut model_inputs, &new_tokens, kind.is_encoder_decoder())?;
    };

    // HALT
    if let Some(streamer) = streamer.as_mut() {
        streamer.end()?;
    }
    let previous = model_inputs.past_key_values.take();
    let cache = model.cache().extract_cache(&mut outputs, previous, session);
    model.release_outputs(std::mem::take(&mut outputs));
    if let (Some(encoder), Some(hidden)) = (
        model.architecture().encoder_session(),
        model_inputs.remove("encoder_outputs"),
    ) {
        release_if_device(encoder, hidden);
    }

    let sequences_tensor = Tensor::from_rows(&sequences)?;
    info!(
        "Generation complete: {} steps, lengths {:?}",
        steps, lengths
    );

    if config.return_dict_in_generate {
        Ok(GenerateOutput::Dict(Box::new(GenerateDict {
            sequences: sequences_tensor,
            past_key_values: Some(cache),
            attentions,
            auxiliary,
            scores,
            lengths,
            steps,
            warnings,
        })))
    } else {
        model.cache().flush(cache, session);
        Ok(GenerateOutput::Sequences(sequences_tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_extends_decoder_mask() {
        let mut inputs = ModelInputs::new(NamedTensors::new());
        inputs.insert("attention_mask", Tensor::from_rows(&[vec![1, 1], vec![0, 1]]).unwrap());
        inputs.insert("position_ids", Tensor::from_rows(&[vec![0, 1], vec![1, 0]]).unwrap());
        update_model_inputs(&mut inputs, &[vec![7], vec![8]], false).unwrap();

        assert_eq!(
            inputs.get("attention_mask").unwrap().to_rows_i64().unwrap(),
            vec![vec![1, 1, 1], vec![0, 1, 1]]
        );
        assert_eq!(
            inputs.get("input_ids").unwrap().to_rows_i64().unwrap(),
            vec![vec![7], vec![8]]
        );
        assert!(inputs.get("position_ids").is_none());
    }

    #[test]
    fn test_update_leaves_encoder_mask() {
        let mut inputs = ModelInputs::new(NamedTensors::new());
        inputs.insert("attention_mask", Tensor::from_rows(&[vec![1, 1, 1]]).unwrap());
        update_model_inputs(&mut inputs, &[vec![3]], true).unwrap();
        assert_eq!(inputs.get("attention_mask").unwrap().dims(), &[1, 3]);
    }

    #[test]
    fn test_collect_attentions_by_prefix() {
        let mut outputs = NamedTensors::new();
        for name in ["cross_attentions.1", "cross_attentions.0", "decoder_attentions.0", "logits"] {
            outputs.insert(name.to_string(), Tensor::from_rows(&[vec![0]]).unwrap());
        }
        let mut attentions = BTreeMap::new();
        collect_attentions(&mut outputs, &mut attentions);
        collect_attentions(&mut outputs, &mut attentions);

        assert_eq!(attentions["cross_attentions"].len(), 1);
        assert_eq!(attentions["cross_attentions"][0].len(), 2);
        assert_eq!(attentions["decoder_attentions"][0].len(), 1);
        assert!(!attentions.contains_key("encoder_attentions"));
        assert!(outputs.contains_key("logits"));
    }
}
