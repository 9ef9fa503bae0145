//! One forward step per architecture family, and per-step input preparation
//!
//! A model resolves its [`Dispatch`] once at construction; the generation loop
//! only ever calls `prepare_inputs` and `forward` through it.

use crate::cache::CacheBundle;
use crate::config::GenerationConfig;
use crate::error::{GenerationError, Result};
use crate::model::{Architecture, Modality, PreTrainedModel};
use crate::registry::ArchitectureKind;
use crate::session::{Feeds, InferenceSession};
use crate::tensor::{DataType, NamedTensors, Tensor};
use futures::future::BoxFuture;
use half::f16;
use log::debug;
use ndarray::{s, Array2, Ix3};

/// Per-step model state: named tensors plus the cache from the last step
#[derive(Debug, Clone, Default)]
pub struct ModelInputs {
    pub tensors: NamedTensors,
    pub past_key_values: Option<CacheBundle>,
}

impl ModelInputs {
    pub fn new(tensors: NamedTensors) -> Self {
        Self {
            tensors,
            past_key_values: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn past_length(&self) -> usize {
        self.past_key_values
            .as_ref()
            .map(CacheBundle::past_length)
            .unwrap_or(0)
    }
}

/// Named tensor source for building a session feed
pub trait TensorLookup: Sync {
    fn lookup(&self, name: &str) -> Option<&Tensor>;

    fn available(&self) -> Vec<&str>;
}

impl TensorLookup for NamedTensors {
    fn lookup(&self, name: &str) -> Option<&Tensor> {
        self.get(name)
    }

    fn available(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

impl TensorLookup for CacheBundle {
    fn lookup(&self, name: &str) -> Option<&Tensor> {
        self.get(name)
    }

    fn available(&self) -> Vec<&str> {
        self.names().collect()
    }
}

impl TensorLookup for Feeds<'_> {
    fn lookup(&self, name: &str) -> Option<&Tensor> {
        self.get(name)
    }

    fn available(&self) -> Vec<&str> {
        self.names()
    }
}

fn find<'a>(sources: &[&'a dyn TensorLookup], name: &str) -> Option<&'a Tensor> {
    sources.iter().copied().find_map(|source| source.lookup(name))
}

/// Selects exactly the declared inputs from `sources` (earlier sources win).
///
/// Every missing input is reported at once; nothing runs in that case.
pub fn pick_feeds<'a>(
    input_names: &'a [String],
    sources: &[&'a dyn TensorLookup],
) -> Result<Feeds<'a>> {
    let mut feeds = Feeds::new();
    let mut missing = Vec::new();
    for name in input_names {
        match find(sources, name) {
            Some(tensor) => feeds.push(name.as_str(), tensor),
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(GenerationError::MissingInputs { names: missing });
    }

    let mut ignored: Vec<&str> = sources
        .iter()
        .flat_map(|source| source.available())
        .filter(|name| !input_names.iter().any(|n| n.as_str() == *name))
        .collect();
    if !ignored.is_empty() {
        ignored.sort_unstable();
        ignored.dedup();
        debug!("ignoring inputs not declared by the session: {:?}", ignored);
    }
    Ok(feeds)
}

pub async fn run_session(
    session: &dyn InferenceSession,
    sources: &[&dyn TensorLookup],
) -> Result<NamedTensors> {
    let feeds = pick_feeds(session.input_names(), sources)?;
    session.run(&feeds).await
}

fn take_output(outputs: &mut NamedTensors, name: &str) -> Result<Tensor> {
    outputs
        .remove(name)
        .ok_or_else(|| GenerationError::MissingOutput(name.to_string()))
}

/// Position ids from an attention mask: a running count of attended tokens
/// starting at `start_index`, with padded positions set to 1.
///
/// With a cache only the last `cached_seq_len` columns are kept.
pub fn create_position_ids(
    attention_mask: &Tensor,
    start_index: i64,
    cached_seq_len: Option<usize>,
) -> Result<Tensor> {
    let rows: Vec<Vec<i64>> = attention_mask
        .to_rows_i64()?
        .into_iter()
        .map(|mask| {
            let mut next = start_index;
            mask.into_iter()
                .map(|attended| {
                    if attended == 0 {
                        1
                    } else {
                        let position = next;
                        next += 1;
                        position
                    }
                })
                .collect()
        })
        .collect();
    let position_ids = Tensor::from_rows(&rows)?;
    match cached_seq_len {
        Some(seq_len) => position_ids.slice_last(1, seq_len),
        None => Ok(position_ids),
    }
}

/// Token embeddings through the `embed_tokens` graph.
pub async fn embed_tokens(session: &dyn InferenceSession, input_ids: &Tensor) -> Result<Tensor> {
    let mut feeds = Feeds::new();
    feeds.push("input_ids", input_ids);
    let mut outputs = session.run(&feeds).await?;
    take_output(&mut outputs, "inputs_embeds")
}

/// Runs an encoder graph, deriving `inputs_embeds`, `token_type_ids` and
/// `pixel_mask` when the graph declares them and the caller did not.
pub async fn run_encoder(
    session: &dyn InferenceSession,
    embed_session: Option<&dyn InferenceSession>,
    sources: &[&dyn TensorLookup],
) -> Result<NamedTensors> {
    let mut derived = NamedTensors::new();

    if session.has_input("inputs_embeds") && find(sources, "inputs_embeds").is_none() {
        let input_ids = find(sources, "input_ids").ok_or_else(|| {
            GenerationError::InvalidInput(
                "Both `input_ids` and `inputs_embeds` are missing in the model inputs.".to_string(),
            )
        })?;
        let embed_session = embed_session.ok_or_else(|| {
            GenerationError::Unsupported(
                "the encoder expects `inputs_embeds` but no `embed_tokens` graph is loaded"
                    .to_string(),
            )
        })?;
        derived.insert(
            "inputs_embeds".to_string(),
            embed_tokens(embed_session, input_ids).await?,
        );
    }

    if session.has_input("token_type_ids") && find(sources, "token_type_ids").is_none() {
        let input_ids = find(sources, "input_ids").ok_or_else(|| {
            GenerationError::InvalidInput(
                "Both `input_ids` and `token_type_ids` are missing in the model inputs."
                    .to_string(),
            )
        })?;
        derived.insert("token_type_ids".to_string(), input_ids.zeros_like());
    }

    if session.has_input("pixel_mask") && find(sources, "pixel_mask").is_none() {
        let pixel_values = find(sources, "pixel_values").ok_or_else(|| {
            GenerationError::InvalidInput(
                "Both `pixel_values` and `pixel_mask` are missing in the model inputs."
                    .to_string(),
            )
        })?;
        let dims = pixel_values.dims();
        if dims.len() != 4 {
            return Err(GenerationError::ShapeMismatch(format!(
                "pixel_values must be [batch, channels, height, width], got {:?}",
                dims
            )));
        }
        derived.insert(
            "pixel_mask".to_string(),
            Tensor::ones(DataType::Int64, &[dims[0], dims[2], dims[3]]),
        );
    }

    let mut all: Vec<&dyn TensorLookup> = vec![&derived];
    all.extend_from_slice(sources);
    run_session(session, &all).await
}

/// Runs a decoder graph with the cache spliced in (zero-seeded when absent).
async fn run_decoder(
    model: &PreTrainedModel,
    session: &dyn InferenceSession,
    sources: &[&dyn TensorLookup],
    past_key_values: Option<&CacheBundle>,
) -> Result<NamedTensors> {
    let mut derived = NamedTensors::new();

    if session.has_input("use_cache_branch") {
        derived.insert(
            "use_cache_branch".to_string(),
            Tensor::scalar_bool(past_key_values.is_some()),
        );
    }

    if session.has_input("position_ids") && find(sources, "position_ids").is_none() {
        if let Some(mask) = find(sources, "attention_mask") {
            let cached_seq_len = match past_key_values {
                Some(_) => {
                    let tokens = find(sources, "input_ids")
                        .or_else(|| find(sources, "inputs_embeds"))
                        .ok_or_else(|| GenerationError::MissingInputs {
                            names: vec!["input_ids".to_string()],
                        })?;
                    Some(tokens.dim(1)?)
                }
                None => None,
            };
            derived.insert(
                "position_ids".to_string(),
                create_position_ids(mask, model.class().position_ids_offset, cached_seq_len)?,
            );
        }
    }

    let batch_size = ["input_ids", "inputs_embeds", "attention_mask"]
        .iter()
        .find_map(|name| find(sources, name))
        .and_then(|t| t.dims().first().copied())
        .unwrap_or(1);
    let cache = model.cache().seed_cache(past_key_values, batch_size);

    let mut all: Vec<&dyn TensorLookup> = vec![&derived];
    all.extend_from_slice(sources);
    all.push(&*cache);
    run_session(session, &all).await
}

fn architecture_mismatch(expected: &str, model: &PreTrainedModel) -> GenerationError {
    GenerationError::Unsupported(format!(
        "{} forward called on {} ({:?})",
        expected,
        model.class().name,
        model.class().kind
    ))
}

pub async fn encoder_forward(model: &PreTrainedModel, inputs: &ModelInputs) -> Result<NamedTensors> {
    let Architecture::EncoderOnly {
        model: session,
        embed_tokens,
    } = model.architecture()
    else {
        return Err(architecture_mismatch("encoder", model));
    };
    run_encoder(session.as_ref(), embed_tokens.as_deref(), &[&inputs.tensors]).await
}

pub async fn decoder_forward(model: &PreTrainedModel, inputs: &ModelInputs) -> Result<NamedTensors> {
    let Architecture::DecoderOnly { model: session } = model.architecture() else {
        return Err(architecture_mismatch("decoder", model));
    };
    run_decoder(
        model,
        session.as_ref(),
        &[&inputs.tensors],
        inputs.past_key_values.as_ref(),
    )
    .await
}

/// Encoder once (reusing `encoder_outputs` when present), then one decoder
/// step fed with the decoder ids as `input_ids`.
pub async fn seq2seq_forward(model: &PreTrainedModel, inputs: &ModelInputs) -> Result<NamedTensors> {
    let Architecture::EncoderDecoder {
        encoder,
        decoder,
        embed_tokens,
    } = model.architecture()
    else {
        return Err(architecture_mismatch("encoder-decoder", model));
    };
    let tensors = &inputs.tensors;

    let computed;
    let encoder_hidden_states = match tensors.get("encoder_outputs") {
        Some(hidden) => hidden,
        None => {
            let mut outputs =
                run_encoder(encoder.as_ref(), embed_tokens.as_deref(), &[tensors]).await?;
            computed = take_output(&mut outputs, "last_hidden_state")?;
            &computed
        }
    };
    let decoder_input_ids =
        tensors
            .get("decoder_input_ids")
            .ok_or_else(|| GenerationError::MissingInputs {
                names: vec!["decoder_input_ids".to_string()],
            })?;

    let mut aliases = Feeds::new();
    aliases.push("input_ids", decoder_input_ids);
    aliases.push("encoder_hidden_states", encoder_hidden_states);
    if decoder.has_input("encoder_attention_mask") {
        if let Some(mask) = tensors.get("attention_mask") {
            aliases.push("encoder_attention_mask", mask);
        }
    }

    run_decoder(
        model,
        decoder.as_ref(),
        &[&aliases, tensors],
        inputs.past_key_values.as_ref(),
    )
    .await
}

/// Embeds the ids, fuses modality features on the prefill step and runs the
/// language decoder on `inputs_embeds`.
pub async fn multimodal_forward(
    model: &PreTrainedModel,
    inputs: &ModelInputs,
) -> Result<NamedTensors> {
    let Architecture::Multimodal {
        modality,
        embed_tokens: embed_session,
        modality_encoder,
        decoder,
    } = model.architecture()
    else {
        return Err(architecture_mismatch("multimodal", model));
    };
    let tensors = &inputs.tensors;
    let past_key_values = inputs.past_key_values.as_ref();
    let mut fused = NamedTensors::new();

    if !tensors.contains_key("inputs_embeds") {
        let input_ids = tensors
            .get("input_ids")
            .ok_or_else(|| GenerationError::MissingInputs {
                names: vec!["input_ids".to_string()],
            })?;
        let seq_len = input_ids.dim(1)?;
        let mut inputs_embeds = embed_tokens(embed_session.as_ref(), input_ids).await?;

        if tensors.contains_key(modality.features_input()) {
            if seq_len != 1 {
                let mut outputs = run_session(modality_encoder.as_ref(), &[tensors]).await?;
                let features = take_output(&mut outputs, modality.features_output())?;
                let token_id = modality.token_id(model.config()).ok_or_else(|| {
                    GenerationError::InvalidConfig(format!(
                        "`{}` is missing in the model configuration",
                        modality.token_config_key()
                    ))
                })?;
                inputs_embeds =
                    merge_modality_features(inputs_embeds, &features, input_ids, token_id, *modality)?;
            } else if let Some(past) = past_key_values {
                let mask = tensors
                    .get("attention_mask")
                    .ok_or_else(|| GenerationError::MissingInputs {
                        names: vec!["attention_mask".to_string()],
                    })?;
                let prefix = Tensor::ones(mask.dtype(), &[input_ids.dim(0)?, past.past_length()]);
                let tail = mask.slice_last(1, seq_len)?;
                fused.insert(
                    "attention_mask".to_string(),
                    Tensor::concat(&[&prefix, &tail], 1)?,
                );
            }
        }
        fused.insert("inputs_embeds".to_string(), inputs_embeds);
    }

    run_decoder(model, decoder.as_ref(), &[&fused, tensors], past_key_values).await
}

/// Writes feature rows into the embedding positions that hold the modality
/// token, in row-major order.
pub fn merge_modality_features(
    inputs_embeds: Tensor,
    features: &Tensor,
    input_ids: &Tensor,
    token_id: i64,
    modality: Modality,
) -> Result<Tensor> {
    let positions: Vec<(usize, usize)> = input_ids
        .to_rows_i64()?
        .iter()
        .enumerate()
        .flat_map(|(row, ids)| {
            ids.iter()
                .enumerate()
                .filter(|(_, &id)| id == token_id)
                .map(move |(col, _)| (row, col))
        })
        .collect();

    let hidden = inputs_embeds.dim(-1)?;
    let flat = features.to_f32()?;
    let n_features = if hidden == 0 { 0 } else { flat.len() / hidden };
    if positions.len() != n_features {
        return Err(GenerationError::ShapeMismatch(format!(
            "{} features and {} tokens do not match: tokens: {}, features {}",
            modality.label(),
            modality.label().to_lowercase(),
            positions.len(),
            n_features
        )));
    }
    let rows: Array2<f32> = flat.into_shape_with_order((n_features, hidden))?;

    let mut inputs_embeds = inputs_embeds;
    match inputs_embeds.dtype() {
        DataType::Float32 => {
            let mut embeds = inputs_embeds
                .as_array_mut::<f32>()?
                .view_mut()
                .into_dimensionality::<Ix3>()?;
            for (k, &(row, col)) in positions.iter().enumerate() {
                embeds.slice_mut(s![row, col, ..]).assign(&rows.row(k));
            }
        }
        DataType::Float16 => {
            let mut embeds = inputs_embeds
                .as_array_mut::<f16>()?
                .view_mut()
                .into_dimensionality::<Ix3>()?;
            for (k, &(row, col)) in positions.iter().enumerate() {
                embeds
                    .slice_mut(s![row, col, ..])
                    .assign(&rows.row(k).mapv(f16::from_f32));
            }
        }
        other => {
            return Err(GenerationError::DataType {
                expected: DataType::Float32,
                actual: other,
            })
        }
    }
    Ok(inputs_embeds)
}

/// Decoder-only and multimodal input preparation.
pub fn decoder_prepare_inputs(
    model: &PreTrainedModel,
    _sequences: &[Vec<i64>],
    mut inputs: ModelInputs,
    _config: &GenerationConfig,
) -> Result<ModelInputs> {
    let past_length = inputs.past_length();

    if !inputs.tensors.contains_key("attention_mask") {
        let dims = ["input_ids", "inputs_embeds", "position_ids"]
            .iter()
            .find_map(|name| inputs.get(name))
            .map(|t| t.dims().to_vec())
            .filter(|dims| dims.len() >= 2)
            .ok_or_else(|| {
                GenerationError::InvalidInput(
                    "attention_mask is not provided, and unable to infer its shape from model inputs."
                        .to_string(),
                )
            })?;
        inputs.insert(
            "attention_mask",
            Tensor::ones(DataType::Int64, &[dims[0], past_length + dims[1]]),
        );
    }

    if inputs.past_key_values.is_none() {
        return Ok(inputs);
    }
    let Some(input_ids) = inputs.get("input_ids") else {
        return Ok(inputs);
    };
    let input_len = input_ids.dim(1)?;
    let mask_len = inputs
        .get("attention_mask")
        .map(|m| m.dim(1))
        .transpose()?
        .unwrap_or(0);

    // A mask longer than the ids means only unprocessed tokens were carried
    if mask_len > input_len {
        return Ok(inputs);
    }
    if past_length < input_len {
        let trimmed = input_ids.slice_from(1, past_length)?;
        inputs.insert("input_ids", trimmed);
    } else if let Some(image_token) = model.config().image_token_id() {
        if input_ids.to_rows_i64()?.iter().flatten().any(|&id| id == image_token) {
            let num_image_tokens = model.config().num_image_tokens.ok_or_else(|| {
                GenerationError::InvalidConfig(
                    "`num_image_tokens` is missing in the model configuration.".to_string(),
                )
            })?;
            let batch = input_ids.dim(0)?;
            let num_new_tokens = (input_len + num_image_tokens).saturating_sub(past_length);
            let trimmed = input_ids.slice_last(1, num_new_tokens)?;
            inputs.insert("input_ids", trimmed);
            inputs.insert(
                "attention_mask",
                Tensor::ones(DataType::Int64, &[batch, past_length + num_new_tokens]),
            );
        }
    }
    Ok(inputs)
}

/// Encoder-decoder input preparation: the decoder sees the whole history on
/// the first step and only the last token once a cache exists.
pub fn encoder_decoder_prepare_inputs(
    _model: &PreTrainedModel,
    sequences: &[Vec<i64>],
    mut inputs: ModelInputs,
    config: &GenerationConfig,
) -> Result<ModelInputs> {
    let mut rows: Vec<Vec<i64>> = if inputs.past_key_values.is_some() {
        sequences
            .iter()
            .map(|ids| ids.last().map(|&id| vec![id]).unwrap_or_default())
            .collect()
    } else {
        sequences.to_vec()
    };
    if config.uses_guidance() {
        rows.extend_from_within(..);
    }
    inputs.insert("decoder_input_ids", Tensor::from_rows(&rows)?);
    Ok(inputs)
}

pub type ForwardFn =
    for<'a> fn(&'a PreTrainedModel, &'a ModelInputs) -> BoxFuture<'a, Result<NamedTensors>>;

pub type PrepareFn =
    fn(&PreTrainedModel, &[Vec<i64>], ModelInputs, &GenerationConfig) -> Result<ModelInputs>;

/// Forward and preparation entry points for one architecture family
#[derive(Clone, Copy)]
pub struct Dispatch {
    pub forward: ForwardFn,
    pub prepare_inputs: PrepareFn,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch").finish_non_exhaustive()
    }
}

fn boxed_encoder<'a>(m: &'a PreTrainedModel, i: &'a ModelInputs) -> BoxFuture<'a, Result<NamedTensors>> {
    Box::pin(encoder_forward(m, i))
}

fn boxed_decoder<'a>(m: &'a PreTrainedModel, i: &'a ModelInputs) -> BoxFuture<'a, Result<NamedTensors>> {
    Box::pin(decoder_forward(m, i))
}

fn boxed_seq2seq<'a>(m: &'a PreTrainedModel, i: &'a ModelInputs) -> BoxFuture<'a, Result<NamedTensors>> {
    Box::pin(seq2seq_forward(m, i))
}

fn boxed_multimodal<'a>(
    m: &'a PreTrainedModel,
    i: &'a ModelInputs,
) -> BoxFuture<'a, Result<NamedTensors>> {
    Box::pin(multimodal_forward(m, i))
}

impl Dispatch {
    pub fn for_kind(kind: ArchitectureKind) -> Self {
        match kind {
            ArchitectureKind::EncoderOnly => Self {
                forward: boxed_encoder,
                prepare_inputs: decoder_prepare_inputs,
            },
            ArchitectureKind::DecoderOnly => Self {
                forward: boxed_decoder,
                prepare_inputs: decoder_prepare_inputs,
            },
            ArchitectureKind::EncoderDecoder => Self {
                forward: boxed_seq2seq,
                prepare_inputs: encoder_decoder_prepare_inputs,
            },
            ArchitectureKind::ImageTextToText | ArchitectureKind::AudioTextToText => Self {
                forward: boxed_multimodal,
                prepare_inputs: decoder_prepare_inputs,
            },
        }
    }
}
