//! Model configuration (`config.json`)
//!
//! Exported configs name the same quantity differently across families
//! (`num_hidden_layers`, `n_layer`, `num_layers`, ...). Every spelling is kept
//! as its own optional field and the accessors below pick the first one set.

use crate::config::GenerationOptions;
use crate::error::{GenerationError, Result};
use crate::tensor::DataType;
use serde::{Deserialize, Deserializer, Serialize};

/// Attention geometry of one side of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub model_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub architectures: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_encoder_decoder: bool,

    // Layer counts
    pub num_hidden_layers: Option<usize>,
    pub n_layer: Option<usize>,
    pub num_layers: Option<usize>,
    pub num_decoder_layers: Option<usize>,
    pub decoder_layers: Option<usize>,
    pub encoder_layers: Option<usize>,

    // Heads
    pub num_attention_heads: Option<usize>,
    pub n_head: Option<usize>,
    pub num_heads: Option<usize>,
    pub num_key_value_heads: Option<usize>,
    pub decoder_attention_heads: Option<usize>,
    pub encoder_attention_heads: Option<usize>,

    // Widths
    pub hidden_size: Option<usize>,
    pub n_embd: Option<usize>,
    pub d_model: Option<usize>,
    pub head_dim: Option<usize>,
    pub d_kv: Option<usize>,

    // Context
    pub max_position_embeddings: Option<usize>,
    pub n_positions: Option<usize>,
    pub max_target_positions: Option<usize>,
    pub vocab_size: Option<usize>,

    // Hybrid recurrent/convolutional layers
    pub layer_types: Option<Vec<String>>,
    #[serde(rename = "conv_L_cache")]
    pub conv_l_cache: Option<usize>,
    pub mamba_n_heads: Option<usize>,
    pub mamba_d_head: Option<usize>,
    pub mamba_d_state: Option<usize>,
    pub ssm_num_heads: Option<usize>,
    pub ssm_head_dim: Option<usize>,
    pub ssm_state_size: Option<usize>,

    // Multimodal
    pub image_token_index: Option<i64>,
    pub image_token_id: Option<i64>,
    pub audio_token_index: Option<i64>,
    pub audio_token_id: Option<i64>,
    pub num_image_tokens: Option<usize>,

    pub num_codebooks: Option<usize>,
    pub kv_cache_dtype: Option<DataType>,

    // Nested sections
    pub text_config: Option<Box<ModelConfig>>,
    pub decoder: Option<Box<ModelConfig>>,
    pub generator: Option<Box<ModelConfig>>,

    /// Generation-related keys found at this level (`eos_token_id`, ...)
    #[serde(flatten)]
    pub generation: GenerationOptions,
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Generation defaults carried by the model config.
    ///
    /// Keys inside `decoder`, `generator` and `text_config` override the
    /// top level, in that order.
    pub fn generation_defaults(&self) -> GenerationOptions {
        let mut options = self.generation.clone();
        for nested in [&self.decoder, &self.generator, &self.text_config]
            .into_iter()
            .flatten()
        {
            options.overlay(&nested.generation_defaults());
        }
        options
    }

    /// Section describing the language model (the nested text/decoder config
    /// for composite models, otherwise `self`).
    pub fn language_model(&self) -> &ModelConfig {
        self.text_config
            .as_deref()
            .or(self.decoder.as_deref())
            .unwrap_or(self)
    }

    pub fn hidden_size(&self) -> Option<usize> {
        self.hidden_size.or(self.n_embd).or(self.d_model)
    }

    pub fn max_position_embeddings(&self) -> Option<usize> {
        let lm = self.language_model();
        lm.max_position_embeddings
            .or(lm.n_positions)
            .or(lm.max_target_positions)
            .or(self.max_position_embeddings)
            .or(self.n_positions)
            .or(self.max_target_positions)
    }

    pub fn image_token_id(&self) -> Option<i64> {
        self.image_token_index.or(self.image_token_id)
    }

    pub fn audio_token_id(&self) -> Option<i64> {
        self.audio_token_index.or(self.audio_token_id)
    }

    pub fn num_codebooks(&self) -> Option<usize> {
        self.num_codebooks
            .or_else(|| self.decoder.as_ref().and_then(|d| d.num_codebooks))
    }

    pub fn cache_dtype(&self) -> DataType {
        self.kv_cache_dtype.unwrap_or(DataType::Float32)
    }

    /// Cache geometry for decoder-only models.
    pub fn decoder_only_dims(&self) -> Result<AttentionDims> {
        let lm = self.language_model();
        let num_layers = lm
            .num_hidden_layers
            .or(lm.n_layer)
            .or(lm.num_layers)
            .ok_or_else(|| missing(&lm.model_type, "num_hidden_layers"))?;
        let attention_heads = lm
            .num_attention_heads
            .or(lm.n_head)
            .or(lm.num_heads)
            .ok_or_else(|| missing(&lm.model_type, "num_attention_heads"))?;
        let attention_heads = nonzero(&lm.model_type, "num_attention_heads", attention_heads)?;
        let num_heads = nonzero(
            &lm.model_type,
            "num_key_value_heads",
            lm.num_key_value_heads.unwrap_or(attention_heads),
        )?;
        let head_dim = match lm.head_dim {
            Some(dim) => dim,
            None => {
                lm.hidden_size()
                    .ok_or_else(|| missing(&lm.model_type, "hidden_size"))?
                    / attention_heads
            }
        };
        Ok(AttentionDims {
            num_layers,
            num_heads,
            head_dim,
        })
    }

    /// Self-attention cache geometry of an encoder-decoder's decoder.
    pub fn decoder_dims(&self) -> Result<AttentionDims> {
        let num_layers = self
            .decoder_layers
            .or(self.num_decoder_layers)
            .or(self.num_layers)
            .or(self.num_hidden_layers)
            .or(self.n_layer)
            .ok_or_else(|| missing(&self.model_type, "decoder_layers"))?;
        let num_heads = self
            .decoder_attention_heads
            .or(self.num_heads)
            .or(self.num_attention_heads)
            .or(self.n_head)
            .ok_or_else(|| missing(&self.model_type, "decoder_attention_heads"))?;
        let head_dim = self.seq2seq_head_dim(num_heads)?;
        Ok(AttentionDims {
            num_layers,
            num_heads,
            head_dim,
        })
    }

    /// Cross-attention cache geometry (one entry per decoder layer).
    pub fn encoder_dims(&self) -> Result<AttentionDims> {
        let num_layers = self.decoder_dims()?.num_layers;
        let num_heads = self
            .encoder_attention_heads
            .or(self.num_heads)
            .or(self.num_attention_heads)
            .or(self.n_head)
            .ok_or_else(|| missing(&self.model_type, "encoder_attention_heads"))?;
        let head_dim = self.seq2seq_head_dim(num_heads)?;
        Ok(AttentionDims {
            num_layers,
            num_heads,
            head_dim,
        })
    }

    fn seq2seq_head_dim(&self, num_heads: usize) -> Result<usize> {
        let num_heads = nonzero(&self.model_type, "num_heads", num_heads)?;
        if let Some(dim) = self.d_kv.or(self.head_dim) {
            return Ok(dim);
        }
        let width = self
            .hidden_size()
            .ok_or_else(|| missing(&self.model_type, "d_model"))?;
        Ok(width / num_heads)
    }

    /// Per-layer types for hybrid models (`"full_attention"`, `"conv"`, ...).
    pub fn layer_types(&self) -> Option<&[String]> {
        self.language_model().layer_types.as_deref()
    }

    pub fn conv_l_cache(&self) -> Option<usize> {
        self.language_model().conv_l_cache
    }

    /// `(num_heads, head_dim, state_size)` of recurrent layers.
    pub fn ssm_dims(&self) -> Result<(usize, usize, usize)> {
        let lm = self.language_model();
        let heads = lm
            .ssm_num_heads
            .or(lm.mamba_n_heads)
            .ok_or_else(|| missing(&lm.model_type, "mamba_n_heads"))?;
        let head_dim = lm
            .ssm_head_dim
            .or(lm.mamba_d_head)
            .ok_or_else(|| missing(&lm.model_type, "mamba_d_head"))?;
        let state = lm
            .ssm_state_size
            .or(lm.mamba_d_state)
            .ok_or_else(|| missing(&lm.model_type, "mamba_d_state"))?;
        Ok((heads, head_dim, state))
    }
}

/// `null` reads as the field's default (older full-dump configs write
/// `"architectures": null` in nested sections).
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn nonzero(model_type: &str, field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(GenerationError::InvalidConfig(format!(
            "config for model type `{}` has `{}` = 0",
            model_type, field
        )));
    }
    Ok(value)
}

fn missing(model_type: &str, field: &str) -> GenerationError {
    GenerationError::InvalidConfig(format!(
        "config for model type `{}` is missing `{}`",
        model_type, field
    ))
}
