//! Generation configuration
//!
//! [`GenerationOptions`] is the sparse, deserialisable form used for every
//! layer (model `config.json`, stored `generation_config.json`, call-site
//! options). [`GenerationConfig::resolve`] folds the layers into one flat,
//! fully populated record.

use crate::error::{GenerationError, Result};
use crate::model_config::ModelConfig;
use log::warn;
use serde::{Deserialize, Serialize};

/// A single token id or a list of them (`eos_token_id: 2` or `[1, 2]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(i64),
    Many(Vec<i64>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<i64> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }

    pub fn first(&self) -> Option<i64> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Many(ids) => ids.first().copied(),
        }
    }
}

impl From<i64> for TokenIds {
    fn from(id: i64) -> Self {
        Self::Single(id)
    }
}

impl From<Vec<i64>> for TokenIds {
    fn from(ids: Vec<i64>) -> Self {
        Self::Many(ids)
    }
}

/// Corrections applied while normalising a config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `do_sample` with `temperature == 0` was turned into greedy decoding
    ZeroTemperatureSampling,
}

/// Defines `GenerationOptions` and `GenerationConfig` side by side.
///
/// `value` fields hold a concrete default in the config; `optional` fields
/// stay `Option` in both.
macro_rules! generation_fields {
    (
        value { $( $(#[$vmeta:meta])* $vname:ident : $vty:ty = $vdefault:expr ),* $(,)? }
        optional { $( $(#[$ometa:meta])* $oname:ident : $oty:ty ),* $(,)? }
    ) => {
        /// Sparse generation settings; `None` means "not set at this layer".
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct GenerationOptions {
            $( $(#[$vmeta])* #[serde(skip_serializing_if = "Option::is_none")] pub $vname: Option<$vty>, )*
            $( $(#[$ometa])* #[serde(skip_serializing_if = "Option::is_none")] pub $oname: Option<$oty>, )*
        }

        impl GenerationOptions {
            /// Copies every field set in `other` over `self`.
            pub fn overlay(&mut self, other: &GenerationOptions) {
                $( if other.$vname.is_some() { self.$vname = other.$vname.clone(); } )*
                $( if other.$oname.is_some() { self.$oname = other.$oname.clone(); } )*
            }
        }

        /// Fully resolved generation settings
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct GenerationConfig {
            $( $(#[$vmeta])* pub $vname: $vty, )*
            $( $(#[$ometa])* pub $oname: Option<$oty>, )*
        }

        impl Default for GenerationConfig {
            fn default() -> Self {
                Self {
                    $( $vname: $vdefault, )*
                    $( $oname: None, )*
                }
            }
        }

        impl GenerationConfig {
            /// Returns a copy with every field set in `options` applied.
            pub fn merged(mut self, options: &GenerationOptions) -> Self {
                $( if let Some(value) = &options.$vname { self.$vname = value.clone(); } )*
                $( if options.$oname.is_some() { self.$oname = options.$oname.clone(); } )*
                self
            }
        }
    };
}

generation_fields! {
    value {
        max_length: usize = 20,
        min_length: usize = 0,
        do_sample: bool = false,
        num_beams: usize = 1,
        temperature: f32 = 1.0,
        top_k: usize = 50,
        top_p: f32 = 1.0,
        repetition_penalty: f32 = 1.0,
        no_repeat_ngram_size: usize = 0,
        bad_words_ids: Vec<Vec<i64>> = Vec::new(),
        begin_suppress_tokens: Vec<i64> = Vec::new(),
        output_attentions: bool = false,
        return_dict_in_generate: bool = false,
    }
    optional {
        max_new_tokens: usize,
        min_new_tokens: usize,
        forced_bos_token_id: i64,
        forced_eos_token_id: TokenIds,
        /// Classifier-free guidance scale; active only when > 1
        guidance_scale: f32,
        eos_token_id: TokenIds,
        pad_token_id: i64,
        bos_token_id: i64,
        decoder_start_token_id: TokenIds,
        /// Seed for the multinomial sampler
        seed: u64,
    }
}

impl GenerationConfig {
    /// Model config defaults < stored generation config < call-site options.
    pub fn resolve(
        model_config: &ModelConfig,
        stored: Option<&GenerationOptions>,
        call: &GenerationOptions,
    ) -> Self {
        let mut config = Self::default().merged(&model_config.generation_defaults());
        if let Some(stored) = stored {
            config = config.merged(stored);
        }
        config.merged(call)
    }

    /// Applies degenerate-parameter corrections, reporting each one.
    pub fn normalized(mut self) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();
        if self.do_sample && self.temperature == 0.0 {
            warn!("temperature is 0 with do_sample enabled; falling back to greedy decoding");
            self.do_sample = false;
            warnings.push(ConfigWarning::ZeroTemperatureSampling);
        }
        (self, warnings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_beams > 1 {
            return Err(GenerationError::Unsupported(format!(
                "beam search (num_beams = {}) is not implemented",
                self.num_beams
            )));
        }
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(GenerationError::InvalidConfig(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.do_sample && !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GenerationError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(GenerationError::InvalidConfig(format!(
                "repetition_penalty must be strictly positive, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }

    /// `input_len + max_new_tokens` when set, otherwise `max_length`.
    pub fn effective_max_length(&self, input_len: usize) -> usize {
        match self.max_new_tokens {
            Some(new_tokens) => input_len + new_tokens,
            None => self.max_length,
        }
    }

    pub fn eos_token_ids(&self) -> Vec<i64> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    /// Token written into rows that finished early.
    pub fn fill_token_id(&self) -> Option<i64> {
        self.pad_token_id
            .or_else(|| self.eos_token_id.as_ref().and_then(TokenIds::first))
    }

    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale.map(|scale| scale > 1.0).unwrap_or(false)
    }
}
