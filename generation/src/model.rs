//! Pre-trained model: sessions, configuration and resolved dispatch

use crate::cache::{CacheLayout, CacheManager};
use crate::config::{GenerationConfig, GenerationOptions};
use crate::error::{GenerationError, Result};
use crate::forward::{Dispatch, ModelInputs};
use crate::model_config::ModelConfig;
use crate::registry::{ArchitectureKind, ModelClass, ModelRegistry};
use crate::session::InferenceSession;
use crate::tensor::NamedTensors;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type SharedSession = Arc<dyn InferenceSession>;

/// Session keys
pub const MODEL: &str = "model";
pub const DECODER_MODEL_MERGED: &str = "decoder_model_merged";
pub const EMBED_TOKENS: &str = "embed_tokens";
pub const VISION_ENCODER: &str = "vision_encoder";
pub const AUDIO_ENCODER: &str = "audio_encoder";

/// Non-text input fused into the token embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Image,
    Audio,
}

impl Modality {
    /// Model input carrying the raw modality data
    pub fn features_input(self) -> &'static str {
        match self {
            Self::Image => "pixel_values",
            Self::Audio => "input_features",
        }
    }

    /// Modality encoder output holding one feature row per placeholder token
    pub fn features_output(self) -> &'static str {
        match self {
            Self::Image => "image_features",
            Self::Audio => "audio_features",
        }
    }

    pub fn token_id(self, config: &ModelConfig) -> Option<i64> {
        match self {
            Self::Image => config.image_token_id(),
            Self::Audio => config.audio_token_id(),
        }
    }

    pub fn token_config_key(self) -> &'static str {
        match self {
            Self::Image => "image_token_index",
            Self::Audio => "audio_token_index",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "Image",
            Self::Audio => "Audio",
        }
    }

    pub fn encoder_session_key(self) -> &'static str {
        match self {
            Self::Image => VISION_ENCODER,
            Self::Audio => AUDIO_ENCODER,
        }
    }
}

/// Sessions of a model, by architecture family
pub enum Architecture {
    EncoderOnly {
        model: SharedSession,
        embed_tokens: Option<SharedSession>,
    },
    DecoderOnly {
        model: SharedSession,
    },
    EncoderDecoder {
        encoder: SharedSession,
        decoder: SharedSession,
        embed_tokens: Option<SharedSession>,
    },
    Multimodal {
        modality: Modality,
        embed_tokens: SharedSession,
        modality_encoder: SharedSession,
        decoder: SharedSession,
    },
}

impl fmt::Debug for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncoderOnly { embed_tokens, .. } => f
                .debug_struct("EncoderOnly")
                .field("embed_tokens", &embed_tokens.is_some())
                .finish_non_exhaustive(),
            Self::DecoderOnly { .. } => f.debug_struct("DecoderOnly").finish_non_exhaustive(),
            Self::EncoderDecoder { embed_tokens, .. } => f
                .debug_struct("EncoderDecoder")
                .field("embed_tokens", &embed_tokens.is_some())
                .finish_non_exhaustive(),
            Self::Multimodal { modality, .. } => f
                .debug_struct("Multimodal")
                .field("modality", modality)
                .finish_non_exhaustive(),
        }
    }
}

/// `(session key, file stem, required)` for every graph of a family
pub fn session_files(kind: ArchitectureKind) -> &'static [(&'static str, &'static str, bool)] {
    match kind {
        ArchitectureKind::EncoderOnly => &[(MODEL, "model", true), (EMBED_TOKENS, "embed_tokens", false)],
        ArchitectureKind::DecoderOnly => &[(MODEL, "model", true)],
        ArchitectureKind::EncoderDecoder => &[
            (MODEL, "encoder_model", true),
            (DECODER_MODEL_MERGED, "decoder_model_merged", true),
            (EMBED_TOKENS, "embed_tokens", false),
        ],
        ArchitectureKind::ImageTextToText => &[
            (EMBED_TOKENS, "embed_tokens", true),
            (VISION_ENCODER, "vision_encoder", true),
            (DECODER_MODEL_MERGED, "decoder_model_merged", true),
        ],
        ArchitectureKind::AudioTextToText => &[
            (EMBED_TOKENS, "embed_tokens", true),
            (AUDIO_ENCODER, "audio_encoder", true),
            (DECODER_MODEL_MERGED, "decoder_model_merged", true),
        ],
    }
}

impl Architecture {
    /// Assembles the architecture from sessions keyed as in [`session_files`].
    pub fn from_sessions(
        kind: ArchitectureKind,
        mut sessions: HashMap<String, SharedSession>,
    ) -> Result<Self> {
        let mut take = |key: &str| -> Result<SharedSession> {
            sessions.remove(key).ok_or_else(|| {
                GenerationError::InvalidConfig(format!(
                    "{:?} models need a `{}` session",
                    kind, key
                ))
            })
        };
        let architecture = match kind {
            ArchitectureKind::EncoderOnly => Self::EncoderOnly {
                model: take(MODEL)?,
                embed_tokens: take(EMBED_TOKENS).ok(),
            },
            ArchitectureKind::DecoderOnly => Self::DecoderOnly {
                model: take(MODEL)?,
            },
            ArchitectureKind::EncoderDecoder => Self::EncoderDecoder {
                encoder: take(MODEL)?,
                decoder: take(DECODER_MODEL_MERGED)?,
                embed_tokens: take(EMBED_TOKENS).ok(),
            },
            ArchitectureKind::ImageTextToText | ArchitectureKind::AudioTextToText => {
                let modality = if kind == ArchitectureKind::ImageTextToText {
                    Modality::Image
                } else {
                    Modality::Audio
                };
                Self::Multimodal {
                    modality,
                    embed_tokens: take(EMBED_TOKENS)?,
                    modality_encoder: take(modality.encoder_session_key())?,
                    decoder: take(DECODER_MODEL_MERGED)?,
                }
            }
        };
        if !sessions.is_empty() {
            debug!(
                "unused sessions for {:?}: {:?}",
                kind,
                sessions.keys().collect::<Vec<_>>()
            );
        }
        Ok(architecture)
    }

    pub fn matches(&self, kind: ArchitectureKind) -> bool {
        matches!(
            (self, kind),
            (Self::EncoderOnly { .. }, ArchitectureKind::EncoderOnly)
                | (Self::DecoderOnly { .. }, ArchitectureKind::DecoderOnly)
                | (Self::EncoderDecoder { .. }, ArchitectureKind::EncoderDecoder)
                | (
                    Self::Multimodal {
                        modality: Modality::Image,
                        ..
                    },
                    ArchitectureKind::ImageTextToText
                )
                | (
                    Self::Multimodal {
                        modality: Modality::Audio,
                        ..
                    },
                    ArchitectureKind::AudioTextToText
                )
        )
    }

    /// Session producing logits and cache outputs
    pub fn decoder_session(&self) -> &dyn InferenceSession {
        match self {
            Self::EncoderOnly { model, .. } | Self::DecoderOnly { model } => model.as_ref(),
            Self::EncoderDecoder { decoder, .. } | Self::Multimodal { decoder, .. } => {
                decoder.as_ref()
            }
        }
    }

    /// Session producing `encoder_outputs`, for encoder-decoder models
    pub fn encoder_session(&self) -> Option<&dyn InferenceSession> {
        match self {
            Self::EncoderDecoder { encoder, .. } => Some(encoder.as_ref()),
            _ => None,
        }
    }
}

pub struct PreTrainedModel {
    class: ModelClass,
    config: ModelConfig,
    generation_config: Option<GenerationOptions>,
    architecture: Architecture,
    dispatch: Dispatch,
    cache: CacheManager,
    registry: Arc<ModelRegistry>,
}

impl fmt::Debug for PreTrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreTrainedModel")
            .field("class", &self.class.name)
            .field("model_type", &self.config.model_type)
            .field("architecture", &self.architecture)
            .finish_non_exhaustive()
    }
}

impl PreTrainedModel {
    pub fn new(
        registry: Arc<ModelRegistry>,
        class: ModelClass,
        config: ModelConfig,
        architecture: Architecture,
    ) -> Result<Self> {
        if !architecture.matches(class.kind) {
            return Err(GenerationError::InvalidConfig(format!(
                "{} is a {:?} model but was given {:?} sessions",
                class.name, class.kind, architecture
            )));
        }
        let layout = CacheLayout::from_config(&config, class.kind)?;
        debug!(
            "{} ({:?}): {} cache slots",
            class.name,
            class.kind,
            layout.slots().len()
        );
        Ok(Self {
            dispatch: Dispatch::for_kind(class.kind),
            cache: CacheManager::new(layout),
            class,
            config,
            generation_config: None,
            architecture,
            registry,
        })
    }

    /// Resolves the class from `config` and assembles its sessions.
    pub fn from_sessions(
        registry: Arc<ModelRegistry>,
        config: ModelConfig,
        sessions: HashMap<String, SharedSession>,
    ) -> Result<Self> {
        let class = registry
            .resolve(&config.architectures, &config.model_type)?
            .clone();
        let architecture = Architecture::from_sessions(class.kind, sessions)?;
        Self::new(registry, class, config, architecture)
    }

    /// Stored defaults (`generation_config.json`).
    pub fn with_generation_config(mut self, options: GenerationOptions) -> Self {
        self.generation_config = Some(options);
        self
    }

    pub fn class(&self) -> &ModelClass {
        &self.class
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn generation_config(&self) -> Option<&GenerationOptions> {
        self.generation_config.as_ref()
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn ensure_can_generate(&self) -> Result<()> {
        self.registry.ensure_can_generate(&self.class)
    }

    /// One forward step through the family's dispatch.
    pub async fn forward(&self, inputs: &ModelInputs) -> Result<NamedTensors> {
        (self.dispatch.forward)(self, inputs).await
    }

    pub fn prepare_inputs_for_generation(
        &self,
        sequences: &[Vec<i64>],
        inputs: ModelInputs,
        config: &GenerationConfig,
    ) -> Result<ModelInputs> {
        (self.dispatch.prepare_inputs)(self, sequences, inputs, config)
    }

    /// Hands every device-resident output back to the decoder session.
    pub fn release_outputs(&self, outputs: NamedTensors) {
        let session = self.architecture.decoder_session();
        for (_, tensor) in outputs {
            crate::cache::release_if_device(session, tensor);
        }
    }
}
