//! Model class registry
//!
//! Maps a `model_type` to the concrete model classes that can be built for
//! it, their architecture family and whether they carry a language-model
//! head. The registry is an explicit value passed to model construction.

use crate::error::{GenerationError, Result};
use std::collections::HashMap;

/// Architecture family, which selects the forward and input-preparation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchitectureKind {
    EncoderOnly,
    DecoderOnly,
    EncoderDecoder,
    ImageTextToText,
    AudioTextToText,
}

impl ArchitectureKind {
    pub fn is_encoder_decoder(self) -> bool {
        self == Self::EncoderDecoder
    }

    /// Families that keep a growing decoder-side attention mask.
    pub fn is_decoder_only(self) -> bool {
        matches!(
            self,
            Self::DecoderOnly | Self::ImageTextToText | Self::AudioTextToText
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelClass {
    pub name: &'static str,
    pub model_type: &'static str,
    pub kind: ArchitectureKind,
    pub can_generate: bool,
    /// Name of the primary model input
    pub main_input_name: &'static str,
    /// Start value of derived position ids (0 or 1)
    pub position_ids_offset: i64,
}

const fn class(
    name: &'static str,
    model_type: &'static str,
    kind: ArchitectureKind,
    can_generate: bool,
) -> ModelClass {
    ModelClass {
        name,
        model_type,
        kind,
        can_generate,
        main_input_name: "input_ids",
        position_ids_offset: 0,
    }
}

const fn with_main_input(mut class: ModelClass, main_input_name: &'static str) -> ModelClass {
    class.main_input_name = main_input_name;
    class
}

const fn with_position_offset(mut class: ModelClass, offset: i64) -> ModelClass {
    class.position_ids_offset = offset;
    class
}

use ArchitectureKind::*;

/// Built-in classes. The first entry per `model_type` with a head is the
/// default generation class.
const BUILTIN_CLASSES: &[ModelClass] = &[
    class("BertModel", "bert", EncoderOnly, false),
    class("GPT2Model", "gpt2", DecoderOnly, false),
    class("GPT2LMHeadModel", "gpt2", DecoderOnly, true),
    class("LlamaModel", "llama", DecoderOnly, false),
    class("LlamaForCausalLM", "llama", DecoderOnly, true),
    class("MistralForCausalLM", "mistral", DecoderOnly, true),
    class("Phi3ForCausalLM", "phi3", DecoderOnly, true),
    class("Qwen2Model", "qwen2", DecoderOnly, false),
    class("Qwen2ForCausalLM", "qwen2", DecoderOnly, true),
    with_position_offset(class("Gemma3ForCausalLM", "gemma3_text", DecoderOnly, true), 1),
    class("Lfm2ForCausalLM", "lfm2", DecoderOnly, true),
    class("GraniteMoeHybridForCausalLM", "granitemoehybrid", DecoderOnly, true),
    class("T5Model", "t5", EncoderDecoder, false),
    class("T5ForConditionalGeneration", "t5", EncoderDecoder, true),
    class("BartForConditionalGeneration", "bart", EncoderDecoder, true),
    with_main_input(
        class("WhisperForConditionalGeneration", "whisper", EncoderDecoder, true),
        "input_features",
    ),
    with_main_input(
        class("VisionEncoderDecoderModel", "vision-encoder-decoder", EncoderDecoder, true),
        "pixel_values",
    ),
    class("MusicgenForConditionalGeneration", "musicgen", EncoderDecoder, true),
    class("LlavaForConditionalGeneration", "llava", ImageTextToText, true),
    with_position_offset(
        class("PaliGemmaForConditionalGeneration", "paligemma", ImageTextToText, true),
        1,
    ),
    with_position_offset(
        class("Gemma3ForConditionalGeneration", "gemma3", ImageTextToText, true),
        1,
    ),
    class("UltravoxModel", "ultravox", AudioTextToText, true),
    with_main_input(class("ViTModel", "vit", EncoderOnly, false), "pixel_values"),
];

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    classes: HashMap<String, ModelClass>,
    by_model_type: HashMap<String, Vec<String>>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            classes: HashMap::new(),
            by_model_type: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        BUILTIN_CLASSES
            .iter()
            .cloned()
            .fold(Self::empty(), |registry, class| registry.with_class(class))
    }

    pub fn with_class(mut self, class: ModelClass) -> Self {
        let names = self
            .by_model_type
            .entry(class.model_type.to_string())
            .or_default();
        if !names.iter().any(|n| n == class.name) {
            names.push(class.name.to_string());
        }
        self.classes.insert(class.name.to_string(), class);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelClass> {
        self.classes.get(name)
    }

    /// Classes registered for `model_type` that can generate, in
    /// registration order.
    pub fn generation_classes_for(&self, model_type: &str) -> Vec<&ModelClass> {
        self.by_model_type
            .get(model_type)
            .into_iter()
            .flatten()
            .filter_map(|name| self.classes.get(name))
            .filter(|class| class.can_generate)
            .collect()
    }

    /// Picks the class for a config: an explicit `architectures` entry when
    /// registered, otherwise the first generation class for `model_type`.
    pub fn resolve(&self, architectures: &[String], model_type: &str) -> Result<&ModelClass> {
        if let Some(class) = architectures.iter().find_map(|name| self.get(name)) {
            return Ok(class);
        }
        self.generation_classes_for(model_type)
            .into_iter()
            .next()
            .or_else(|| {
                self.by_model_type
                    .get(model_type)
                    .and_then(|names| names.first())
                    .and_then(|name| self.get(name))
            })
            .ok_or_else(|| {
                GenerationError::Unsupported(format!(
                    "no model class registered for model type `{}`",
                    model_type
                ))
            })
    }

    /// Fails with `NoLanguageModelHead` unless `class` can generate.
    pub fn ensure_can_generate(&self, class: &ModelClass) -> Result<()> {
        if class.can_generate {
            return Ok(());
        }
        Err(GenerationError::NoLanguageModelHead {
            class_name: class.name.to_string(),
            alternatives: self
                .generation_classes_for(class.model_type)
                .into_iter()
                .map(|c| c.name.to_string())
                .collect(),
        })
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
