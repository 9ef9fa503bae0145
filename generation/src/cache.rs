//! Key/value cache management
//!
//! Step outputs named `present*` become the next step's `past*` inputs. The
//! manager owns the rename rules, the zero-seeded initial cache layout and the
//! release of superseded device buffers.

use crate::error::Result;
use crate::model_config::ModelConfig;
use crate::registry::ArchitectureKind;
use crate::session::InferenceSession;
use crate::tensor::{DataType, NamedTensors, Tensor};
use log::{debug, trace};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Output prefix to cache prefix, most specific first.
const RENAMES: &[(&str, &str)] = &[
    ("present_conv", "past_conv"),
    ("present_ssm", "past_ssm"),
    ("present", "past_key_values"),
];

/// Cache name for a step output, if the output is a cache tensor.
pub fn past_name(output_name: &str) -> Option<String> {
    RENAMES.iter().find_map(|(from, to)| {
        output_name
            .strip_prefix(from)
            .map(|rest| format!("{}{}", to, rest))
    })
}

fn is_encoder_slot(name: &str) -> bool {
    name.contains("encoder")
}

/// Cache tensors carried between steps, keyed by input name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheBundle {
    entries: BTreeMap<String, Tensor>,
}

impl CacheBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.entries.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence length already cached: dimension -2 of the first decoder
    /// attention entry, or 0 when there is none.
    pub fn past_length(&self) -> usize {
        self.entries
            .iter()
            .find(|(name, _)| name.starts_with("past_key_values.") && !is_encoder_slot(name))
            .and_then(|(_, tensor)| tensor.dim(-2).ok())
            .unwrap_or(0)
    }
}

impl IntoIterator for CacheBundle {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// One zero-initialised cache input; `dims` excludes the batch axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: DataType,
}

/// Every cache input a model expects on its first step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLayout {
    slots: Vec<CacheSlot>,
}

impl CacheLayout {
    pub fn from_config(config: &ModelConfig, kind: ArchitectureKind) -> Result<Self> {
        let dtype = config.cache_dtype();
        let mut slots = Vec::new();
        let mut push_kv = |prefix: String, heads: usize, head_dim: usize| {
            for part in ["key", "value"] {
                slots.push(CacheSlot {
                    name: format!("{}.{}", prefix, part),
                    dims: vec![heads, 0, head_dim],
                    dtype,
                });
            }
        };

        match kind {
            ArchitectureKind::EncoderOnly => {}
            ArchitectureKind::EncoderDecoder => {
                let decoder = config.decoder_dims()?;
                let encoder = config.encoder_dims()?;
                for i in 0..decoder.num_layers {
                    push_kv(
                        format!("past_key_values.{}.encoder", i),
                        encoder.num_heads,
                        encoder.head_dim,
                    );
                    push_kv(
                        format!("past_key_values.{}.decoder", i),
                        decoder.num_heads,
                        decoder.head_dim,
                    );
                }
            }
            _ => match config.layer_types() {
                Some(layer_types) => return Self::hybrid(config, layer_types, dtype),
                None => {
                    let dims = config.decoder_only_dims()?;
                    for i in 0..dims.num_layers {
                        push_kv(format!("past_key_values.{}", i), dims.num_heads, dims.head_dim);
                    }
                }
            },
        }
        Ok(Self { slots })
    }

    fn hybrid(config: &ModelConfig, layer_types: &[String], dtype: DataType) -> Result<Self> {
        let mut slots = Vec::new();
        for (i, layer_type) in layer_types.iter().enumerate() {
            match layer_type.as_str() {
                "conv" => {
                    let hidden = config.language_model().hidden_size().unwrap_or(0);
                    let width = config.conv_l_cache().unwrap_or(0);
                    slots.push(CacheSlot {
                        name: format!("past_conv.{}", i),
                        dims: vec![hidden, width],
                        dtype,
                    });
                }
                "mamba" | "ssm" | "linear_attention" => {
                    let (heads, head_dim, state) = config.ssm_dims()?;
                    slots.push(CacheSlot {
                        name: format!("past_ssm.{}", i),
                        dims: vec![heads, head_dim, state],
                        dtype,
                    });
                }
                _ => {
                    let dims = config.decoder_only_dims()?;
                    for part in ["key", "value"] {
                        slots.push(CacheSlot {
                            name: format!("past_key_values.{}.{}", i, part),
                            dims: vec![dims.num_heads, 0, dims.head_dim],
                            dtype,
                        });
                    }
                }
            }
        }
        Ok(Self { slots })
    }

    pub fn with_slots(slots: Vec<CacheSlot>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[CacheSlot] {
        &self.slots
    }

    /// Zero tensors for every slot at the given batch size.
    pub fn zeros(&self, batch_size: usize) -> CacheBundle {
        let mut bundle = CacheBundle::new();
        for slot in &self.slots {
            let mut shape = Vec::with_capacity(slot.dims.len() + 1);
            shape.push(batch_size);
            shape.extend_from_slice(&slot.dims);
            bundle.insert(slot.name.clone(), Tensor::zeros(slot.dtype, &shape));
        }
        bundle
    }
}

/// Releases `tensor` through `session` when it lives on the device.
pub fn release_if_device(session: &dyn InferenceSession, tensor: Tensor) {
    if tensor.is_device() {
        session.release(tensor);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheManager {
    layout: CacheLayout,
}

impl CacheManager {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Moves every cache output out of `outputs` into a new bundle.
    ///
    /// Encoder slots keep the previous tensor when a previous cache exists;
    /// the fresh placeholder and every superseded previous tensor are
    /// released through `session`.
    pub fn extract_cache(
        &self,
        outputs: &mut NamedTensors,
        previous: Option<CacheBundle>,
        session: &dyn InferenceSession,
    ) -> CacheBundle {
        let mut previous = previous.unwrap_or_default();
        let reuse_encoder = !previous.is_empty();

        let mut cache_outputs: Vec<(String, String)> = outputs
            .keys()
            .filter_map(|name| past_name(name).map(|past| (name.clone(), past)))
            .collect();
        cache_outputs.sort();

        let mut bundle = CacheBundle::new();
        for (output_name, name) in cache_outputs {
            let Some(fresh) = outputs.remove(&output_name) else {
                continue;
            };
            if reuse_encoder && is_encoder_slot(&name) {
                if let Some(kept) = previous.remove(&name) {
                    release_if_device(session, fresh);
                    bundle.insert(name, kept);
                    continue;
                }
            }
            if let Some(stale) = previous.remove(&name) {
                release_if_device(session, stale);
            }
            bundle.insert(name, fresh);
        }

        // Previous entries the step did not re-emit are orphaned
        for (name, stale) in previous {
            trace!("dropping cache entry {} with no successor", name);
            release_if_device(session, stale);
        }

        debug!(
            "cache updated: {} entries, past length {}",
            bundle.len(),
            bundle.past_length()
        );
        bundle
    }

    /// Releases every entry, encoder slots included.
    pub fn flush(&self, bundle: CacheBundle, session: &dyn InferenceSession) {
        for (_, tensor) in bundle {
            release_if_device(session, tensor);
        }
    }

    /// The bundle to feed this step: the existing cache, or zeros from the
    /// layout when there is none.
    pub fn seed_cache<'a>(
        &self,
        cache: Option<&'a CacheBundle>,
        batch_size: usize,
    ) -> Cow<'a, CacheBundle> {
        match cache {
            Some(bundle) => Cow::Borrowed(bundle),
            None => Cow::Owned(self.layout.zeros(batch_size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::session::Feeds;
    use crate::tensor::Location;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSession {
        released: AtomicUsize,
    }

    #[async_trait]
    impl InferenceSession for CountingSession {
        fn input_names(&self) -> &[String] {
            &[]
        }

        fn output_names(&self) -> &[String] {
            &[]
        }

        async fn run(&self, _feeds: &Feeds<'_>) -> Result<NamedTensors> {
            Ok(NamedTensors::new())
        }

        fn release(&self, _tensor: Tensor) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn device(shape: &[usize]) -> Tensor {
        Tensor::zeros(DataType::Float32, shape).with_location(Location::Device)
    }

    #[test]
    fn test_rename_table_order() {
        assert_eq!(past_name("present.0.key").as_deref(), Some("past_key_values.0.key"));
        assert_eq!(past_name("present_conv.3").as_deref(), Some("past_conv.3"));
        assert_eq!(past_name("present_ssm.1").as_deref(), Some("past_ssm.1"));
        assert_eq!(
            past_name("present.2.encoder.value").as_deref(),
            Some("past_key_values.2.encoder.value")
        );
        assert_eq!(past_name("logits"), None);
    }

    #[test]
    fn test_extract_releases_superseded_and_reuses_encoder() {
        let session = CountingSession::default();
        let manager = CacheManager::default();

        let mut first = NamedTensors::new();
        first.insert("logits".into(), Tensor::zeros(DataType::Float32, &[1, 1, 4]));
        first.insert("present.0.decoder.key".into(), device(&[1, 2, 1, 4]));
        first.insert("present.0.encoder.key".into(), device(&[1, 2, 7, 4]));
        let bundle = manager.extract_cache(&mut first, None, &session);
        assert_eq!(bundle.len(), 2);
        assert!(first.contains_key("logits"));
        assert_eq!(session.released.load(Ordering::SeqCst), 0);

        let mut second = NamedTensors::new();
        second.insert("present.0.decoder.key".into(), device(&[1, 2, 2, 4]));
        second.insert("present.0.encoder.key".into(), device(&[1, 2, 0, 4]));
        let bundle = manager.extract_cache(&mut second, Some(bundle), &session);

        // stale decoder entry + unused encoder placeholder
        assert_eq!(session.released.load(Ordering::SeqCst), 2);
        assert_eq!(bundle.get("past_key_values.0.encoder.key").unwrap().dims(), &[1, 2, 7, 4]);
        assert_eq!(bundle.past_length(), 2);

        manager.flush(bundle, &session);
        assert_eq!(session.released.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_host_tensors_are_not_released() {
        let session = CountingSession::default();
        let manager = CacheManager::default();
        let mut outputs = NamedTensors::new();
        outputs.insert("present.0.key".into(), Tensor::zeros(DataType::Float32, &[1, 1, 3, 2]));
        let bundle = manager.extract_cache(&mut outputs, None, &session);
        manager.flush(bundle, &session);
        assert_eq!(session.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decoder_only_layout() {
        let config = ModelConfig::from_json(
            r#"{ "model_type": "llama", "num_hidden_layers": 2, "num_attention_heads": 4,
                 "num_key_value_heads": 2, "hidden_size": 32, "kv_cache_dtype": "float16" }"#,
        )
        .unwrap();
        let layout = CacheLayout::from_config(&config, ArchitectureKind::DecoderOnly).unwrap();
        assert_eq!(layout.slots().len(), 4);

        let manager = CacheManager::new(layout);
        let seeded = manager.seed_cache(None, 3);
        let key = seeded.get("past_key_values.1.value").unwrap();
        assert_eq!(key.dims(), &[3, 2, 0, 8]);
        assert_eq!(key.dtype(), DataType::Float16);
        assert_eq!(seeded.past_length(), 0);
    }

    #[test]
    fn test_hybrid_layout() {
        let config = ModelConfig::from_json(
            r#"{ "model_type": "lfm2", "num_hidden_layers": 2, "num_attention_heads": 4,
                 "hidden_size": 16, "conv_L_cache": 3, "layer_types": ["conv", "full_attention"] }"#,
        )
        .unwrap();
        let layout = CacheLayout::from_config(&config, ArchitectureKind::DecoderOnly).unwrap();
        let bundle = layout.zeros(1);
        assert_eq!(bundle.get("past_conv.0").unwrap().dims(), &[1, 16, 3]);
        assert_eq!(bundle.get("past_key_values.1.key").unwrap().dims(), &[1, 4, 0, 4]);
        assert!(bundle.get("past_key_values.0.key").is_none());
    }

    #[test]
    fn test_zero_heads_fail_layout() {
        let config = ModelConfig::from_json(
            r#"{ "model_type": "llama", "num_hidden_layers": 2, "num_attention_heads": 0,
                 "hidden_size": 32 }"#,
        )
        .unwrap();
        assert!(matches!(
            CacheLayout::from_config(&config, ArchitectureKind::DecoderOnly),
            Err(GenerationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_encoder_decoder_layout() {
        let config = ModelConfig::from_json(
            r#"{ "model_type": "bart", "is_encoder_decoder": true, "decoder_layers": 2,
                 "decoder_attention_heads": 4, "encoder_attention_heads": 4, "d_model": 32 }"#,
        )
        .unwrap();
        let layout = CacheLayout::from_config(&config, ArchitectureKind::EncoderDecoder).unwrap();
        assert_eq!(layout.slots().len(), 8);
        assert!(layout
            .slots()
            .iter()
            .any(|s| s.name == "past_key_values.1.encoder.value"));
    }

    #[test]
    fn test_seed_cache_borrows_existing() {
        let manager = CacheManager::default();
        let mut bundle = CacheBundle::new();
        bundle.insert("past_key_values.0.key", Tensor::zeros(DataType::Float32, &[1, 1, 5, 2]));
        let seeded = manager.seed_cache(Some(&bundle), 1);
        assert!(matches!(seeded, Cow::Borrowed(_)));
        assert_eq!(seeded.past_length(), 5);
    }
}
