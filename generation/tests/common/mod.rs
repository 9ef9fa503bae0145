//! Scripted sessions for driving the generation loop without a runtime

#![allow(dead_code)]

use async_trait::async_trait;
use ortgen_generation::{
    DataType, Feeds, GenerationError, InferenceSession, Location, ModelConfig, ModelRegistry,
    NamedTensors, PreTrainedModel, Result, SharedSession, Tensor,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Owned copy of one `run` call's feeds
pub type RecordedFeeds = HashMap<String, Tensor>;

type Handler = dyn Fn(usize, &RecordedFeeds) -> Result<NamedTensors> + Send + Sync;

/// Session whose outputs come from a closure given the call index and feeds
pub struct MockSession {
    inputs: Vec<String>,
    outputs: Vec<String>,
    handler: Box<Handler>,
    calls: AtomicUsize,
    released: AtomicUsize,
    log: Mutex<Vec<RecordedFeeds>>,
}

impl MockSession {
    pub fn new<F>(inputs: &[&str], outputs: &[&str], handler: F) -> Arc<Self>
    where
        F: Fn(usize, &RecordedFeeds) -> Result<NamedTensors> + Send + Sync + 'static,
    {
        Arc::new(Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn feeds(&self, call: usize) -> RecordedFeeds {
        self.log.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl InferenceSession for MockSession {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    async fn run(&self, feeds: &Feeds<'_>) -> Result<NamedTensors> {
        let recorded: RecordedFeeds = feeds
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(recorded.clone());
        (self.handler)(call, &recorded)
    }

    fn release(&self, _tensor: Tensor) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn shared(session: &Arc<MockSession>) -> SharedSession {
    session.clone()
}

/// `[rows, 1, vocab]` logits with 10.0 at each row's chosen token.
pub fn one_hot_logits(tokens: &[i64], vocab: usize) -> Tensor {
    let mut values = vec![0.0f32; tokens.len() * vocab];
    for (row, &token) in tokens.iter().enumerate() {
        values[row * vocab + token as usize] = 10.0;
    }
    Tensor::from_shape_vec(&[tokens.len(), 1, vocab], values).unwrap()
}

fn history_from_past(feeds: &RecordedFeeds, name: &str) -> Vec<Vec<f32>> {
    let past = feeds[name].as_array::<f32>().unwrap();
    let shape = past.shape().to_vec();
    (0..shape[0])
        .map(|b| (0..shape[2]).map(|t| past[[b, 0, t, 0]]).collect())
        .collect()
}

/// Decoder-only graph whose single-layer cache stores the token history:
/// `present.0.key` is the past concatenated with the new ids. `next_token`
/// sees the full history of each row.
pub fn history_causal_lm<F>(vocab: usize, location: Location, next_token: F) -> Arc<MockSession>
where
    F: Fn(usize, &[i64]) -> i64 + Send + Sync + 'static,
{
    MockSession::new(
        &[
            "input_ids",
            "attention_mask",
            "position_ids",
            "past_key_values.0.key",
            "past_key_values.0.value",
        ],
        &["logits", "present.0.key", "present.0.value"],
        move |call, feeds| {
            let ids = feeds["input_ids"].to_rows_i64()?;
            let past = history_from_past(feeds, "past_key_values.0.key");
            let batch = ids.len();
            let total = past[0].len() + ids[0].len();

            let mut histories = Vec::with_capacity(batch);
            let mut flat = Vec::with_capacity(batch * total);
            for (row_past, row_ids) in past.iter().zip(&ids) {
                let history: Vec<i64> = row_past
                    .iter()
                    .map(|&v| v as i64)
                    .chain(row_ids.iter().copied())
                    .collect();
                flat.extend(history.iter().map(|&v| v as f32));
                histories.push(history);
            }
            let chosen: Vec<i64> = histories.iter().map(|h| next_token(call, h)).collect();

            let present = Tensor::from_shape_vec(&[batch, 1, total, 1], flat)?
                .with_location(location);
            let mut out = NamedTensors::new();
            out.insert("logits".into(), one_hot_logits(&chosen, vocab));
            out.insert("present.0.key".into(), present.clone());
            out.insert("present.0.value".into(), present);
            Ok(out)
        },
    )
}

pub fn causal_lm_config() -> ModelConfig {
    ModelConfig::from_json(
        r#"{
            "model_type": "gpt2",
            "architectures": ["GPT2LMHeadModel"],
            "n_layer": 1,
            "n_head": 1,
            "n_embd": 1,
            "n_positions": 1024
        }"#,
    )
    .unwrap()
}

pub fn causal_lm(session: &Arc<MockSession>) -> PreTrainedModel {
    let mut sessions = HashMap::new();
    sessions.insert("model".to_string(), shared(session));
    PreTrainedModel::from_sessions(
        Arc::new(ModelRegistry::builtin()),
        causal_lm_config(),
        sessions,
    )
    .unwrap()
}

pub fn seq2seq_config() -> ModelConfig {
    ModelConfig::from_json(
        r#"{
            "model_type": "bart",
            "architectures": ["BartForConditionalGeneration"],
            "is_encoder_decoder": true,
            "decoder_layers": 1,
            "decoder_attention_heads": 1,
            "encoder_attention_heads": 1,
            "d_model": 1,
            "decoder_start_token_id": 0
        }"#,
    )
    .unwrap()
}

/// Encoder emitting `[batch, seq, 1]` hidden states equal to the ids.
pub fn mock_encoder() -> Arc<MockSession> {
    MockSession::new(
        &["input_ids", "attention_mask"],
        &["last_hidden_state"],
        |_, feeds| {
            let ids = feeds["input_ids"].to_rows_i64()?;
            let (batch, seq) = (ids.len(), ids[0].len());
            let values = ids.iter().flatten().map(|&v| v as f32).collect();
            let mut out = NamedTensors::new();
            out.insert(
                "last_hidden_state".into(),
                Tensor::from_shape_vec(&[batch, seq, 1], values)?,
            );
            Ok(out)
        },
    )
}

/// Merged decoder with a history cache on the self-attention side and an
/// encoder-side placeholder that is only meaningful on the first step.
pub fn mock_decoder<F>(vocab: usize, next_token: F) -> Arc<MockSession>
where
    F: Fn(usize, &[i64]) -> i64 + Send + Sync + 'static,
{
    MockSession::new(
        &[
            "input_ids",
            "encoder_hidden_states",
            "encoder_attention_mask",
            "use_cache_branch",
            "past_key_values.0.decoder.key",
            "past_key_values.0.decoder.value",
            "past_key_values.0.encoder.key",
            "past_key_values.0.encoder.value",
        ],
        &[
            "logits",
            "present.0.decoder.key",
            "present.0.decoder.value",
            "present.0.encoder.key",
            "present.0.encoder.value",
        ],
        move |call, feeds| {
            let ids = feeds["input_ids"].to_rows_i64()?;
            let past = history_from_past(feeds, "past_key_values.0.decoder.key");
            let batch = ids.len();
            let total = past[0].len() + ids[0].len();
            let use_cache = *feeds["use_cache_branch"]
                .as_array::<bool>()?
                .iter()
                .next()
                .ok_or_else(|| GenerationError::InvalidInput("empty flag".into()))?;

            let mut flat = Vec::new();
            let mut chosen = Vec::new();
            for (row_past, row_ids) in past.iter().zip(&ids) {
                let history: Vec<i64> = row_past
                    .iter()
                    .map(|&v| v as i64)
                    .chain(row_ids.iter().copied())
                    .collect();
                flat.extend(history.iter().map(|&v| v as f32));
                chosen.push(next_token(call, &history));
            }

            let decoder = Tensor::from_shape_vec(&[batch, 1, total, 1], flat)?;
            // cross-attention cache is only computed without a cache
            let encoder_len = if use_cache {
                0
            } else {
                feeds["encoder_hidden_states"].dim(1)?
            };
            let encoder = Tensor::zeros(DataType::Float32, &[batch, 1, encoder_len, 1]);

            let mut out = NamedTensors::new();
            out.insert("logits".into(), one_hot_logits(&chosen, vocab));
            out.insert("present.0.decoder.key".into(), decoder.clone());
            out.insert("present.0.decoder.value".into(), decoder);
            out.insert("present.0.encoder.key".into(), encoder.clone());
            out.insert("present.0.encoder.value".into(), encoder);
            Ok(out)
        },
    )
}

pub fn seq2seq(encoder: &Arc<MockSession>, decoder: &Arc<MockSession>) -> PreTrainedModel {
    let mut sessions = HashMap::new();
    sessions.insert("model".to_string(), shared(encoder));
    sessions.insert("decoder_model_merged".to_string(), shared(decoder));
    PreTrainedModel::from_sessions(Arc::new(ModelRegistry::builtin()), seq2seq_config(), sessions)
        .unwrap()
}
