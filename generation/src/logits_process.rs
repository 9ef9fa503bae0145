//! Logits processors
//!
//! Each processor rewrites the `[rows, vocab]` scores of the latest step given
//! the token history of every row. [`LogitsProcessorList::from_config`] builds
//! the standard chain in its fixed order; caller processors run after it.

use crate::config::GenerationConfig;
use crate::error::{GenerationError, Result};
use log::debug;
use ndarray::{s, Array2, ArrayViewMut1};
use std::collections::{HashMap, HashSet};

pub trait LogitsProcessor: Send + Sync {
    /// `input_ids[i]` is the full history of row `i`; `logits` holds at least
    /// one row per history.
    fn process(&self, input_ids: &[Vec<i64>], logits: Array2<f32>) -> Result<Array2<f32>>;

    fn name(&self) -> &'static str;
}

fn set_score(row: &mut ArrayViewMut1<f32>, token: i64, value: f32) {
    if let Some(score) = usize::try_from(token).ok().and_then(|t| row.get_mut(t)) {
        *score = value;
    }
}

fn force_tokens(row: &mut ArrayViewMut1<f32>, tokens: &[i64]) {
    row.fill(f32::NEG_INFINITY);
    for &token in tokens {
        set_score(row, token, 0.0);
    }
}

/// Penalises every token already present in the row.
#[derive(Debug, Clone)]
pub struct RepetitionPenaltyLogitsProcessor {
    pub penalty: f32,
}

impl LogitsProcessor for RepetitionPenaltyLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            let seen: HashSet<i64> = ids.iter().copied().collect();
            for token in seen {
                if let Some(score) = usize::try_from(token).ok().and_then(|t| row.get_mut(t)) {
                    if *score < 0.0 {
                        *score *= self.penalty;
                    } else {
                        *score /= self.penalty;
                    }
                }
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Bans tokens that would repeat an n-gram already in the row.
#[derive(Debug, Clone)]
pub struct NoRepeatNGramLogitsProcessor {
    pub ngram_size: usize,
}

impl NoRepeatNGramLogitsProcessor {
    /// Maps every (n-1)-token prefix to the tokens that followed it.
    fn ngrams(&self, ids: &[i64]) -> HashMap<Vec<i64>, Vec<i64>> {
        let n = self.ngram_size;
        let mut map: HashMap<Vec<i64>, Vec<i64>> = HashMap::new();
        if ids.len() < n {
            return map;
        }
        for window in ids.windows(n) {
            let (prefix, last) = window.split_at(n - 1);
            map.entry(prefix.to_vec()).or_default().push(last[0]);
        }
        map
    }

    fn banned_tokens(&self, ids: &[i64]) -> Vec<i64> {
        let n = self.ngram_size;
        if ids.len() + 1 < n {
            return Vec::new();
        }
        let prefix = &ids[ids.len() + 1 - n..];
        self.ngrams(ids).remove(prefix).unwrap_or_default()
    }
}

impl LogitsProcessor for NoRepeatNGramLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            for token in self.banned_tokens(ids) {
                set_score(&mut row, token, f32::NEG_INFINITY);
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}

/// Bans the last token of each bad word once the row ends with the rest.
#[derive(Debug, Clone)]
pub struct NoBadWordsLogitsProcessor {
    pub bad_words_ids: Vec<Vec<i64>>,
}

impl LogitsProcessor for NoBadWordsLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            for word in &self.bad_words_ids {
                let Some((&last, prefix)) = word.split_last() else {
                    continue;
                };
                if ids.ends_with(prefix) {
                    set_score(&mut row, last, f32::NEG_INFINITY);
                }
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "no_bad_words"
    }
}

/// Blocks EOS while a row is shorter than `min_length`.
#[derive(Debug, Clone)]
pub struct MinLengthLogitsProcessor {
    pub min_length: usize,
    pub eos_token_ids: Vec<i64>,
}

impl LogitsProcessor for MinLengthLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            if ids.len() < self.min_length {
                for &eos in &self.eos_token_ids {
                    set_score(&mut row, eos, f32::NEG_INFINITY);
                }
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Blocks EOS until a row has produced `min_new_tokens` past the prompt.
#[derive(Debug, Clone)]
pub struct MinNewTokensLengthLogitsProcessor {
    pub prompt_length: usize,
    pub min_new_tokens: usize,
    pub eos_token_ids: Vec<i64>,
}

impl LogitsProcessor for MinNewTokensLengthLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            let new_tokens = ids.len().saturating_sub(self.prompt_length);
            if new_tokens < self.min_new_tokens {
                for &eos in &self.eos_token_ids {
                    set_score(&mut row, eos, f32::NEG_INFINITY);
                }
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "min_new_tokens"
    }
}

/// Forces BOS as the first generated token.
#[derive(Debug, Clone)]
pub struct ForcedBOSTokenLogitsProcessor {
    pub bos_token_id: i64,
}

impl LogitsProcessor for ForcedBOSTokenLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            if ids.len() == 1 {
                force_tokens(&mut row, &[self.bos_token_id]);
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "forced_bos"
    }
}

/// Forces EOS when the next token would reach `max_length`.
#[derive(Debug, Clone)]
pub struct ForcedEOSTokenLogitsProcessor {
    pub max_length: usize,
    pub eos_token_ids: Vec<i64>,
}

impl LogitsProcessor for ForcedEOSTokenLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            if ids.len() + 1 == self.max_length {
                force_tokens(&mut row, &self.eos_token_ids);
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "forced_eos"
    }
}

/// Suppresses tokens at exactly one position.
#[derive(Debug, Clone)]
pub struct SuppressTokensAtBeginLogitsProcessor {
    pub begin_suppress_tokens: Vec<i64>,
    pub begin_index: usize,
}

impl SuppressTokensAtBeginLogitsProcessor {
    /// The first generated position: one later when a forced BOS takes the
    /// first slot of a single-token prompt.
    pub fn begin_index(input_length: usize, forced_bos_token_id: Option<i64>) -> usize {
        if input_length > 1 || forced_bos_token_id.is_none() {
            input_length
        } else {
            input_length + 1
        }
    }
}

impl LogitsProcessor for SuppressTokensAtBeginLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        for (ids, mut row) in input_ids.iter().zip(logits.rows_mut()) {
            if ids.len() == self.begin_index {
                for &token in &self.begin_suppress_tokens {
                    set_score(&mut row, token, f32::NEG_INFINITY);
                }
            }
        }
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "suppress_tokens_at_begin"
    }
}

/// Combines conditional (first half) and unconditional (second half) rows.
#[derive(Debug, Clone)]
pub struct ClassifierFreeGuidanceLogitsProcessor {
    pub guidance_scale: f32,
}

impl LogitsProcessor for ClassifierFreeGuidanceLogitsProcessor {
    fn process(&self, input_ids: &[Vec<i64>], logits: Array2<f32>) -> Result<Array2<f32>> {
        let batch = input_ids.len();
        if logits.nrows() != 2 * batch {
            return Err(GenerationError::ShapeMismatch(format!(
                "Logits should have twice the batch size of the input ids, the first half of batches corresponding to the conditional inputs, and the second half of batches corresponding to the unconditional inputs. Got batch size {} for the logits and {} for the input ids.",
                logits.nrows(),
                batch
            )));
        }
        let cond = logits.slice(s![..batch, ..]);
        let uncond = logits.slice(s![batch.., ..]);
        Ok(&uncond + &((&cond - &uncond) * self.guidance_scale))
    }

    fn name(&self) -> &'static str {
        "classifier_free_guidance"
    }
}

#[derive(Debug, Clone)]
pub struct TemperatureLogitsWarper {
    pub temperature: f32,
}

impl LogitsProcessor for TemperatureLogitsWarper {
    fn process(&self, _input_ids: &[Vec<i64>], mut logits: Array2<f32>) -> Result<Array2<f32>> {
        logits.mapv_inplace(|v| v / self.temperature);
        Ok(logits)
    }

    fn name(&self) -> &'static str {
        "temperature"
    }
}

/// Ordered chain of processors
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard chain for `config`. `input_length` is the history length of
    /// each row before the first step.
    pub fn from_config(config: &GenerationConfig, input_length: usize) -> Self {
        let mut list = Self::new();
        let eos_token_ids = config.eos_token_ids();

        if config.repetition_penalty != 1.0 {
            list.push(RepetitionPenaltyLogitsProcessor {
                penalty: config.repetition_penalty,
            });
        }
        if config.no_repeat_ngram_size > 0 {
            list.push(NoRepeatNGramLogitsProcessor {
                ngram_size: config.no_repeat_ngram_size,
            });
        }
        if !config.bad_words_ids.is_empty() {
            list.push(NoBadWordsLogitsProcessor {
                bad_words_ids: config.bad_words_ids.clone(),
            });
        }
        if config.min_length > 0 && !eos_token_ids.is_empty() {
            list.push(MinLengthLogitsProcessor {
                min_length: config.min_length,
                eos_token_ids: eos_token_ids.clone(),
            });
        }
        if let Some(min_new_tokens) = config.min_new_tokens.filter(|&n| n > 0) {
            if !eos_token_ids.is_empty() {
                list.push(MinNewTokensLengthLogitsProcessor {
                    prompt_length: input_length,
                    min_new_tokens,
                    eos_token_ids: eos_token_ids.clone(),
                });
            }
        }
        if let Some(bos_token_id) = config.forced_bos_token_id {
            list.push(ForcedBOSTokenLogitsProcessor { bos_token_id });
        }
        if let Some(forced_eos) = &config.forced_eos_token_id {
            list.push(ForcedEOSTokenLogitsProcessor {
                max_length: config.max_length,
                eos_token_ids: forced_eos.to_vec(),
            });
        }
        if !config.begin_suppress_tokens.is_empty() {
            list.push(SuppressTokensAtBeginLogitsProcessor {
                begin_suppress_tokens: config.begin_suppress_tokens.clone(),
                begin_index: SuppressTokensAtBeginLogitsProcessor::begin_index(
                    input_length,
                    config.forced_bos_token_id,
                ),
            });
        }
        if let Some(guidance_scale) = config.guidance_scale.filter(|&g| g > 1.0) {
            list.push(ClassifierFreeGuidanceLogitsProcessor { guidance_scale });
        }
        if config.do_sample && config.temperature != 1.0 {
            list.push(TemperatureLogitsWarper {
                temperature: config.temperature,
            });
        }

        debug!("logits processors: {:?}", list.names());
        list
    }

    pub fn push<P: LogitsProcessor + 'static>(&mut self, processor: P) {
        self.processors.push(Box::new(processor));
    }

    pub fn extend(&mut self, processors: impl IntoIterator<Item = Box<dyn LogitsProcessor>>) {
        self.processors.extend(processors);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn process(&self, input_ids: &[Vec<i64>], logits: Array2<f32>) -> Result<Array2<f32>> {
        self.processors
            .iter()
            .try_fold(logits, |logits, processor| processor.process(input_ids, logits))
    }
}
