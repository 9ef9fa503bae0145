//! Stopping criteria
//!
//! Each criterion reports, per row, whether that row is done. The list ORs
//! them; generation halts once every row is done.

use crate::config::GenerationConfig;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

pub trait StoppingCriteria: Send + Sync {
    fn is_done(&self, input_ids: &[Vec<i64>]) -> Vec<bool>;
}

/// Stops rows at `max_length`, capped by the model's position limit.
#[derive(Debug)]
pub struct MaxLengthCriteria {
    max_length: usize,
    max_position_embeddings: Option<usize>,
    warned: AtomicBool,
}

impl MaxLengthCriteria {
    pub fn new(max_length: usize, max_position_embeddings: Option<usize>) -> Self {
        Self {
            max_length,
            max_position_embeddings,
            warned: AtomicBool::new(false),
        }
    }
}

impl StoppingCriteria for MaxLengthCriteria {
    fn is_done(&self, input_ids: &[Vec<i64>]) -> Vec<bool> {
        input_ids
            .iter()
            .map(|ids| {
                let len = ids.len();
                if len >= self.max_length {
                    return true;
                }
                match self.max_position_embeddings {
                    Some(limit) if len >= limit => {
                        if !self.warned.swap(true, Ordering::Relaxed) {
                            warn!(
                                "sequence length {} reached max_position_embeddings ({}); stopping before max_length {}",
                                len, limit, self.max_length
                            );
                        }
                        true
                    }
                    _ => false,
                }
            })
            .collect()
    }
}

/// Stops rows whose last token is an EOS id.
#[derive(Debug, Clone)]
pub struct EosTokenCriteria {
    eos_token_ids: Vec<i64>,
}

impl EosTokenCriteria {
    pub fn new(eos_token_ids: Vec<i64>) -> Self {
        Self { eos_token_ids }
    }
}

impl StoppingCriteria for EosTokenCriteria {
    fn is_done(&self, input_ids: &[Vec<i64>]) -> Vec<bool> {
        input_ids
            .iter()
            .map(|ids| {
                ids.last()
                    .map(|last| self.eos_token_ids.contains(last))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Stops every row once its token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct InterruptableStoppingCriteria {
    token: CancellationToken,
}

impl InterruptableStoppingCriteria {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl StoppingCriteria for InterruptableStoppingCriteria {
    fn is_done(&self, input_ids: &[Vec<i64>]) -> Vec<bool> {
        vec![self.token.is_cancelled(); input_ids.len()]
    }
}

#[derive(Default)]
pub struct StoppingCriteriaList {
    criteria: Vec<Box<dyn StoppingCriteria>>,
}

impl StoppingCriteriaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &GenerationConfig, max_position_embeddings: Option<usize>) -> Self {
        let mut list = Self::new();
        list.push(MaxLengthCriteria::new(
            config.max_length,
            max_position_embeddings,
        ));
        let eos = config.eos_token_ids();
        if !eos.is_empty() {
            list.push(EosTokenCriteria::new(eos));
        }
        list
    }

    pub fn push<C: StoppingCriteria + 'static>(&mut self, criteria: C) {
        self.criteria.push(Box::new(criteria));
    }

    pub fn extend(&mut self, criteria: impl IntoIterator<Item = Box<dyn StoppingCriteria>>) {
        self.criteria.extend(criteria);
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn is_done(&self, input_ids: &[Vec<i64>]) -> Vec<bool> {
        let mut done = vec![false; input_ids.len()];
        for criteria in &self.criteria {
            for (row, flag) in done.iter_mut().zip(criteria.is_done(input_ids)) {
                *row |= flag;
            }
        }
        done
    }
}
