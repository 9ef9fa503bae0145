//! Token selection from processed logits

use crate::config::GenerationConfig;
use crate::error::{GenerationError, Result};
use ndarray::ArrayView1;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub trait Sampler: Send {
    /// Candidate `(token_id, log_probability)` pairs for one row, best first.
    fn sample(&mut self, logits: ArrayView1<'_, f32>) -> Result<Vec<(i64, f32)>>;
}

/// Log-softmax of one entry, computed stably.
fn log_softmax_at(logits: &ArrayView1<'_, f32>, index: usize) -> f32 {
    let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let sum: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
    logits[index] - max - sum.ln()
}

fn cmp_desc(a: &f32, b: &f32) -> std::cmp::Ordering {
    b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal)
}

/// Arg-max decoding
#[derive(Debug, Default, Clone)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&mut self, logits: ArrayView1<'_, f32>) -> Result<Vec<(i64, f32)>> {
        // First index wins ties
        let mut best: Option<(usize, f32)> = None;
        for (index, &value) in logits.iter().enumerate() {
            if best.map_or(true, |(_, top)| value > top) {
                best = Some((index, value));
            }
        }
        let (index, _) =
            best.ok_or_else(|| GenerationError::Sampling("empty logits".to_string()))?;
        Ok(vec![(index as i64, log_softmax_at(&logits, index))])
    }
}

/// Top-k / nucleus restricted categorical sampling
#[derive(Debug)]
pub struct MultinomialSampler {
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl MultinomialSampler {
    pub fn new(top_k: usize, top_p: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { top_k, top_p, rng }
    }
}

impl Sampler for MultinomialSampler {
    fn sample(&mut self, logits: ArrayView1<'_, f32>) -> Result<Vec<(i64, f32)>> {
        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        candidates.sort_unstable_by(|a, b| cmp_desc(&a.1, &b.1));
        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        let max = candidates
            .first()
            .map(|(_, v)| *v)
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                GenerationError::Sampling("no finite logits to sample from".to_string())
            })?;
        let mut probs: Vec<f32> = candidates.iter().map(|(_, v)| (v - max).exp()).collect();
        let total: f32 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= total);

        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut cutoff = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            candidates.truncate(cutoff);
            probs.truncate(cutoff);
            let total: f32 = probs.iter().sum();
            probs.iter_mut().for_each(|p| *p /= total);
        }

        let dist = WeightedIndex::new(&probs).map_err(|e| {
            GenerationError::Sampling(format!("failed to create distribution: {}", e))
        })?;
        let choice = dist.sample(&mut self.rng);
        Ok(vec![(candidates[choice].0 as i64, probs[choice].ln())])
    }
}

/// Sampler chosen by `do_sample`. Expects a validated config.
pub fn sampler_for(config: &GenerationConfig) -> Box<dyn Sampler> {
    if config.do_sample {
        Box::new(MultinomialSampler::new(
            config.top_k,
            config.top_p,
            config.seed,
        ))
    } else {
        Box::new(GreedySampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_greedy_picks_argmax() {
        let logits = array![0.0f32, 3.0, 1.0];
        let picked = GreedySampler.sample(logits.view()).unwrap();
        assert_eq!(picked[0].0, 1);
        assert!(picked[0].1 < 0.0);
    }

    #[test]
    fn test_greedy_log_probability_of_certain_token() {
        let logits = array![f32::NEG_INFINITY, 5.0, f32::NEG_INFINITY];
        let picked = GreedySampler.sample(logits.view()).unwrap();
        assert_eq!(picked[0], (1, 0.0));
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let mut sampler = MultinomialSampler::new(1, 1.0, None);
        let logits = array![0.1f32, 0.2, 9.0, 0.3];
        for _ in 0..20 {
            assert_eq!(sampler.sample(logits.view()).unwrap()[0].0, 2);
        }
    }

    #[test]
    fn test_banned_tokens_are_never_drawn() {
        let mut sampler = MultinomialSampler::new(0, 1.0, Some(7));
        let logits = array![1.0f32, f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY];
        for _ in 0..50 {
            let token = sampler.sample(logits.view()).unwrap()[0].0;
            assert!(token == 0 || token == 2);
        }
    }

    #[test]
    fn test_seeded_sampler_is_reproducible() {
        let logits = array![1.0f32, 1.1, 0.9, 1.2, 1.0];
        let mut a = MultinomialSampler::new(0, 1.0, Some(42));
        let mut b = MultinomialSampler::new(0, 1.0, Some(42));
        let draws_a: Vec<i64> = (0..10).map(|_| a.sample(logits.view()).unwrap()[0].0).collect();
        let draws_b: Vec<i64> = (0..10).map(|_| b.sample(logits.view()).unwrap()[0].0).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn test_all_banned_is_an_error() {
        let mut sampler = MultinomialSampler::new(0, 1.0, Some(1));
        let logits = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        assert!(matches!(
            sampler.sample(logits.view()),
            Err(GenerationError::Sampling(_))
        ));
    }

    #[test]
    fn test_sampler_for_follows_do_sample() {
        let logits = array![0.0f32, 3.0, 1.0];
        let mut greedy = sampler_for(&GenerationConfig::default());
        assert_eq!(greedy.sample(logits.view()).unwrap()[0].0, 1);

        let config = GenerationConfig {
            do_sample: true,
            top_k: 1,
            seed: Some(3),
            ..Default::default()
        };
        let mut sampled = sampler_for(&config);
        let (token, log_prob) = sampled.sample(logits.view()).unwrap()[0];
        assert_eq!(token, 1);
        assert_eq!(log_prob, 0.0);
    }
}
