//! Property tests for the pure pieces of the generation loop

use ndarray::Array2;
use ortgen_generation::forward::create_position_ids;
use ortgen_generation::logits_process::{LogitsProcessor, RepetitionPenaltyLogitsProcessor};
use ortgen_generation::sampler::{GreedySampler, MultinomialSampler};
use ortgen_generation::stopping_criteria::MaxLengthCriteria;
use ortgen_generation::{GenerationConfig, LogitsProcessorList, Sampler, StoppingCriteria, Tensor};
use proptest::prelude::*;

fn mask_batch() -> impl Strategy<Value = Vec<Vec<i64>>> {
    (1usize..4, 1usize..12).prop_flat_map(|(batch, len)| {
        prop::collection::vec(prop::collection::vec(0i64..2, len), batch)
    })
}

fn logits_rows() -> impl Strategy<Value = (Vec<Vec<i64>>, Vec<f32>, usize)> {
    (1usize..4, 2usize..10).prop_flat_map(|(batch, vocab)| {
        (
            prop::collection::vec(prop::collection::vec(0i64..vocab as i64, 1..6), batch),
            prop::collection::vec(-20.0f32..20.0, batch * vocab),
            Just(vocab),
        )
    })
}

proptest! {
    #[test]
    fn position_ids_count_attended_tokens(mask in mask_batch(), start in 0i64..2) {
        let tensor = Tensor::from_rows(&mask).unwrap();
        let positions = create_position_ids(&tensor, start, None).unwrap().to_rows_i64().unwrap();

        for (mask_row, position_row) in mask.iter().zip(&positions) {
            let mut expected = start;
            for (&attended, &position) in mask_row.iter().zip(position_row) {
                if attended == 0 {
                    prop_assert_eq!(position, 1);
                } else {
                    prop_assert_eq!(position, expected);
                    expected += 1;
                }
            }
        }
    }

    #[test]
    fn cached_position_ids_are_a_suffix(mask in mask_batch(), keep in 1usize..4) {
        let tensor = Tensor::from_rows(&mask).unwrap();
        let full = create_position_ids(&tensor, 0, None).unwrap().to_rows_i64().unwrap();
        let cached = create_position_ids(&tensor, 0, Some(keep)).unwrap().to_rows_i64().unwrap();

        for (full_row, cached_row) in full.iter().zip(&cached) {
            let n = keep.min(full_row.len());
            prop_assert_eq!(cached_row.as_slice(), &full_row[full_row.len() - n..]);
        }
    }

    #[test]
    fn default_config_leaves_logits_untouched(
        (ids, values, vocab) in logits_rows(),
        do_sample in any::<bool>(),
        max_length in 1usize..64,
    ) {
        let config = GenerationConfig { do_sample, max_length, ..Default::default() };
        let list = LogitsProcessorList::from_config(&config, ids[0].len());
        prop_assert!(list.is_empty());

        let logits = Array2::from_shape_vec((ids.len(), vocab), values).unwrap();
        let processed = list.process(&ids, logits.clone()).unwrap();
        prop_assert_eq!(processed, logits);
    }

    #[test]
    fn repetition_penalty_only_lowers_seen_tokens(
        (ids, values, vocab) in logits_rows(),
        penalty in 1.0f32..4.0,
    ) {
        let logits = Array2::from_shape_vec((ids.len(), vocab), values).unwrap();
        let processed = RepetitionPenaltyLogitsProcessor { penalty }
            .process(&ids, logits.clone())
            .unwrap();

        for (row, seen) in ids.iter().enumerate() {
            for token in 0..vocab {
                let before = logits[[row, token]];
                let after = processed[[row, token]];
                if seen.contains(&(token as i64)) {
                    prop_assert!(after <= before);
                } else {
                    prop_assert_eq!(after, before);
                }
            }
        }
    }

    #[test]
    fn top_k_one_agrees_with_greedy(
        values in prop::collection::hash_set(-1000i32..1000, 2..16),
        seed in any::<u64>(),
    ) {
        let logits: Vec<f32> = values.into_iter().map(|v| v as f32 / 10.0).collect();
        let logits = ndarray::Array1::from(logits);
        let greedy = GreedySampler.sample(logits.view()).unwrap()[0].0;
        let sampled = MultinomialSampler::new(1, 1.0, Some(seed))
            .sample(logits.view())
            .unwrap()[0]
            .0;
        prop_assert_eq!(greedy, sampled);
    }

    #[test]
    fn max_length_marks_rows_at_the_limit(
        lengths in prop::collection::vec(0usize..20, 1..5),
        max_length in 1usize..20,
    ) {
        let rows: Vec<Vec<i64>> = lengths.iter().map(|&n| vec![0; n]).collect();
        let done = MaxLengthCriteria::new(max_length, None).is_done(&rows);
        for (&len, done) in lengths.iter().zip(done) {
            prop_assert_eq!(done, len >= max_length);
        }
    }
}
