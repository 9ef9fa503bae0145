//! Encoder-decoder generation: one encoder pass, decoder start ids and
//! cross-attention cache reuse

mod common;

use common::*;
use ortgen_generation::{
    GenerateRequest, GenerationError, GenerationOptions, ModelConfig, ModelRegistry,
    PreTrainedModel, Tensor, TokenIds,
};
use std::collections::HashMap;
use std::sync::Arc;

const VOCAB: usize = 12;

fn rows(rows: &[Vec<i64>]) -> Tensor {
    Tensor::from_rows(rows).unwrap()
}

fn request(encoder_ids: &[Vec<i64>]) -> GenerateRequest {
    let ids = rows(encoder_ids);
    let mask = ids.ones_like();
    GenerateRequest::new(ids).with_input("attention_mask", mask)
}

#[tokio::test]
async fn test_encoder_runs_once_and_cross_cache_is_reused() {
    init_logger();
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |call, _| match call {
        0 => 5,
        1 => 6,
        _ => 1,
    });
    let model = seq2seq(&encoder, &decoder);

    let output = model
        .generate(request(&[vec![3, 4, 5]]).with_options(GenerationOptions {
            eos_token_id: Some(TokenIds::Single(1)),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert_eq!(
        output.sequences().to_rows_i64().unwrap(),
        vec![vec![0, 5, 6, 1]]
    );
    assert_eq!(encoder.calls(), 1);
    assert_eq!(decoder.calls(), 3);

    let first = decoder.feeds(0);
    assert_eq!(first["input_ids"].to_rows_i64().unwrap(), vec![vec![0]]);
    assert_eq!(first["encoder_hidden_states"].dims(), &[1, 3, 1]);
    assert_eq!(*first["use_cache_branch"].as_array::<bool>().unwrap().iter().next().unwrap(), false);

    for call in 1..3 {
        let feeds = decoder.feeds(call);
        assert_eq!(*feeds["use_cache_branch"].as_array::<bool>().unwrap().iter().next().unwrap(), true);
        // cross-attention entries come from the first step, not the
        // zero-length placeholders emitted afterwards
        assert_eq!(feeds["past_key_values.0.encoder.key"].dims(), &[1, 1, 3, 1]);
        assert_eq!(feeds["past_key_values.0.decoder.key"].dims(), &[1, 1, call, 1]);
        assert_eq!(feeds["input_ids"].dims(), &[1, 1]);
    }
}

#[tokio::test]
async fn test_single_encoder_row_broadcasts_to_decoder_batch() {
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 4);
    let model = seq2seq(&encoder, &decoder);

    let output = model
        .generate(
            request(&[vec![3, 4]])
                .with_input("decoder_input_ids", rows(&[vec![0], vec![2]]))
                .with_options(GenerationOptions {
                    max_new_tokens: Some(1),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    assert_eq!(
        output.sequences().to_rows_i64().unwrap(),
        vec![vec![0, 4], vec![2, 4]]
    );
    assert_eq!(decoder.feeds(0)["encoder_hidden_states"].dims(), &[2, 2, 1]);
}

#[tokio::test]
async fn test_incompatible_batches_are_rejected() {
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 4);
    let model = seq2seq(&encoder, &decoder);

    let err = model
        .generate(
            request(&[vec![3, 4], vec![5, 6]])
                .with_input("decoder_input_ids", rows(&[vec![0], vec![0], vec![0]])),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GenerationError::BatchSizeMismatch {
            encoder: 2,
            decoder: 3
        }
    ));
    assert_eq!(decoder.calls(), 0);
}

#[tokio::test]
async fn test_decoder_start_list_must_match_batch() {
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 4);
    let model = seq2seq(&encoder, &decoder);

    let err = model
        .generate(request(&[vec![3], vec![4]]).with_options(GenerationOptions {
            decoder_start_token_id: Some(TokenIds::Many(vec![0, 0, 0])),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GenerationError::InvalidDecoderStartIds {
            expected: 2,
            actual: 3
        }
    ));
}

#[tokio::test]
async fn test_per_row_decoder_start_ids() {
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 9);
    let model = seq2seq(&encoder, &decoder);

    let output = model
        .generate(request(&[vec![3], vec![4]]).with_options(GenerationOptions {
            decoder_start_token_id: Some(TokenIds::Many(vec![2, 3])),
            max_new_tokens: Some(1),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(
        output.sequences().to_rows_i64().unwrap(),
        vec![vec![2, 9], vec![3, 9]]
    );
}

#[tokio::test]
async fn test_decoder_start_falls_back_to_bos() {
    let config = ModelConfig::from_json(
        r#"{
            "model_type": "bart",
            "architectures": ["BartForConditionalGeneration"],
            "decoder_layers": 1,
            "decoder_attention_heads": 1,
            "encoder_attention_heads": 1,
            "d_model": 1,
            "bos_token_id": 7
        }"#,
    )
    .unwrap();
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 3);
    let mut sessions = HashMap::new();
    sessions.insert("model".to_string(), shared(&encoder));
    sessions.insert("decoder_model_merged".to_string(), shared(&decoder));
    let model =
        PreTrainedModel::from_sessions(Arc::new(ModelRegistry::builtin()), config, sessions)
            .unwrap();

    let output = model
        .generate(request(&[vec![1, 2]]).with_options(GenerationOptions {
            max_new_tokens: Some(2),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(
        output.sequences().to_rows_i64().unwrap(),
        vec![vec![7, 3, 3]]
    );
}

#[tokio::test]
async fn test_guidance_doubles_decoder_rows() {
    let encoder = mock_encoder();
    let decoder = mock_decoder(VOCAB, |_, _| 4);
    let model = seq2seq(&encoder, &decoder);

    let output = model
        .generate(request(&[vec![3, 4]]).with_options(GenerationOptions {
            guidance_scale: Some(2.0),
            max_new_tokens: Some(2),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert_eq!(
        output.sequences().to_rows_i64().unwrap(),
        vec![vec![0, 4, 4]]
    );
    assert_eq!(encoder.calls(), 1);

    let first = decoder.feeds(0);
    assert_eq!(first["input_ids"].dims(), &[2, 1]);
    assert_eq!(first["encoder_hidden_states"].dims(), &[2, 2, 1]);
    assert_eq!(
        first["encoder_attention_mask"].to_rows_i64().unwrap(),
        vec![vec![1, 1], vec![0, 0]]
    );
    let second = decoder.feeds(1);
    assert_eq!(second["input_ids"].to_rows_i64().unwrap(), vec![vec![4], vec![4]]);
    assert_eq!(second["past_key_values.0.decoder.key"].dims(), &[2, 1, 1, 1]);
}
