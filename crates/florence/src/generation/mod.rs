mod beam_search;
mod logits;
mod stopping;

pub use beam_search::*;
pub use logits::*;
pub use stopping::*;

use crate::tokenizer::SpecialTokens;
use anyhow::{bail, Context};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Decoding settings, the subset of a Hugging Face `generation_config.json`
/// that the Florence-2 decoder uses. Unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub length_penalty: f32,
    pub do_sample: bool,
    pub decoder_start_token_id: Option<u32>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_beams: 3,
            max_new_tokens: 1024,
            no_repeat_ngram_size: 3,
            early_stopping: true,
            length_penalty: 1.0,
            do_sample: false,
            decoder_start_token_id: None,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read generation config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid generation config {}", path.display()))?;
        debug!("generation config loaded: {:?}", config);
        Ok(config)
    }

    /// Fill the token ids the config leaves out from the tokenizer.
    pub fn search_params(&self, special_tokens: SpecialTokens) -> anyhow::Result<SearchParams> {
        if self.do_sample {
            bail!("sampling is not supported, set do_sample to false");
        }
        if self.num_beams == 0 {
            bail!("num_beams must be at least 1");
        }

        let eos_token_id = self.eos_token_id.unwrap_or(special_tokens.eos);

        Ok(SearchParams {
            num_beams: self.num_beams,
            max_length: self.max_new_tokens + 1,
            no_repeat_ngram_size: self.no_repeat_ngram_size,
            early_stopping: self.early_stopping,
            length_penalty: self.length_penalty,
            decoder_start_token_id: self.decoder_start_token_id.unwrap_or(eos_token_id),
            forced_bos_token_id: self.forced_bos_token_id.or(Some(special_tokens.bos)),
            forced_eos_token_id: self.forced_eos_token_id.or(Some(eos_token_id)),
            eos_token_id,
        })
    }
}

/// Fully resolved decoding parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub num_beams: usize,
    /// Including the decoder start token.
    pub max_length: usize,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub length_penalty: f32,
    pub decoder_start_token_id: u32,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub eos_token_id: u32,
}

/// A decoder conditioned on an already encoded input.
pub trait Seq2SeqDecoder {
    /// `sequences` all have the same length. Returns the logits of the last
    /// position, shaped `[sequences.len(), vocab_size]`.
    fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> anyhow::Result<Array2<f32>>;
}

pub fn generate(
    decoder: &mut impl Seq2SeqDecoder,
    params: &SearchParams,
) -> anyhow::Result<Vec<u32>> {
    if params.num_beams == 1 {
        greedy_search(decoder, params)
    } else {
        beam_search(decoder, params)
    }
}

pub fn greedy_search(
    decoder: &mut impl Seq2SeqDecoder,
    params: &SearchParams,
) -> anyhow::Result<Vec<u32>> {
    let processors = LogitsProcessorList::from_params(params);
    let stopping_criteria = StoppingCriteria::from_params(params);

    let mut tokens = vec![params.decoder_start_token_id];

    while !stopping_criteria.should_stop(&tokens) {
        let logits = decoder.next_token_logits(std::slice::from_ref(&tokens))?;
        if logits.nrows() != 1 {
            bail!("decoder returned {} rows for 1 sequence", logits.nrows());
        }

        let mut scores = log_softmax(logits.row(0)).to_vec();
        processors.process(&tokens, &mut scores);

        let next_token = argmax(&scores).context("no finite score left")?;
        tokens.push(next_token);
    }

    Ok(tokens)
}

pub fn log_softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let log_sum = logits.mapv(|x| (x - max).exp()).sum().ln() + max;
    logits.mapv(|x| x - log_sum)
}

fn argmax(scores: &[f32]) -> Option<u32> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (idx, &score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((idx, score)),
        })
        .map(|(idx, _)| idx as u32)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use ndarray::array;

    pub(crate) const VOCAB_SIZE: usize = 8;
    pub(crate) const SPECIAL_TOKENS: SpecialTokens = SpecialTokens {
        bos: 0,
        eos: 2,
        pad: 1,
        unk: 3,
    };

    /// Favors one next token depending on the last token: 0 -> 5 -> 6 -> eos,
    /// anything else goes straight to eos.
    pub(crate) struct ScriptedDecoder {
        pub calls: usize,
    }

    impl ScriptedDecoder {
        pub(crate) fn new() -> Self {
            Self { calls: 0 }
        }

        fn favored(last: u32) -> usize {
            match last {
                0 => 5,
                5 => 6,
                _ => 2,
            }
        }
    }

    impl Seq2SeqDecoder for ScriptedDecoder {
        fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> anyhow::Result<Array2<f32>> {
            self.calls += 1;
            let mut logits = Array2::zeros((sequences.len(), VOCAB_SIZE));
            for (row, sequence) in sequences.iter().enumerate() {
                let last = *sequence.last().context("empty sequence")?;
                logits[[row, Self::favored(last)]] = 10.0;
            }
            Ok(logits)
        }
    }

    pub(crate) fn test_params(num_beams: usize) -> SearchParams {
        GenerationConfig {
            num_beams,
            max_new_tokens: 9,
            ..Default::default()
        }
        .search_params(SPECIAL_TOKENS)
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = GenerationConfig::default();
        assert_eq!(config.num_beams, 3);
        assert_eq!(config.max_new_tokens, 1024);
        assert_eq!(config.no_repeat_ngram_size, 3);
        assert!(config.early_stopping);
        assert!(!config.do_sample);

        let params = config.search_params(SPECIAL_TOKENS).unwrap();
        assert_eq!(params.max_length, 1025);
        assert_eq!(params.decoder_start_token_id, 2);
        assert_eq!(params.forced_bos_token_id, Some(0));
        assert_eq!(params.forced_eos_token_id, Some(2));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: GenerationConfig = serde_json::from_str(
            r#"{"num_beams": 5, "decoder_start_token_id": 7, "_from_model_config": true}"#,
        )
        .unwrap();
        assert_eq!(config.num_beams, 5);
        assert_eq!(config.max_new_tokens, 1024);

        let params = config.search_params(SPECIAL_TOKENS).unwrap();
        assert_eq!(params.decoder_start_token_id, 7);
        assert_eq!(params.eos_token_id, 2);
    }

    #[test]
    fn test_sampling_is_rejected() {
        let config = GenerationConfig {
            do_sample: true,
            ..Default::default()
        };
        assert!(config.search_params(SPECIAL_TOKENS).is_err());

        let config = GenerationConfig {
            num_beams: 0,
            ..Default::default()
        };
        assert!(config.search_params(SPECIAL_TOKENS).is_err());
    }

    #[test]
    fn test_log_softmax() {
        let scores = log_softmax(array![1.0f32, 1.0].view());
        for score in scores.iter() {
            assert!((score - 0.5f32.ln()).abs() < 1e-6);
        }

        let scores = log_softmax(array![1000.0f32, 0.0].view());
        assert!(scores[0].abs() < 1e-6);
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_argmax_skips_non_finite() {
        assert_eq!(argmax(&[f32::NEG_INFINITY, -2.0, -1.0, -1.0]), Some(2));
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NAN]), None);
    }

    #[test]
    fn test_greedy_search() {
        let mut decoder = ScriptedDecoder::new();
        let tokens = generate(&mut decoder, &test_params(1)).unwrap();

        assert_eq!(tokens, vec![2, 0, 5, 6, 2]);
        assert_eq!(decoder.calls, 4);
    }
}
