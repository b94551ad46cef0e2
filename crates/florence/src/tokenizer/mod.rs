pub mod export;
pub mod interactive;
pub mod onnx_proto;

use anyhow::anyhow;
use ndarray::Array2;
use std::path::Path;
use tokenizers::{utils::truncation::TruncationParams, Tokenizer};

// https://discuss.huggingface.co/t/bart-input-confusion/1103/2
pub const TOKENIZER_MAX_LENGTH: usize = 1024;

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub pad: u32,
    pub unk: u32,
}

#[derive(Debug, Clone)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

/// Right padded batch, ready to be fed to an ONNX session.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
}

pub struct FlorenceTokenizer {
    tokenizer: Tokenizer,
    special_tokens: SpecialTokens,
}

impl FlorenceTokenizer {
    pub fn from_file(tokenizer_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref()).map_err(|e| {
            anyhow!(
                "failed to initialize tokenizer from {}: {}",
                tokenizer_path.as_ref().display(),
                e
            )
        })?;
        Self::new(tokenizer)
    }

    pub fn new(mut tokenizer: Tokenizer) -> anyhow::Result<Self> {
        let truncation = TruncationParams {
            max_length: TOKENIZER_MAX_LENGTH,
            ..Default::default()
        };
        tokenizer.with_truncation(Some(truncation)).ok();

        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or(anyhow!("special token {} not found in vocabulary", token))
        };
        let special_tokens = SpecialTokens {
            bos: lookup(BOS_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
            pad: lookup(PAD_TOKEN)?,
            unk: lookup(UNK_TOKEN)?,
        };

        Ok(Self {
            tokenizer,
            special_tokens,
        })
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn token_id(&self, token: &str) -> anyhow::Result<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or(anyhow!("token {} not found in vocabulary", token))
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Encoded> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!(e))?;

        Ok(Encoded {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    pub fn encode_batch(&self, texts: &[&str]) -> anyhow::Result<EncodedBatch> {
        let encoded = texts
            .iter()
            .map(|text| self.encode(text))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(pad_batch(&encoded, self.special_tokens.pad))
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("failed to decode: {}", e))
    }
}

fn pad_batch(encoded: &[Encoded], pad_id: u32) -> EncodedBatch {
    let max_len = encoded.iter().map(|e| e.ids.len()).max().unwrap_or(0);

    let input_ids = Array2::from_shape_fn((encoded.len(), max_len), |(b, t)| {
        encoded[b].ids.get(t).copied().unwrap_or(pad_id) as i64
    });
    let attention_mask = Array2::from_shape_fn((encoded.len(), max_len), |(b, t)| {
        encoded[b].attention_mask.get(t).copied().unwrap_or(0) as i64
    });

    EncodedBatch {
        input_ids,
        attention_mask,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::str::FromStr;

    /// Tiny byte-level BPE tokenizer with the Florence special tokens.
    pub(crate) const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 3, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 12, "content": "<loc_0>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true},
        "post_processor": {
            "type": "RobertaProcessing",
            "sep": ["</s>", 2],
            "cls": ["<s>", 0],
            "trim_offsets": true,
            "add_prefix_space": false
        },
        "decoder": {"type": "ByteLevel", "add_prefix_space": true, "trim_offsets": true, "use_regex": true},
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": "",
            "end_of_word_suffix": "",
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": {
                "<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3,
                "a": 4, "b": 5, "c": 6, "Ġ": 7, "ab": 8, "Ġc": 9, "abc": 10, "Ġab": 11
            },
            "merges": ["a b", "Ġ c", "ab c", "Ġ ab"]
        }
    }"#;

    pub(crate) fn test_tokenizer() -> FlorenceTokenizer {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).unwrap();
        FlorenceTokenizer::new(tokenizer).unwrap()
    }

    #[test]
    fn test_special_tokens() {
        let tokenizer = test_tokenizer();
        assert_eq!(
            tokenizer.special_tokens(),
            SpecialTokens {
                bos: 0,
                eos: 2,
                pad: 1,
                unk: 3
            }
        );
        assert_eq!(tokenizer.token_id("<loc_0>").unwrap(), 12);
        assert!(tokenizer.token_id("<loc_999>").is_err());
    }

    #[test]
    fn test_encode_wraps_with_bos_and_eos() {
        let tokenizer = test_tokenizer();
        let encoded = tokenizer.encode("abc").unwrap();

        assert_eq!(encoded.ids, vec![0, 10, 2]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1]);
    }

    #[test]
    fn test_encode_batch_pads_right() {
        let tokenizer = test_tokenizer();
        let batch = tokenizer.encode_batch(&["abc", "ab c"]).unwrap();

        assert_eq!(batch.input_ids.shape(), &[2, 4]);
        assert_eq!(batch.input_ids.row(0).to_vec(), vec![0, 10, 2, 1]);
        assert_eq!(batch.attention_mask.row(0).to_vec(), vec![1, 1, 1, 0]);
        assert_eq!(batch.input_ids.row(1).to_vec(), vec![0, 8, 9, 2]);
        assert_eq!(batch.attention_mask.row(1).to_vec(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_decode_keeps_or_skips_special_tokens() {
        let tokenizer = test_tokenizer();

        assert_eq!(tokenizer.decode(&[0, 10, 2], true).unwrap(), "abc");
        assert!(tokenizer
            .decode(&[0, 10, 2], false)
            .unwrap()
            .contains("</s>"));
    }
}
