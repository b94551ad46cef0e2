//! Export the tokenizer as ONNX pre/post-processing graphs.
//!
//! The graphs contain a single `ai.onnx.contrib` custom op each, so they need
//! onnxruntime-extensions registered on the consuming session.

use super::{
    onnx_proto::{
        AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorDataType,
        ValueInfoProto,
    },
    FlorenceTokenizer,
};
use prost::Message;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const ENCODE_MODEL_FILE: &str = "florence2_tokenizer_encode.onnx";
pub const DECODE_MODEL_FILE: &str = "florence2_tokenizer_decode.onnx";
pub const DECODE_SKIP_SPECIAL_TOKENS_MODEL_FILE: &str =
    "florence2_tokenizer_decode_skip_special_tokens.onnx";

const CONTRIB_DOMAIN: &str = "ai.onnx.contrib";
const IR_VERSION: i64 = 8;
const DEFAULT_OPSET: i64 = 16;
const CONTRIB_OPSET: i64 = 1;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("invalid tokenizer json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to serialize tokenizer: {0}")]
    Serialize(String),

    #[error("tokenizer model is {0}, only BPE can be exported")]
    UnsupportedModel(String),

    #[error("tokenizer json is missing {0}")]
    MissingField(&'static str),

    #[error("malformed merge entry: {0}")]
    MalformedMerge(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedToken {
    pub id: u32,
    pub content: String,
    pub special: bool,
}

/// Byte-level BPE tables of a tokenizer.
#[derive(Debug, Clone, Default)]
pub struct BpeAssets {
    pub vocab: BTreeMap<String, u32>,
    /// In rank order.
    pub merges: Vec<(String, String)>,
    pub added_tokens: Vec<AddedToken>,
}

impl BpeAssets {
    pub fn from_tokenizer(tokenizer: &FlorenceTokenizer) -> Result<Self, ExportError> {
        let json = tokenizer
            .inner()
            .to_string(false)
            .map_err(|e| ExportError::Serialize(e.to_string()))?;
        Self::from_tokenizer_json(&json)
    }

    pub fn from_tokenizer_json(json: &str) -> Result<Self, ExportError> {
        let root: Value = serde_json::from_str(json)?;
        let model = root.get("model").ok_or(ExportError::MissingField("model"))?;

        let model_type = model.get("type").and_then(Value::as_str).unwrap_or("BPE");
        if model_type != "BPE" {
            return Err(ExportError::UnsupportedModel(model_type.to_string()));
        }

        let vocab = model
            .get("vocab")
            .and_then(Value::as_object)
            .ok_or(ExportError::MissingField("model.vocab"))?
            .iter()
            .filter_map(|(token, id)| id.as_u64().map(|id| (token.clone(), id as u32)))
            .collect();

        let merges = model
            .get("merges")
            .and_then(Value::as_array)
            .ok_or(ExportError::MissingField("model.merges"))?
            .iter()
            .map(parse_merge)
            .collect::<Result<Vec<_>, _>>()?;

        let added_tokens = root
            .get("added_tokens")
            .and_then(Value::as_array)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|token| {
                        Some(AddedToken {
                            id: token.get("id")?.as_u64()? as u32,
                            content: token.get("content")?.as_str()?.to_string(),
                            special: token
                                .get("special")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            vocab,
            merges,
            added_tokens,
        })
    }

    fn vocab_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string(&self.vocab)?)
    }

    fn merges_text(&self) -> String {
        self.merges
            .iter()
            .map(|(a, b)| format!("{} {}", a, b))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One line per id, so line `n` holds the token with id `n`. Ids missing
    /// from the vocab get an empty line.
    fn id_vocab_text(&self) -> String {
        let len = self.vocab.values().max().map_or(0, |id| *id as usize + 1);
        let mut lines = vec![""; len];
        for (token, id) in &self.vocab {
            lines[*id as usize] = token.as_str();
        }
        lines.join("\n")
    }

    fn added_tokens_text(&self) -> String {
        let mut tokens: Vec<&AddedToken> = self.added_tokens.iter().collect();
        tokens.sort_by_key(|t| t.id);
        tokens
            .into_iter()
            .map(|t| format!("{}\t{}", t.id, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn special_ids_text(&self) -> String {
        let mut ids: Vec<u32> = self
            .added_tokens
            .iter()
            .filter(|t| t.special)
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_merge(entry: &Value) -> Result<(String, String), ExportError> {
    match entry {
        Value::String(merge) => merge
            .split_once(' ')
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .ok_or(ExportError::MalformedMerge(merge.clone())),
        Value::Array(pair) => match pair.as_slice() {
            [Value::String(a), Value::String(b)] => Ok((a.clone(), b.clone())),
            _ => Err(ExportError::MalformedMerge(entry.to_string())),
        },
        _ => Err(ExportError::MalformedMerge(entry.to_string())),
    }
}

/// GPT-2 byte to unicode table, in the order the python tokenizers iterate it.
pub fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bytes: Vec<u32> = (u32::from('!')..=u32::from('~'))
        .chain(u32::from('¡')..=u32::from('¬'))
        .chain(u32::from('®')..=u32::from('ÿ'))
        .collect();
    let mut chars = bytes.clone();

    let mut n = 0;
    for b in 0..256u32 {
        if !bytes.contains(&b) {
            bytes.push(b);
            chars.push(256 + n);
            n += 1;
        }
    }

    bytes
        .into_iter()
        .zip(chars)
        .filter_map(|(b, c)| char::from_u32(c).map(|c| (b as u8, c)))
        .collect()
}

fn byte_decoder_text() -> String {
    bytes_to_unicode()
        .into_iter()
        .map(|(b, c)| format!("{}\t{}", u32::from(c), b))
        .collect::<Vec<_>>()
        .join("\n")
}

fn single_node_model(
    graph_name: &str,
    node: NodeProto,
    input: ValueInfoProto,
    outputs: Vec<ValueInfoProto>,
) -> ModelProto {
    ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![
            OperatorSetIdProto {
                domain: String::new(),
                version: DEFAULT_OPSET,
            },
            OperatorSetIdProto {
                domain: CONTRIB_DOMAIN.to_string(),
                version: CONTRIB_OPSET,
            },
        ],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(GraphProto {
            node: vec![node],
            name: graph_name.to_string(),
            input: vec![input],
            output: outputs,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `input_text: string[N]` -> `input_ids, attention_mask: int64[N, M]`
pub fn encode_model(assets: &BpeAssets) -> Result<ModelProto, ExportError> {
    let node = NodeProto {
        input: vec!["input_text".to_string()],
        output: vec!["input_ids".to_string(), "attention_mask".to_string()],
        name: "RobertaTokenizer_1".to_string(),
        op_type: "RobertaTokenizer".to_string(),
        domain: CONTRIB_DOMAIN.to_string(),
        attribute: vec![
            AttributeProto::string("vocab", assets.vocab_json()?),
            AttributeProto::string("merges", assets.merges_text()),
        ],
        ..Default::default()
    };

    Ok(single_node_model(
        "florence2_tokenizer_encode",
        node,
        ValueInfoProto::tensor("input_text", TensorDataType::String, &["batch_size"]),
        vec![
            ValueInfoProto::tensor(
                "input_ids",
                TensorDataType::Int64,
                &["batch_size", "sequence_length"],
            ),
            ValueInfoProto::tensor(
                "attention_mask",
                TensorDataType::Int64,
                &["batch_size", "sequence_length"],
            ),
        ],
    ))
}

/// `ids: int64[M]` -> `str: string[1]`
pub fn decode_model(assets: &BpeAssets, skip_special_tokens: bool) -> ModelProto {
    let node = NodeProto {
        input: vec!["ids".to_string()],
        output: vec!["str".to_string()],
        name: "BpeDecoder_1".to_string(),
        op_type: "BpeDecoder".to_string(),
        domain: CONTRIB_DOMAIN.to_string(),
        attribute: vec![
            AttributeProto::string("id_vocab", assets.id_vocab_text()),
            AttributeProto::string("byte_decoder", byte_decoder_text()),
            AttributeProto::string("added_tokens", assets.added_tokens_text()),
            AttributeProto::string("all_special_ids", assets.special_ids_text()),
            AttributeProto::int("skip_special_tokens", skip_special_tokens as i64),
        ],
        ..Default::default()
    };

    single_node_model(
        "florence2_tokenizer_decode",
        node,
        ValueInfoProto::tensor("ids", TensorDataType::Int64, &["sequence_length"]),
        vec![ValueInfoProto::tensor(
            "str",
            TensorDataType::String,
            &["text_count"],
        )],
    )
}

pub fn save_model(model: &ModelProto, path: impl AsRef<Path>) -> Result<(), ExportError> {
    std::fs::write(path.as_ref(), model.encode_to_vec())?;
    info!("onnx model saved to {}", path.as_ref().display());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExportedFiles {
    pub encode: PathBuf,
    pub decode: PathBuf,
    pub decode_skip_special_tokens: PathBuf,
}

#[tracing::instrument(skip_all, fields(out_dir = %out_dir.as_ref().display()))]
pub fn export_tokenizer(
    tokenizer: &FlorenceTokenizer,
    out_dir: impl AsRef<Path>,
) -> Result<ExportedFiles, ExportError> {
    let assets = BpeAssets::from_tokenizer(tokenizer)?;
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir)?;

    let files = ExportedFiles {
        encode: out_dir.join(ENCODE_MODEL_FILE),
        decode: out_dir.join(DECODE_MODEL_FILE),
        decode_skip_special_tokens: out_dir.join(DECODE_SKIP_SPECIAL_TOKENS_MODEL_FILE),
    };

    save_model(&encode_model(&assets)?, &files.encode)?;
    save_model(&decode_model(&assets, false), &files.decode)?;
    save_model(
        &decode_model(&assets, true),
        &files.decode_skip_special_tokens,
    )?;

    Ok(files)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tokenizer::onnx_proto::AttributeType;
    use crate::tokenizer::test::{test_tokenizer, TOKENIZER_JSON};

    fn attribute<'a>(model: &'a ModelProto, name: &str) -> &'a AttributeProto {
        model.graph.as_ref().unwrap().node[0]
            .attribute
            .iter()
            .find(|a| a.name == name)
            .unwrap()
    }

    fn string_attribute(model: &ModelProto, name: &str) -> String {
        String::from_utf8(attribute(model, name).s.clone()).unwrap()
    }

    #[test]
    fn test_assets_from_tokenizer_json() {
        let assets = BpeAssets::from_tokenizer_json(TOKENIZER_JSON).unwrap();

        assert_eq!(assets.vocab.len(), 12);
        assert_eq!(assets.vocab["Ġab"], 11);
        assert_eq!(assets.merges[0], ("a".to_string(), "b".to_string()));
        assert_eq!(assets.merges.len(), 4);
        assert_eq!(assets.added_tokens.len(), 5);
        assert!(assets.added_tokens.iter().all(|t| t.special));
    }

    #[test]
    fn test_merges_accept_pairs() {
        let json = r#"{"model": {"type": "BPE", "vocab": {"a": 0}, "merges": [["a", "b"], "c d"]}}"#;
        let assets = BpeAssets::from_tokenizer_json(json).unwrap();

        assert_eq!(assets.merges_text(), "a b\nc d");
        assert!(assets.added_tokens.is_empty());
    }

    #[test]
    fn test_id_vocab_keeps_ids_on_their_line() {
        let json = r#"{"model": {"type": "BPE", "vocab": {"a": 0, "b": 1, "d": 3, "e": 4}, "merges": []}}"#;
        let assets = BpeAssets::from_tokenizer_json(json).unwrap();

        let text = assets.id_vocab_text();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines, vec!["a", "b", "", "d", "e"]);

        let decode = decode_model(&assets, false);
        assert_eq!(string_attribute(&decode, "id_vocab"), "a\nb\n\nd\ne");
    }

    #[test]
    fn test_rejects_non_bpe_models() {
        let json = r#"{"model": {"type": "WordPiece", "vocab": {}}}"#;
        let err = BpeAssets::from_tokenizer_json(json).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedModel(model) if model == "WordPiece"));

        let json = r#"{"model": {"type": "BPE", "vocab": {}, "merges": ["ab"]}}"#;
        let err = BpeAssets::from_tokenizer_json(json).unwrap_err();
        assert!(matches!(err, ExportError::MalformedMerge(_)));
    }

    #[test]
    fn test_byte_decoder_covers_all_bytes() {
        let table = bytes_to_unicode();
        assert_eq!(table.len(), 256);
        assert_eq!(table[0], (b'!', '!'));
        assert!(table.contains(&(b' ', 'Ġ')));
        assert!(table.contains(&(b'\n', 'Ċ')));

        let text = byte_decoder_text();
        assert_eq!(text.lines().count(), 256);
        assert!(text.lines().any(|line| line == "288\t32"));
    }

    #[test]
    fn test_encode_model_layout() {
        let assets = BpeAssets::from_tokenizer_json(TOKENIZER_JSON).unwrap();
        let model = encode_model(&assets).unwrap();

        let decoded = ModelProto::decode(model.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, model);

        let graph = decoded.graph.as_ref().unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "RobertaTokenizer");
        assert_eq!(graph.node[0].domain, CONTRIB_DOMAIN);
        assert_eq!(graph.input[0].name, "input_text");
        assert_eq!(
            graph.output.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            vec!["input_ids", "attention_mask"]
        );
        assert!(decoded
            .opset_import
            .iter()
            .any(|o| o.domain == CONTRIB_DOMAIN && o.version == 1));

        let vocab: BTreeMap<String, u32> =
            serde_json::from_str(&string_attribute(&decoded, "vocab")).unwrap();
        assert_eq!(vocab, assets.vocab);
        assert_eq!(
            string_attribute(&decoded, "merges"),
            "a b\nĠ c\nab c\nĠ ab"
        );
    }

    #[test]
    fn test_decode_model_layout() {
        let assets = BpeAssets::from_tokenizer_json(TOKENIZER_JSON).unwrap();
        let model = decode_model(&assets, true);

        let graph = model.graph.as_ref().unwrap();
        assert_eq!(graph.node[0].op_type, "BpeDecoder");
        assert_eq!(graph.input[0].name, "ids");
        assert_eq!(graph.output[0].name, "str");

        let id_vocab = string_attribute(&model, "id_vocab");
        assert_eq!(id_vocab.lines().next(), Some("<s>"));
        assert_eq!(id_vocab.lines().nth(11), Some("Ġab"));
        assert_eq!(string_attribute(&model, "all_special_ids"), "0\n1\n2\n3\n12");
        assert!(string_attribute(&model, "added_tokens").ends_with("12\t<loc_0>"));

        let skip = attribute(&model, "skip_special_tokens");
        assert_eq!(skip.r#type, AttributeType::Int as i32);
        assert_eq!(skip.i, 1);
        assert_eq!(attribute(&decode_model(&assets, false), "skip_special_tokens").i, 0);
    }

    #[test]
    fn test_export_tokenizer_writes_three_files() {
        let tokenizer = test_tokenizer();
        let out_dir = std::env::temp_dir().join(format!("florence-export-{}", std::process::id()));

        let files = export_tokenizer(&tokenizer, &out_dir).unwrap();

        for path in [&files.encode, &files.decode, &files.decode_skip_special_tokens] {
            let bytes = std::fs::read(path).unwrap();
            let model = ModelProto::decode(bytes.as_slice()).unwrap();
            assert_eq!(model.ir_version, IR_VERSION);
        }
        assert_eq!(files.encode.file_name().unwrap(), ENCODE_MODEL_FILE);
        assert_eq!(files.decode.file_name().unwrap(), DECODE_MODEL_FILE);

        std::fs::remove_dir_all(out_dir).ok();
    }
}
