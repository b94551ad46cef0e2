mod config;
pub mod postprocess;
pub mod preprocess;
mod task;

pub use config::*;
pub use postprocess::{ImageSize, TaskAnswer};
pub use task::*;

use crate::{
    device::Device,
    generation::{self, SearchParams, Seq2SeqDecoder},
    ort::{load_onnx_model, ONNXModelConfig},
    tokenizer::FlorenceTokenizer,
    traits::CaptionInput,
    Model,
};
use anyhow::{anyhow, bail};
use image::DynamicImage;
use ndarray::{concatenate, s, Array2, Array3, Array4, Axis, Ix3};
use ort::{GraphOptimizationLevel, Session};
use tracing::{debug, info};

pub struct Florence2 {
    tokenizer: FlorenceTokenizer,
    embed_tokens: Session,
    vision_encoder: Session,
    encoder: Session,
    decoder: Session,
    search_params: SearchParams,
    device: Device,
}

impl Model for Florence2 {
    type Item = CaptionInput;
    type Output = TaskAnswer;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            bail!("too many items");
        }

        let mut results = vec![];

        for item in items {
            let res = self.run_task(&item.image, item.task, item.text_input.as_deref());
            results.push(res);
        }

        Ok(results)
    }
}

impl Florence2 {
    /// Download whatever is missing from the hub, then load every session.
    pub async fn new(config: Florence2Config) -> anyhow::Result<Self> {
        let files = config.download_files().await?;
        let device = Device::resolve(config.device);
        info!("loading {} on {}", config.repo.id, device);

        let tokenizer = FlorenceTokenizer::from_file(&files.tokenizer)?;
        let search_params = config
            .generation
            .search_params(tokenizer.special_tokens())?;

        let onnx_config = || ONNXModelConfig {
            num_intra_thread: config.num_intra_thread,
            optimization_level: GraphOptimizationLevel::Level3,
            device,
        };

        Ok(Self {
            tokenizer,
            embed_tokens: load_onnx_model(&files.embed_tokens, Some(onnx_config()))?,
            vision_encoder: load_onnx_model(&files.vision_encoder, Some(onnx_config()))?,
            encoder: load_onnx_model(&files.encoder, Some(onnx_config()))?,
            decoder: load_onnx_model(&files.decoder, Some(onnx_config()))?,
            search_params,
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn tokenizer(&self) -> &FlorenceTokenizer {
        &self.tokenizer
    }

    pub fn generate_caption(&self, image_data: &[u8]) -> anyhow::Result<String> {
        self.caption(image_data, Task::Caption)
    }

    pub fn generate_detailed_caption(&self, image_data: &[u8]) -> anyhow::Result<String> {
        self.caption(image_data, Task::DetailedCaption)
    }

    pub fn generate_more_detailed_caption(&self, image_data: &[u8]) -> anyhow::Result<String> {
        self.caption(image_data, Task::MoreDetailedCaption)
    }

    fn caption(&self, image_data: &[u8], task: Task) -> anyhow::Result<String> {
        match self.run_task(image_data, task, None)? {
            TaskAnswer::Text(text) => Ok(text),
            answer => Err(anyhow!("unexpected answer for {}: {:?}", task, answer)),
        }
    }

    #[tracing::instrument(skip(self, image_data, task), fields(task = %task))]
    pub fn run_task(
        &self,
        image_data: &[u8],
        task: Task,
        text_input: Option<&str>,
    ) -> anyhow::Result<TaskAnswer> {
        let image = preprocess::load_image(image_data)?;
        self.run_task_on_image(&image, task, text_input)
    }

    pub fn run_task_on_image(
        &self,
        image: &DynamicImage,
        task: Task,
        text_input: Option<&str>,
    ) -> anyhow::Result<TaskAnswer> {
        let prompt = task.prompt(text_input)?;
        let text = self.generate_text(image, &prompt)?;
        debug!("generated text: {}", text);

        let image_size = ImageSize {
            width: image.width(),
            height: image.height(),
        };
        postprocess::post_process(&text, task, image_size)
    }

    /// The raw generated text, special tokens included.
    pub fn generate_text(&self, image: &DynamicImage, prompt: &str) -> anyhow::Result<String> {
        let encoded = self.tokenizer.encode_batch(&[prompt])?;
        let text_embeds = embed_tokens(&self.embed_tokens, &encoded.input_ids)?;

        let pixel_values = preprocess::preprocess_image(image);
        let image_features = self.encode_image(&pixel_values)?;

        let (inputs_embeds, attention_mask) =
            merge_image_features(&image_features, &text_embeds, &encoded.attention_mask)?;
        let encoder_hidden_states = self.encode(&inputs_embeds, &attention_mask)?;

        let mut decoder = FlorenceDecoder::new(
            &self.embed_tokens,
            &self.decoder,
            &encoder_hidden_states,
            &attention_mask,
        );
        let tokens = generation::generate(&mut decoder, &self.search_params)?;
        debug!("generated {} tokens", tokens.len());

        self.tokenizer.decode(&tokens, false)
    }

    fn encode_image(&self, pixel_values: &Array4<f32>) -> anyhow::Result<Array3<f32>> {
        let outputs = self
            .vision_encoder
            .run(ort::inputs!["pixel_values" => pixel_values.view()]?)?;

        let image_features = outputs
            .get("image_features")
            .ok_or(anyhow!("image_features not found"))?
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();

        Ok(image_features)
    }

    fn encode(
        &self,
        inputs_embeds: &Array3<f32>,
        attention_mask: &Array2<i64>,
    ) -> anyhow::Result<Array3<f32>> {
        let outputs = self.encoder.run(ort::inputs![
            "inputs_embeds" => inputs_embeds.view(),
            "attention_mask" => attention_mask.view(),
        ]?)?;

        let last_hidden_state = outputs
            .get("last_hidden_state")
            .ok_or(anyhow!("last_hidden_state not found"))?
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();

        Ok(last_hidden_state)
    }
}

fn embed_tokens(session: &Session, input_ids: &Array2<i64>) -> anyhow::Result<Array3<f32>> {
    let outputs = session.run(ort::inputs!["input_ids" => input_ids.view()]?)?;

    let inputs_embeds = outputs
        .get("inputs_embeds")
        .ok_or(anyhow!("inputs_embeds not found"))?
        .try_extract_tensor::<f32>()?
        .into_dimensionality::<Ix3>()?
        .to_owned();

    Ok(inputs_embeds)
}

/// Image features go first, the image part of the mask is all ones.
fn merge_image_features(
    image_features: &Array3<f32>,
    text_embeds: &Array3<f32>,
    text_attention_mask: &Array2<i64>,
) -> anyhow::Result<(Array3<f32>, Array2<i64>)> {
    let (batch_size, image_len, _) = image_features.dim();
    if text_embeds.dim().0 != batch_size || text_attention_mask.dim().0 != batch_size {
        bail!("image and text batch sizes differ");
    }

    let inputs_embeds = concatenate(Axis(1), &[image_features.view(), text_embeds.view()])?;
    let image_attention_mask = Array2::<i64>::ones((batch_size, image_len));
    let attention_mask = concatenate(
        Axis(1),
        &[image_attention_mask.view(), text_attention_mask.view()],
    )?;

    Ok((inputs_embeds, attention_mask))
}

/// Runs the decoder over the full sequence at every step.
struct FlorenceDecoder<'a> {
    embed_tokens: &'a Session,
    decoder: &'a Session,
    encoder_hidden_states: &'a Array3<f32>,
    encoder_attention_mask: &'a Array2<i64>,
    // encoder outputs repeated for the current number of beams
    batched: Option<(Array3<f32>, Array2<i64>)>,
}

impl<'a> FlorenceDecoder<'a> {
    fn new(
        embed_tokens: &'a Session,
        decoder: &'a Session,
        encoder_hidden_states: &'a Array3<f32>,
        encoder_attention_mask: &'a Array2<i64>,
    ) -> Self {
        Self {
            embed_tokens,
            decoder,
            encoder_hidden_states,
            encoder_attention_mask,
            batched: None,
        }
    }

    fn ensure_batched(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if let Some((hidden_states, _)) = &self.batched {
            if hidden_states.dim().0 == batch_size {
                return Ok(());
            }
        }

        let (_, seq_len, hidden_size) = self.encoder_hidden_states.dim();
        let hidden_states = self
            .encoder_hidden_states
            .broadcast((batch_size, seq_len, hidden_size))
            .ok_or(anyhow!("cannot repeat encoder hidden states"))?
            .to_owned();
        let attention_mask = self
            .encoder_attention_mask
            .broadcast((batch_size, seq_len))
            .ok_or(anyhow!("cannot repeat encoder attention mask"))?
            .to_owned();

        self.batched = Some((hidden_states, attention_mask));
        Ok(())
    }
}

impl Seq2SeqDecoder for FlorenceDecoder<'_> {
    fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> anyhow::Result<Array2<f32>> {
        let batch_size = sequences.len();
        let seq_len = sequences.first().map_or(0, Vec::len);
        if seq_len == 0 {
            bail!("nothing to decode");
        }
        if sequences.iter().any(|s| s.len() != seq_len) {
            bail!("sequences must have the same length");
        }

        let input_ids =
            Array2::from_shape_fn((batch_size, seq_len), |(b, t)| sequences[b][t] as i64);
        let inputs_embeds = embed_tokens(self.embed_tokens, &input_ids)?;

        self.ensure_batched(batch_size)?;
        let (hidden_states, attention_mask) = self
            .batched
            .as_ref()
            .ok_or(anyhow!("encoder outputs missing"))?;

        let outputs = self.decoder.run(ort::inputs![
            "encoder_attention_mask" => attention_mask.view(),
            "encoder_hidden_states" => hidden_states.view(),
            "inputs_embeds" => inputs_embeds.view(),
        ]?)?;

        let logits = outputs
            .get("logits")
            .ok_or(anyhow!("logits not found"))?
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix3>()?;

        Ok(logits.slice(s![.., seq_len - 1, ..]).to_owned())
    }
}
