use super::AIModel;
use crate::florence2::{Task, TaskAnswer};
use std::fmt;

#[derive(Clone)]
pub struct CaptionInput {
    /// Encoded image, any format the `image` crate can guess.
    pub image: Vec<u8>,
    pub task: Task,
    pub text_input: Option<String>,
}

impl CaptionInput {
    pub fn new(image: Vec<u8>, task: Task) -> Self {
        Self {
            image,
            task,
            text_input: None,
        }
    }

    pub fn with_text_input(mut self, text_input: impl Into<String>) -> Self {
        self.text_input = Some(text_input.into());
        self
    }
}

// image bytes are left out of logs
impl fmt::Debug for CaptionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptionInput")
            .field("image_bytes", &self.image.len())
            .field("task", &self.task)
            .field("text_input", &self.text_input)
            .finish()
    }
}

pub type ImageCaptionOutput = TaskAnswer;
pub type ImageCaptionModel = AIModel<CaptionInput, ImageCaptionOutput>;
