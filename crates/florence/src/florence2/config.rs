use crate::{device::Device, generation::GenerationConfig, tokenizer::FlorenceTokenizer};
use file_downloader::{FileDownload, FileDownloadConfig, HubRepo};
use std::path::{Path, PathBuf};

pub const DEFAULT_REPO: &str = "onnx-community/Florence-2-large";
pub const DEFAULT_REVISION: &str = "main";

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const EMBED_TOKENS_FILE: &str = "onnx/embed_tokens.onnx";
pub const VISION_ENCODER_FILE: &str = "onnx/vision_encoder.onnx";
pub const ENCODER_FILE: &str = "onnx/encoder_model.onnx";
pub const DECODER_FILE: &str = "onnx/decoder_model.onnx";

#[derive(Debug, Clone)]
pub struct Florence2Config {
    pub repo: HubRepo,
    pub hub_url: Option<String>,
    pub resources_dir: PathBuf,
    /// Detected from the ONNX Runtime build when empty.
    pub device: Option<Device>,
    pub generation: GenerationConfig,
    pub num_intra_thread: usize,
}

impl Default for Florence2Config {
    fn default() -> Self {
        Self {
            repo: HubRepo::new(DEFAULT_REPO, DEFAULT_REVISION),
            hub_url: None,
            resources_dir: PathBuf::from("resources"),
            device: None,
            generation: GenerationConfig::default(),
            num_intra_thread: 16,
        }
    }
}

impl Florence2Config {
    fn file_download(&self) -> FileDownload {
        let mut config = FileDownloadConfig {
            resources_dir: self.resources_dir.clone(),
            ..Default::default()
        };
        if let Some(url) = &self.hub_url {
            config.url = url.clone();
        }
        FileDownload::new(config)
    }

    pub fn local_dir(&self) -> PathBuf {
        self.resources_dir.join(&self.repo.id)
    }

    /// Download the files that are not cached yet.
    pub async fn download_files(&self) -> anyhow::Result<Florence2Files> {
        let download = self.file_download();
        for file in Florence2Files::FILES {
            download
                .download_repo_file_if_not_exists(&self.repo, file)
                .await?;
        }

        Ok(Florence2Files::in_dir(self.local_dir()))
    }

    pub async fn load_tokenizer(&self) -> anyhow::Result<FlorenceTokenizer> {
        let path = self
            .file_download()
            .download_repo_file_if_not_exists(&self.repo, TOKENIZER_FILE)
            .await?;
        FlorenceTokenizer::from_file(path)
    }
}

/// Local paths of everything the pipeline loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Florence2Files {
    pub tokenizer: PathBuf,
    pub embed_tokens: PathBuf,
    pub vision_encoder: PathBuf,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
}

impl Florence2Files {
    pub const FILES: [&'static str; 5] = [
        TOKENIZER_FILE,
        EMBED_TOKENS_FILE,
        VISION_ENCODER_FILE,
        ENCODER_FILE,
        DECODER_FILE,
    ];

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            tokenizer: dir.join(TOKENIZER_FILE),
            embed_tokens: dir.join(EMBED_TOKENS_FILE),
            vision_encoder: dir.join(VISION_ENCODER_FILE),
            encoder: dir.join(ENCODER_FILE),
            decoder: dir.join(DECODER_FILE),
        }
    }
}
