use anyhow::{anyhow, bail};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};

pub struct FileDownloadConfig {
    pub url: String,
    pub resources_dir: PathBuf,
}

impl Default for FileDownloadConfig {
    fn default() -> Self {
        Self {
            url: "https://huggingface.co".to_string(),
            resources_dir: PathBuf::from("resources"),
        }
    }
}

/// A model repository on the hub, pinned to a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRepo {
    pub id: String,
    pub revision: String,
}

impl HubRepo {
    pub fn new(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
        }
    }

    /// Remote uri of a file, relative to the hub base url.
    pub fn file_uri(&self, file: &str) -> String {
        format!("{}/resolve/{}/{}", self.id, self.revision, file)
    }

    /// Where the file lives inside the resources dir.
    pub fn local_path(&self, resources_dir: impl AsRef<Path>, file: &str) -> PathBuf {
        resources_dir.as_ref().join(&self.id).join(file)
    }
}

pub struct FileDownload {
    url: String,
    resources_dir: PathBuf,
}

impl FileDownload {
    pub fn new(config: FileDownloadConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            resources_dir: config.resources_dir,
        }
    }

    fn download_url(&self, uri: &str) -> String {
        format!("{}/{}", self.url, uri.trim_start_matches('/'))
    }

    pub async fn download_to_path_if_not_exists(
        &self,
        uri: &str,
        file_path: impl AsRef<Path>,
    ) -> anyhow::Result<PathBuf> {
        let file_path = file_path.as_ref().to_path_buf();
        debug!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Ok(file_path);
        }

        let temp_download_path = file_path.with_extension("temp");
        let download_url = self.download_url(uri);
        info!("downloading {}", download_url);

        let mut response = reqwest::get(&download_url).await?;
        if !response.status().is_success() {
            bail!(
                "failed to download {}: status {}",
                download_url,
                response.status()
            );
        }

        // create parent folder
        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir).await?;
        }

        let mut file = File::create(&temp_download_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        fs::rename(&temp_download_path, &file_path).await?;

        info!("file {:?} downloaded", file_path);

        Ok(file_path)
    }

    /// Download a file of a hub repo into `<resources_dir>/<repo>/<file>`.
    pub async fn download_repo_file_if_not_exists(
        &self,
        repo: &HubRepo,
        file: &str,
    ) -> anyhow::Result<PathBuf> {
        let file_path = repo.local_path(&self.resources_dir, file);
        self.download_to_path_if_not_exists(&repo.file_uri(file), file_path)
            .await
    }
}

/// Fetch the raw body of an url, without caching it on disk.
pub async fn fetch_bytes(url: &str) -> anyhow::Result<Vec<u8>> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("failed to fetch {}: status {}", url, status));
    }
    let bytes = response.bytes().await?;
    debug!("fetched {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}
