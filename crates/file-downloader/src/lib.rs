mod download;
pub use download::*;

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answers a single http request, returns the base url.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![];
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn temp_resources_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "file-downloader-{}-{}",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn test_hub_repo_paths() {
        let repo = HubRepo::new("onnx-community/Florence-2-large", "main");

        assert_eq!(
            repo.file_uri("onnx/decoder_model.onnx"),
            "onnx-community/Florence-2-large/resolve/main/onnx/decoder_model.onnx"
        );
        assert_eq!(
            repo.local_path("resources", "tokenizer.json"),
            PathBuf::from("resources/onnx-community/Florence-2-large/tokenizer.json")
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_existing_file_is_not_downloaded() {
        let resources_dir = std::env::temp_dir().join(format!(
            "file-downloader-test-{}",
            std::process::id()
        ));
        let repo = HubRepo::new("some/repo", "main");
        let file_path = repo.local_path(&resources_dir, "tokenizer.json");
        std::fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        std::fs::write(&file_path, b"{}").unwrap();

        // unreachable url, so any network access would fail the test
        let download = FileDownload::new(FileDownloadConfig {
            url: "http://127.0.0.1:9".to_string(),
            resources_dir: resources_dir.clone(),
        });
        let res = download
            .download_repo_file_if_not_exists(&repo, "tokenizer.json")
            .await;

        assert_eq!(res.unwrap(), file_path);
        std::fs::remove_dir_all(resources_dir).ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_download_writes_through_temp_file() {
        let resources_dir = temp_resources_dir("ok");
        let download = FileDownload::new(FileDownloadConfig {
            url: serve_once("200 OK", b"{\"version\": \"1.0\"}").await,
            resources_dir: resources_dir.clone(),
        });
        let repo = HubRepo::new("some/repo", "main");

        let file_path = download
            .download_repo_file_if_not_exists(&repo, "tokenizer.json")
            .await
            .unwrap();

        assert_eq!(file_path, repo.local_path(&resources_dir, "tokenizer.json"));
        assert_eq!(std::fs::read(&file_path).unwrap(), b"{\"version\": \"1.0\"}");
        assert!(!file_path.with_extension("temp").exists());
        std::fs::remove_dir_all(resources_dir).ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_download_fails_on_error_status() {
        let resources_dir = temp_resources_dir("not-found");
        let download = FileDownload::new(FileDownloadConfig {
            url: serve_once("404 Not Found", b"missing").await,
            resources_dir: resources_dir.clone(),
        });
        let repo = HubRepo::new("some/repo", "main");

        let res = download
            .download_repo_file_if_not_exists(&repo, "tokenizer.json")
            .await;

        assert!(res.is_err());
        let file_path = repo.local_path(&resources_dir, "tokenizer.json");
        assert!(!file_path.exists());
        assert!(!file_path.with_extension("temp").exists());
        std::fs::remove_dir_all(resources_dir).ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_bytes() {
        let url = serve_once("200 OK", b"image bytes").await;
        assert_eq!(fetch_bytes(&url).await.unwrap(), b"image bytes");

        let url = serve_once("500 Internal Server Error", b"").await;
        assert!(fetch_bytes(&url).await.is_err());
    }
}
