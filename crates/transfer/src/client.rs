use std::path::Path;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use transfer_server::handlers::{encode_segment, FileInfo, FileList};

/// Any non-empty user name is accepted by the server.
const USER: &str = "transfer";

/// HTTP client for a running transfer server.
pub struct Remote {
    client: Client,
    base: String,
    password: Option<String>,
}

impl Remote {
    pub fn new(base: &str, password: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_owned(),
            password,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn file_url(&self, name: &str) -> String {
        self.url(&format!("/{}", encode_segment(name)))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.password {
            Some(pw) => req.basic_auth(USER, Some(pw)),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self
            .authed(req)
            .send()
            .await
            .context("HTTP request failed")?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_owned))
            .unwrap_or_else(|| text.trim().to_owned());
        match status {
            StatusCode::UNAUTHORIZED => anyhow::bail!("wrong or missing password (--password)"),
            StatusCode::FORBIDDEN => anyhow::bail!("the host denied access: {detail}"),
            _ => anyhow::bail!("server returned {status}: {detail}"),
        }
    }

    pub async fn list(&self) -> Result<Vec<FileInfo>> {
        let resp = self.send(self.client.get(self.url("/api/files"))).await?;
        let list: FileList = resp.json().await.context("parse file list")?;
        Ok(list.files)
    }

    /// Download `name` into `dest`, returning the number of bytes written.
    pub async fn download(&self, name: &str, dest: &Path) -> Result<u64> {
        let resp = self.send(self.client.get(self.file_url(name))).await?;
        save(resp.bytes_stream(), dest).await
    }

    /// Download the whole folder as a zip. `None` if the folder is empty.
    pub async fn download_zip(&self, dest: &Path) -> Result<Option<u64>> {
        let resp = self.send(self.client.get(self.url("/api/zip"))).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        save(resp.bytes_stream(), dest).await.map(Some)
    }

    /// Upload `path` as `name`, replacing any file of that name.
    pub async fn push(&self, path: &Path, name: &str) -> Result<String> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let len = file.metadata().await.map(|m| m.len()).ok();
        let mut req = self
            .client
            .put(self.file_url(name))
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(len) = len {
            req = req.header(reqwest::header::CONTENT_LENGTH, len);
        }
        let resp = self.send(req).await?;
        Ok(resp.text().await?.trim().to_owned())
    }

    pub async fn delete(&self, name: &str) -> Result<String> {
        let resp = self.send(self.client.delete(self.file_url(name))).await?;
        Ok(resp.text().await?.trim().to_owned())
    }
}

/// Write `body` to `dest`. A failed transfer leaves no file behind.
async fn save<S, B, E>(body: S, dest: &Path) -> Result<u64>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let out = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    match write_body(body, out).await {
        Ok(written) => Ok(written),
        Err(e) => {
            let _ = tokio::fs::remove_file(dest).await;
            Err(e)
        }
    }
}

async fn write_body<S, B, E>(body: S, mut out: tokio::fs::File) -> Result<u64>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read response body")?;
        let chunk = chunk.as_ref();
        out.write_all(chunk).await.context("write output file")?;
        written += chunk.len() as u64;
    }
    out.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // "transfer:secret"
    const AUTH: &str = "Basic dHJhbnNmZXI6c2VjcmV0";

    #[tokio::test]
    async fn list_sends_credentials_and_parses_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/files"))
            .and(header("authorization", AUTH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{
                    "name": "a.txt",
                    "size": 3,
                    "formattedSize": "3.0 B",
                    "lastModified": "2024-01-01 10:00:00",
                    "type": "text/plain",
                    "downloadUrl": "/api/download/a.txt"
                }]
            })))
            .mount(&server)
            .await;

        let remote = Remote::new(&server.uri(), Some("secret".into()));
        let files = remote.list().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[0].mime, "text/plain");
    }

    #[tokio::test]
    async fn download_writes_body_to_disk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/my%20file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("contents"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let remote = Remote::new(&server.uri(), None);
        assert_eq!(remote.download("my file.txt", &dest).await.unwrap(), 8);
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "contents");
    }

    #[tokio::test]
    async fn push_streams_file_with_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/notes.md"))
            .and(body_string("# hi"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_string("File 'notes.md' uploaded successfully via PUT.\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let src = dir.path().join("local.md");
        std::fs::write(&src, "# hi").unwrap();
        let remote = Remote::new(&server.uri(), None);
        let msg = remote.push(&src, "notes.md").await.unwrap();
        assert_eq!(msg, "File 'notes.md' uploaded successfully via PUT.");
    }

    #[tokio::test]
    async fn interrupted_download_removes_partial_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("movie.mp4");
        let body = futures::stream::iter(vec![
            Ok(b"first part".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
        ]);

        let err = save(body, &dest).await.unwrap_err();
        assert!(format!("{err:#}").contains("reset by peer"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn empty_zip_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/zip"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let remote = Remote::new(&server.uri(), None);
        let out = remote.download_zip(&dir.path().join("all.zip")).await.unwrap();
        assert!(out.is_none());
        assert!(!dir.path().join("all.zip").exists());
    }

    #[tokio::test]
    async fn errors_surface_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/ghost.txt"))
            .respond_with(ResponseTemplate::new(404).set_body_string("File 'ghost.txt' not found.\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/files"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/locked.txt"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access denied by host device."))
            .mount(&server)
            .await;

        let remote = Remote::new(&server.uri(), None);
        let err = remote.delete("ghost.txt").await.unwrap_err().to_string();
        assert_eq!(err, "server returned 404 Not Found: File 'ghost.txt' not found.");
        let err = remote.list().await.unwrap_err().to_string();
        assert!(err.contains("password"));
        let dir = tempdir().unwrap();
        let err = remote
            .download("locked.txt", &dir.path().join("x"))
            .await
            .unwrap_err()
            .to_string();
        assert_eq!(err, "the host denied access: Access denied by host device.");
    }
}
