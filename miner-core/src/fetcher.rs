//! Streaming artifact downloads.
//!
//! Bytes go to `{destination}.part` while a sha256 digest is computed over the
//! same chunks. Only a fully written, flushed file is renamed onto the final
//! path; any failure removes the partial file.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::NetworkError;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What was written to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub bytes: u64,
    /// Lowercase hex sha256.
    pub sha256: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `source` to `destination`. On error nothing is left at
    /// `destination` or its `.part` sibling.
    async fn fetch(&self, source: &Url, destination: &Path) -> Result<FetchedArtifact, FetchError>;
}

/// Fetches `http(s)://` over reqwest and copies `file://` locally.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Only connecting is bounded; large datasets may stream for a long time.
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|source| NetworkError::Request {
                url: "<client>".into(),
                source,
            })?;
        Ok(Self { client })
    }

    async fn stream_http(&self, source: &Url, sink: &mut DigestSink) -> Result<(), FetchError> {
        let response = self
            .client
            .get(source.clone())
            .send()
            .await
            .map_err(|err| request_error(source, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                url: source.to_string(),
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            }
            .into());
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| request_error(source, err))?;
            sink.write(&chunk).await?;
        }
        Ok(())
    }

    async fn copy_local(source: &Url, sink: &mut DigestSink) -> Result<(), FetchError> {
        let path = source.to_file_path().map_err(|()| {
            FetchError::UnsupportedScheme(format!("file (not a local path: {source})"))
        })?;
        let local_err = |source: io::Error| NetworkError::LocalSource {
            path: path.clone(),
            source,
        };

        let mut file = File::open(&path).await.map_err(local_err)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let read = file.read(&mut buf).await.map_err(local_err)?;
            if read == 0 {
                break;
            }
            sink.write(&buf[..read]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, source: &Url, destination: &Path) -> Result<FetchedArtifact, FetchError> {
        let part = part_path(destination);
        debug!(%source, destination = %destination.display(), "fetching artifact");

        let result: Result<FetchedArtifact, FetchError> = async {
            let mut sink = DigestSink::create(&part).await?;
            match source.scheme() {
                "http" | "https" => self.stream_http(source, &mut sink).await?,
                "file" => Self::copy_local(source, &mut sink).await?,
                other => return Err(FetchError::UnsupportedScheme(other.to_string())),
            }
            let fetched = sink.finish().await?;
            tokio::fs::rename(&part, destination).await.map_err(|source| {
                FetchError::Io {
                    path: destination.to_path_buf(),
                    source,
                }
            })?;
            Ok(fetched)
        }
        .await;

        match &result {
            Ok(fetched) => info!(
                %source,
                bytes = fetched.bytes,
                sha256 = %fetched.sha256,
                "artifact downloaded"
            ),
            Err(err) => {
                warn!(%source, error = %err, "artifact download failed");
                if let Err(cleanup) = tokio::fs::remove_file(&part).await
                    && cleanup.kind() != io::ErrorKind::NotFound
                {
                    warn!(
                        path = %part.display(),
                        error = %cleanup,
                        "could not remove partial download"
                    );
                }
            }
        }
        result
    }
}

pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

fn request_error(url: &Url, source: reqwest::Error) -> FetchError {
    NetworkError::Request {
        url: url.to_string(),
        source,
    }
    .into()
}

/// File writer that hashes everything it writes.
struct DigestSink {
    path: PathBuf,
    file: File,
    hasher: Sha256,
    bytes: u64,
}

impl DigestSink {
    async fn create(path: &Path) -> Result<Self, FetchError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let file = File::create(path).await.map_err(|source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            hasher: Sha256::new(),
            bytes: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|source| self.io_error(source))?;
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self) -> Result<FetchedArtifact, FetchError> {
        self.file
            .flush()
            .await
            .map_err(|source| self.io_error(source))?;
        self.file
            .sync_all()
            .await
            .map_err(|source| self.io_error(source))?;
        Ok(FetchedArtifact {
            bytes: self.bytes,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }

    fn io_error(&self, source: io::Error) -> FetchError {
        FetchError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use tempfile::TempDir;

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Url::parse(&format!("http://{addr}/")).expect("url")
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn downloads_over_http_and_reports_digest() {
        let body = "print('hello')\n".repeat(2048);
        let served = body.clone();
        let base = serve(Router::new().route(
            "/script.py",
            get(move || {
                let served = served.clone();
                async move { served }
            }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("script.py");
        let fetched = fetcher()
            .fetch(&base.join("script.py").unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(fetched.bytes, body.len() as u64);
        assert_eq!(fetched.sha256, sha256_hex(body.as_bytes()));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), body);
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn http_error_leaves_nothing_behind() {
        let base = serve(Router::new().route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("trainingData");
        let err = fetcher()
            .fetch(&base.join("missing").unwrap(), &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::Network(NetworkError::Status { status: 404, .. })
        ));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn copies_file_urls() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.csv");
        std::fs::write(&src, b"a,b\n1,2\n").unwrap();
        let dest = dir.path().join("out").join("validationData");

        let fetched = fetcher()
            .fetch(&Url::from_file_path(&src).unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(fetched.bytes, 8);
        assert_eq!(fetched.sha256, sha256_hex(b"a,b\n1,2\n"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn missing_local_source_is_a_network_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("absent");
        let dest = dir.path().join("script.py");

        let err = fetcher()
            .fetch(&Url::from_file_path(&src).unwrap(), &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::Network(NetworkError::LocalSource { .. })
        ));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn rejects_unknown_schemes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("script.py");
        let err = fetcher()
            .fetch(&Url::parse("ftp://host/script.py").unwrap(), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "ftp"));
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/jobs/a/script.py")),
            PathBuf::from("/jobs/a/script.py.part")
        );
    }
}
