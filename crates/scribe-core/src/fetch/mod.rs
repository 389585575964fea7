//! Multi-protocol source fetcher.
//!
//! Resolves a locator to an in-memory sample buffer (`fetch`), learns a
//! remote footprint without downloading the body (`probe`), and pushes
//! result artifacts back out (`upload`). Local reads go straight through the
//! filesystem; http(s) rides the shared reqwest client; ftp(s) and sftp get
//! their own control dialogues.

mod ftp;
mod sftp;

use std::path::Path;
use std::time::Duration;

use crate::audio;
use crate::config::MasterConfig;
use crate::error::FetchError;
use crate::uri::{self, ProtocolKind};

/// Account used for ftp(s)/sftp sources.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upgrade `ftp://` to explicit TLS.
    pub use_ftp_ssl: bool,
    /// Skip TLS peer verification.
    pub ssl_insecure: bool,
    /// Per-operation deadline. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn from_master(cfg: &MasterConfig) -> Self {
        FetchOptions {
            use_ftp_ssl: cfg.use_ftp_ssl,
            ssl_insecure: cfg.ssl_insecure,
            timeout: (cfg.timeout > 0).then(|| Duration::from_millis(cfg.timeout)),
        }
    }
}

pub struct Fetcher {
    http: reqwest::Client,
    opts: FetchOptions,
}

impl Fetcher {
    pub fn new(opts: FetchOptions) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }
        if opts.ssl_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Fetcher { http, opts })
    }

    fn effective_protocol(&self, uri: &str) -> Result<ProtocolKind, FetchError> {
        let protocol = uri::classify(uri)?;
        if protocol == ProtocolKind::Ftp && self.opts.use_ftp_ssl {
            return Ok(ProtocolKind::Ftps);
        }
        Ok(protocol)
    }

    /// Download the resource into a 16-bit sample buffer.
    pub async fn fetch(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<i16>, FetchError> {
        let raw = self.fetch_bytes(uri, credentials).await?;
        Ok(audio::bytes_to_samples(&raw))
    }

    /// Download the resource as raw bytes.
    pub async fn fetch_bytes(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, FetchError> {
        let op = self.fetch_inner(uri, credentials);
        match self.opts.timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| FetchError::Timeout(uri.to_string()))?,
            None => op.await,
        }
    }

    async fn fetch_inner(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, FetchError> {
        match self.effective_protocol(uri)? {
            ProtocolKind::File | ProtocolKind::Mount => {
                let path = uri::local_path(uri).expect("local protocol has a path");
                read_local(path).await
            }
            ProtocolKind::Http | ProtocolKind::Https => self.http_fetch(uri).await,
            ProtocolKind::Ftp => ftp::fetch(uri, credentials, false, self.opts.ssl_insecure).await,
            ProtocolKind::Ftps => ftp::fetch(uri, credentials, true, self.opts.ssl_insecure).await,
            ProtocolKind::Sftp => sftp::fetch(uri, credentials).await,
            ProtocolKind::None => Err(FetchError::UnsupportedProtocol(
                "inline payload has no locator".into(),
            )),
        }
    }

    /// Size of the resource without downloading the body. Idempotent.
    pub async fn probe(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<u64, FetchError> {
        let op = self.probe_inner(uri, credentials);
        match self.opts.timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| FetchError::Timeout(uri.to_string()))?,
            None => op.await,
        }
    }

    async fn probe_inner(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<u64, FetchError> {
        match self.effective_protocol(uri)? {
            ProtocolKind::File | ProtocolKind::Mount => {
                let path = uri::local_path(uri).expect("local protocol has a path");
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| io_fetch_error(path, e))?;
                Ok(meta.len())
            }
            ProtocolKind::Http | ProtocolKind::Https => self.http_probe(uri).await,
            ProtocolKind::Ftp => ftp::probe(uri, credentials, false, self.opts.ssl_insecure).await,
            ProtocolKind::Ftps => ftp::probe(uri, credentials, true, self.opts.ssl_insecure).await,
            ProtocolKind::Sftp => sftp::probe(uri, credentials).await,
            ProtocolKind::None => Err(FetchError::UnsupportedProtocol(
                "inline payload has no locator".into(),
            )),
        }
    }

    /// Push a local file to a remote ftp(s)/sftp target.
    pub async fn upload(
        &self,
        uri: &str,
        local: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<(), FetchError> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| io_fetch_error(&local.display().to_string(), e))?;
        match self.effective_protocol(uri)? {
            ProtocolKind::Ftp => {
                ftp::upload(uri, &data, credentials, false, self.opts.ssl_insecure).await
            }
            ProtocolKind::Ftps => {
                ftp::upload(uri, &data, credentials, true, self.opts.ssl_insecure).await
            }
            ProtocolKind::Sftp => sftp::upload(uri, &data, credentials).await,
            other => Err(FetchError::UnsupportedProtocol(format!(
                "upload over {other:?}"
            ))),
        }
    }

    async fn http_fetch(&self, uri: &str) -> Result<Vec<u8>, FetchError> {
        let res = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(http_fetch_error)?;
        match res.status() {
            s if s.is_success() => Ok(res.bytes().await.map_err(http_fetch_error)?.to_vec()),
            reqwest::StatusCode::NOT_FOUND => Err(FetchError::NotFound(uri.to_string())),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(FetchError::AuthFailed(uri.to_string()))
            }
            s => Err(FetchError::Transport(format!("http {s}: {uri}"))),
        }
    }

    async fn http_probe(&self, uri: &str) -> Result<u64, FetchError> {
        let res = self
            .http
            .head(uri)
            .send()
            .await
            .map_err(http_fetch_error)?;
        match res.status() {
            s if s.is_success() => res
                .content_length()
                .ok_or_else(|| FetchError::Transport(format!("no content length: {uri}"))),
            reqwest::StatusCode::NOT_FOUND => Err(FetchError::NotFound(uri.to_string())),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(FetchError::AuthFailed(uri.to_string()))
            }
            s => Err(FetchError::Transport(format!("http {s}: {uri}"))),
        }
    }
}

async fn read_local(path: &str) -> Result<Vec<u8>, FetchError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| io_fetch_error(path, e))
}

fn io_fetch_error(path: &str, err: std::io::Error) -> FetchError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FetchError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => FetchError::AuthFailed(path.to_string()),
        _ => FetchError::Transport(format!("{path}: {err}")),
    }
}

fn http_fetch_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else {
        FetchError::Transport(err.to_string())
    }
}

/// Split a `scheme://host[:port]/path` locator into endpoint and path.
pub(crate) fn split_host(uri: &str, default_port: u16) -> Result<(String, u16, String), FetchError> {
    let rest = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| FetchError::UnsupportedProtocol(uri.to_string()))?;
    let (endpoint, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse()
                .map_err(|_| FetchError::Transport(format!("bad port in {uri}")))?,
        ),
        None => (endpoint.to_string(), default_port),
    };
    Ok((host, port, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn fetcher() -> Fetcher {
        Fetcher::new(FetchOptions {
            use_ftp_ssl: false,
            ssl_insecure: false,
            timeout: Some(Duration::from_secs(5)),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn local_fetch_and_probe() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let samples: Vec<i16> = vec![3, -7, 2000];
        file.write_all(&crate::audio::samples_to_bytes(&samples))
            .unwrap();

        let uri = format!("file://{}", file.path().display());
        let f = fetcher();
        assert_eq!(f.probe(&uri, None).await.unwrap(), 6);
        assert_eq!(f.fetch(&uri, None).await.unwrap(), samples);
        // probe must be idempotent
        assert_eq!(f.probe(&uri, None).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let f = fetcher();
        assert!(matches!(
            f.fetch("file:///no/such/file.wav", None).await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn inline_payload_cannot_be_fetched() {
        let f = fetcher();
        assert!(matches!(
            f.fetch("not a uri", None).await,
            Err(FetchError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn host_splitting() {
        let (host, port, path) = split_host("ftp://h.example:2121/a/b.wav", 21).unwrap();
        assert_eq!((host.as_str(), port, path.as_str()), ("h.example", 2121, "/a/b.wav"));
        let (host, port, path) = split_host("sftp://h/a.wav", 22).unwrap();
        assert_eq!((host.as_str(), port, path.as_str()), ("h", 22, "/a.wav"));
        let (_, _, path) = split_host("ftp://h", 21).unwrap();
        assert_eq!(path, "/");
    }
}
