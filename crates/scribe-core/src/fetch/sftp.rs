//! SFTP transfers over an SSH session (russh + the sftp subsystem).

use std::sync::Arc;

use russh::client::{self, AuthResult};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FetchError;
use crate::fetch::{Credentials, split_host};

const DEFAULT_PORT: u16 = 22;

struct TrustingHandler;

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    // Host keys are pinned at the network layer in these deployments; the
    // fabric accepts whatever the configured endpoint presents.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn open_session(
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<SftpSession, FetchError> {
    let credentials = credentials
        .ok_or_else(|| FetchError::AuthFailed(format!("sftp://{host}: no account configured")))?;

    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, (host, port), TrustingHandler)
        .await
        .map_err(|e| FetchError::Transport(format!("ssh connect {host}:{port}: {e}")))?;

    let auth = handle
        .authenticate_password(&credentials.username, &credentials.password)
        .await
        .map_err(|e| FetchError::Transport(format!("ssh auth: {e}")))?;
    if !matches!(auth, AuthResult::Success) {
        return Err(FetchError::AuthFailed(format!(
            "sftp login rejected for {}",
            credentials.username
        )));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FetchError::Transport(format!("ssh channel: {e}")))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| FetchError::Transport(format!("sftp subsystem: {e}")))?;

    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| FetchError::Transport(format!("sftp session: {e}")))
}

fn map_sftp_error(path: &str, err: russh_sftp::client::error::Error) -> FetchError {
    let text = err.to_string();
    if text.contains("No such file") || text.contains("NoSuchFile") {
        FetchError::NotFound(path.to_string())
    } else if text.contains("Permission") {
        FetchError::AuthFailed(path.to_string())
    } else {
        FetchError::Transport(format!("{path}: {text}"))
    }
}

pub(super) async fn fetch(
    uri: &str,
    credentials: Option<&Credentials>,
) -> Result<Vec<u8>, FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let sftp = open_session(&host, port, credentials).await?;

    let mut file = sftp
        .open(&path)
        .await
        .map_err(|e| map_sftp_error(&path, e))?;
    let mut body = Vec::new();
    file.read_to_end(&mut body)
        .await
        .map_err(|e| FetchError::Transport(format!("{path}: {e}")))?;
    let _ = sftp.close().await;
    Ok(body)
}

pub(super) async fn probe(uri: &str, credentials: Option<&Credentials>) -> Result<u64, FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let sftp = open_session(&host, port, credentials).await?;
    let attrs = sftp
        .metadata(&path)
        .await
        .map_err(|e| map_sftp_error(&path, e))?;
    let _ = sftp.close().await;
    attrs
        .size
        .ok_or_else(|| FetchError::Transport(format!("{path}: size not reported")))
}

pub(super) async fn upload(
    uri: &str,
    body: &[u8],
    credentials: Option<&Credentials>,
) -> Result<(), FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let sftp = open_session(&host, port, credentials).await?;
    let mut file = sftp
        .create(&path)
        .await
        .map_err(|e| map_sftp_error(&path, e))?;
    file.write_all(body)
        .await
        .map_err(|e| FetchError::Transport(format!("{path}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| FetchError::Transport(format!("{path}: {e}")))?;
    let _ = sftp.close().await;
    Ok(())
}
