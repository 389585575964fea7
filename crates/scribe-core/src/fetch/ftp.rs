//! Minimal FTP/FTPS client: control-channel dialogue, passive data
//! transfers, explicit `AUTH TLS` upgrade. Only the verbs this fabric needs
//! (SIZE, RETR, STOR) are spoken.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::FetchError;
use crate::fetch::{Credentials, split_host};

const DEFAULT_PORT: u16 = 21;

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

struct Control {
    stream: BufReader<Box<dyn Conn>>,
    host: String,
    tls: Option<TlsConnector>,
}

impl Control {
    async fn connect(
        host: &str,
        port: u16,
        credentials: Option<&Credentials>,
        use_tls: bool,
        insecure: bool,
    ) -> Result<Self, FetchError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| FetchError::Transport(format!("{host}:{port}: {e}")))?;
        let mut control = Control {
            stream: BufReader::new(Box::new(tcp) as Box<dyn Conn>),
            host: host.to_string(),
            tls: None,
        };
        control.expect(220).await?;

        if use_tls {
            control.command("AUTH TLS", &[234]).await?;
            let connector = tls_connector(insecure)?;
            let inner = control.stream.into_inner();
            let tls_stream = connector
                .connect(server_name(host)?, inner)
                .await
                .map_err(|e| FetchError::Transport(format!("tls handshake: {e}")))?;
            control.stream = BufReader::new(Box::new(tls_stream) as Box<dyn Conn>);
            control.tls = Some(connector);
            // Protect the data channel as well.
            control.command("PBSZ 0", &[200]).await?;
            control.command("PROT P", &[200]).await?;
        }

        let (user, pass) = match credentials {
            Some(c) => (c.username.as_str(), c.password.as_str()),
            None => ("anonymous", "anonymous@"),
        };
        let code = control.send(&format!("USER {user}")).await?;
        match code.0 {
            230 => {}
            331 | 332 => {
                let code = control.send(&format!("PASS {pass}")).await?;
                if code.0 != 230 {
                    return Err(FetchError::AuthFailed(format!("ftp login: {}", code.1)));
                }
            }
            _ => return Err(FetchError::AuthFailed(format!("ftp login: {}", code.1))),
        }

        control.command("TYPE I", &[200]).await?;
        Ok(control)
    }

    async fn send(&mut self, line: &str) -> Result<(u16, String), FetchError> {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        self.read_response().await
    }

    async fn command(&mut self, line: &str, expect: &[u16]) -> Result<(u16, String), FetchError> {
        let resp = self.send(line).await?;
        if !expect.contains(&resp.0) {
            return Err(FetchError::Transport(format!(
                "{}: unexpected reply {} {}",
                line.split(' ').next().unwrap_or(line),
                resp.0,
                resp.1
            )));
        }
        Ok(resp)
    }

    async fn expect(&mut self, code: u16) -> Result<String, FetchError> {
        let resp = self.read_response().await?;
        if resp.0 != code {
            return Err(FetchError::Transport(format!(
                "expected {code}, got {} {}",
                resp.0, resp.1
            )));
        }
        Ok(resp.1)
    }

    async fn read_response(&mut self) -> Result<(u16, String), FetchError> {
        use tokio::io::AsyncBufReadExt;
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(FetchError::Transport("ftp control channel closed".into()));
            }
            text.push_str(&line);
            // Multiline replies run until `NNN ` (space after the code).
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                let code = line[..3]
                    .parse()
                    .map_err(|_| FetchError::Transport(format!("bad ftp reply: {line}")))?;
                return Ok((code, text.trim().to_string()));
            }
        }
    }

    /// Enter passive mode and open the advertised data connection.
    async fn open_data(&mut self) -> Result<Box<dyn Conn>, FetchError> {
        let resp = self.command("PASV", &[227]).await?;
        let (_, port) = parse_pasv(&resp.1)
            .ok_or_else(|| FetchError::Transport(format!("bad PASV reply: {}", resp.1)))?;

        // Servers behind NAT advertise internal addresses; reuse the control
        // host instead of trusting the tuple.
        let tcp = TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| FetchError::Transport(format!("data connect: {e}")))?;
        match &self.tls {
            Some(connector) => {
                let tls_stream = connector
                    .connect(server_name(&self.host)?, tcp)
                    .await
                    .map_err(|e| FetchError::Transport(format!("data tls: {e}")))?;
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    async fn quit(mut self) {
        let _ = self.stream.get_mut().write_all(b"QUIT\r\n").await;
    }
}

fn parse_pasv(reply: &str) -> Option<(String, u16)> {
    let tuple = reply.split('(').nth(1)?.split(')').next()?;
    let parts: Vec<u16> = tuple
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    if parts.len() != 6 {
        return None;
    }
    let host = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
    Some((host, parts[4] * 256 + parts[5]))
}

fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, FetchError> {
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| FetchError::Transport(format!("bad server name {host}: {e}")))
}

fn tls_connector(insecure: bool) -> Result<TlsConnector, FetchError> {
    let config = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Peer verification disabled by `master.ssl_insecure`.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

pub(super) async fn fetch(
    uri: &str,
    credentials: Option<&Credentials>,
    use_tls: bool,
    insecure: bool,
) -> Result<Vec<u8>, FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let mut control = Control::connect(&host, port, credentials, use_tls, insecure).await?;

    let mut data = control.open_data().await?;
    let resp = control.send(&format!("RETR {path}")).await?;
    match resp.0 {
        125 | 150 => {}
        550 => return Err(FetchError::NotFound(uri.to_string())),
        _ => return Err(FetchError::Transport(format!("RETR: {} {}", resp.0, resp.1))),
    }

    let mut body = Vec::new();
    data.read_to_end(&mut body)
        .await
        .map_err(|e| FetchError::Transport(format!("data read: {e}")))?;
    drop(data);
    control.expect(226).await?;
    control.quit().await;
    Ok(body)
}

pub(super) async fn probe(
    uri: &str,
    credentials: Option<&Credentials>,
    use_tls: bool,
    insecure: bool,
) -> Result<u64, FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let mut control = Control::connect(&host, port, credentials, use_tls, insecure).await?;
    let resp = control.send(&format!("SIZE {path}")).await?;
    control.quit().await;
    match resp.0 {
        213 => resp
            .1
            .rsplit(' ')
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| FetchError::Transport(format!("bad SIZE reply: {}", resp.1))),
        550 => Err(FetchError::NotFound(uri.to_string())),
        _ => Err(FetchError::Transport(format!("SIZE: {} {}", resp.0, resp.1))),
    }
}

pub(super) async fn upload(
    uri: &str,
    body: &[u8],
    credentials: Option<&Credentials>,
    use_tls: bool,
    insecure: bool,
) -> Result<(), FetchError> {
    let (host, port, path) = split_host(uri, DEFAULT_PORT)?;
    let mut control = Control::connect(&host, port, credentials, use_tls, insecure).await?;

    let mut data = control.open_data().await?;
    let resp = control.send(&format!("STOR {path}")).await?;
    if !matches!(resp.0, 125 | 150) {
        return Err(FetchError::Transport(format!("STOR: {} {}", resp.0, resp.1)));
    }
    data.write_all(body)
        .await
        .map_err(|e| FetchError::Transport(format!("data write: {e}")))?;
    data.shutdown()
        .await
        .map_err(|e| FetchError::Transport(format!("data close: {e}")))?;
    drop(data);
    control.expect(226).await?;
    control.quit().await;
    Ok(())
}
