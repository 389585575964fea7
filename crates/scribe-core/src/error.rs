use std::fmt;

/// Terminal status tokens carried on the first line of a framed reply.
///
/// `E10100`: the input file is missing at ingress. `E10200`: the payload
/// could not be downloaded. `E20400`: the external decoder failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusToken {
    Success,
    FailNoFile,
    FailDownload,
    FailDecoding,
}

impl StatusToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusToken::Success => "SUCCESS",
            StatusToken::FailNoFile => "E10100",
            StatusToken::FailDownload => "E10200",
            StatusToken::FailDecoding => "E20400",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "SUCCESS" => Some(StatusToken::Success),
            "E10100" => Some(StatusToken::FailNoFile),
            "E10200" => Some(StatusToken::FailDownload),
            "E20400" => Some(StatusToken::FailDecoding),
            _ => None,
        }
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl FetchError {
    /// The reply token a handler emits when this error terminates a job.
    pub fn status_token(&self) -> StatusToken {
        match self {
            FetchError::NotFound(_) => StatusToken::FailNoFile,
            _ => StatusToken::FailDownload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("missing required option {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
