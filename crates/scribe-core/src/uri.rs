//! Source locator classification.
//!
//! A workload either names a remote or local resource (`scheme://…`) or is an
//! inline streamed payload with no scheme marker at all.

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    File,
    Mount,
    Http,
    Https,
    Ftp,
    Ftps,
    Sftp,
    /// Inline streamed payload, no locator.
    None,
}

impl ProtocolKind {
    pub fn is_local(&self) -> bool {
        matches!(self, ProtocolKind::File | ProtocolKind::Mount)
    }
}

fn scheme_of(raw: &str) -> Option<(&str, &str)> {
    // Only inspect the head of the payload; inline PCM may be arbitrarily
    // large and must not be scanned.
    let mut end = raw.len().min(10);
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    let head = &raw[..end];
    let pos = head.find("://")?;
    Some((&raw[..pos], &raw[pos + 3..]))
}

/// Classify a workload. Payloads without a `://` marker are inline streams.
pub fn classify(raw: &str) -> Result<ProtocolKind, FetchError> {
    let Some((scheme, _)) = scheme_of(raw) else {
        return Ok(ProtocolKind::None);
    };

    match scheme {
        "file" => Ok(ProtocolKind::File),
        "mount" => Ok(ProtocolKind::Mount),
        "http" => Ok(ProtocolKind::Http),
        "https" => Ok(ProtocolKind::Https),
        "ftp" => Ok(ProtocolKind::Ftp),
        "ftps" => Ok(ProtocolKind::Ftps),
        "sftp" | "scp" | "ssh" => Ok(ProtocolKind::Sftp),
        other => Err(FetchError::UnsupportedProtocol(other.to_string())),
    }
}

/// The path portion of a `file://` or `mount://` locator, or a bare path.
pub fn local_path(raw: &str) -> Option<&str> {
    match scheme_of(raw) {
        None => Some(raw),
        Some(("file" | "mount", rest)) => Some(rest),
        Some(_) => None,
    }
}

/// Final path segment of a locator, used to name downloaded temp files.
pub fn file_name(raw: &str) -> &str {
    raw.rsplit('/').next().unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_schemes() {
        assert_eq!(classify("file:///a/b.wav").unwrap(), ProtocolKind::File);
        assert_eq!(classify("mount:///rec/b.wav").unwrap(), ProtocolKind::Mount);
        assert_eq!(classify("http://h/1.wav").unwrap(), ProtocolKind::Http);
        assert_eq!(classify("https://h/1.wav").unwrap(), ProtocolKind::Https);
        assert_eq!(classify("ftp://h/1.wav").unwrap(), ProtocolKind::Ftp);
        assert_eq!(classify("ftps://h/1.wav").unwrap(), ProtocolKind::Ftps);
        assert_eq!(classify("sftp://h/1.wav").unwrap(), ProtocolKind::Sftp);
        assert_eq!(classify("scp://h/1.wav").unwrap(), ProtocolKind::Sftp);
        assert_eq!(classify("ssh://h/1.wav").unwrap(), ProtocolKind::Sftp);
    }

    #[test]
    fn inline_payloads_have_no_protocol() {
        assert_eq!(classify("raw pcm bytes").unwrap(), ProtocolKind::None);
        // Scheme marker beyond the sniff window is treated as inline data.
        assert_eq!(
            classify("0123456789file://x").unwrap(),
            ProtocolKind::None
        );
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        assert!(matches!(
            classify("gopher://h/x"),
            Err(FetchError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn local_path_strips_scheme() {
        assert_eq!(local_path("file:///a/b.wav"), Some("/a/b.wav"));
        assert_eq!(local_path("mount:///a/b.wav"), Some("/a/b.wav"));
        assert_eq!(local_path("/a/b.wav"), Some("/a/b.wav"));
        assert_eq!(local_path("http://h/b.wav"), None);
    }

    #[test]
    fn file_name_takes_last_segment() {
        assert_eq!(file_name("sftp://h/rec/2020/a.wav"), "a.wav");
        assert_eq!(file_name("a.wav"), "a.wav");
    }
}
