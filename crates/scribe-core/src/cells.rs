//! The cell-stream intermediate representation and reply framing.
//!
//! A cell is one recognized token with frame-accurate timing:
//! `start\tend\ttoken\tlike`, one per line. Replies between the broker and
//! its callers carry a status line, the responding server's name, an optional
//! byte count, then the payload. Stereo results hold two payload blocks
//! joined by a literal `||`.

use std::fmt::Write as _;

use crate::error::StatusToken;

pub const STEREO_SEPARATOR: &str = "||";

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub start: u64,
    pub end: u64,
    pub token: String,
    pub like: f64,
}

impl Cell {
    pub fn is_boundary(&self) -> bool {
        self.token == "<s>" || self.token == "</s>"
    }

    /// Token with the morphological `#` prefix stripped.
    pub fn bare_token(&self) -> &str {
        self.token.strip_prefix('#').unwrap_or(&self.token)
    }
}

/// Parse one `start\tend\ttoken\tlike` line. Returns `None` for anything
/// that does not carry at least the three leading fields.
pub fn parse_cell(line: &str) -> Option<Cell> {
    let mut parts = line.split('\t');
    let start = parts.next()?.trim().parse().ok()?;
    let end = parts.next()?.trim().parse().ok()?;
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    let like = parts
        .next()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0);
    Some(Cell {
        start,
        end,
        token: token.to_string(),
        like,
    })
}

pub fn parse_cells(data: &str) -> Vec<Cell> {
    data.lines().filter_map(parse_cell).collect()
}

pub fn format_cells(cells: &[Cell]) -> String {
    let mut out = String::new();
    for cell in cells {
        let _ = writeln!(out, "{}\t{}\t{}\t{}", cell.start, cell.end, cell.token, cell.like);
    }
    out
}

/// A framed handler reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusToken,
    pub server: String,
    pub byte_count: Option<u64>,
    /// Optional speaker-separation header, emitted as a JSON line before the
    /// payload when enabled.
    pub spk_node: Option<String>,
    pub payload: String,
}

impl Reply {
    pub fn success(server: &str, byte_count: u64, payload: String) -> Self {
        Reply {
            status: StatusToken::Success,
            server: server.to_string(),
            byte_count: Some(byte_count),
            spk_node: None,
            payload,
        }
    }

    pub fn failure(status: StatusToken, server: &str) -> Self {
        Reply {
            status,
            server: server.to_string(),
            byte_count: None,
            spk_node: None,
            payload: String::new(),
        }
    }

    pub fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = write!(out, "{}\n{}", self.status, self.server);
        if let Some(bytes) = self.byte_count {
            let _ = write!(out, "\n{bytes}");
        }
        if self.status == StatusToken::Success {
            out.push('\n');
            if let Some(node) = &self.spk_node {
                let _ = write!(out, "{{\"spk_flag\":\"true\",\"spk_node\":\"{node}\"}}\n");
            }
            out.push_str(&self.payload);
        }
        out.into_bytes()
    }

    pub fn parse(raw: &[u8]) -> Option<Reply> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.splitn(3, '\n');
        let status = StatusToken::parse(lines.next()?.trim())?;
        let server = lines.next().unwrap_or("").trim().to_string();
        let rest = lines.next().unwrap_or("");

        if status != StatusToken::Success {
            return Some(Reply::failure(status, &server));
        }

        // The byte-count line is optional; a payload line never parses as a
        // bare integer because cells are tab-delimited.
        let (byte_count, payload) = match rest.split_once('\n') {
            Some((first, tail)) if first.trim().parse::<u64>().is_ok() => {
                (Some(first.trim().parse().unwrap()), tail.to_string())
            }
            _ => (None, rest.to_string()),
        };

        let (spk_node, payload) = match payload.strip_prefix("{\"spk_flag\":\"true\"") {
            Some(_) => {
                let (header, tail) = payload.split_once('\n').unwrap_or((payload.as_str(), ""));
                let node = header
                    .split("\"spk_node\":\"")
                    .nth(1)
                    .and_then(|s| s.split('"').next())
                    .map(str::to_string);
                (node, tail.to_string())
            }
            None => (None, payload),
        };

        Some(Reply {
            status,
            server,
            byte_count,
            spk_node,
            payload,
        })
    }

    /// Payload blocks, one per channel.
    pub fn channels(&self) -> Vec<&str> {
        self.payload.split(STEREO_SEPARATOR).collect()
    }
}

/// Join per-channel cell payloads into a stereo reply body.
pub fn join_stereo(left: &str, right: &str) -> String {
    let mut out = String::with_capacity(left.len() + right.len() + 2);
    out.push_str(left);
    out.push_str(STEREO_SEPARATOR);
    out.push_str(right);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_cells() {
        let cell = parse_cell("120\t180\t#hello\t-0.25").unwrap();
        assert_eq!(cell.start, 120);
        assert_eq!(cell.end, 180);
        assert_eq!(cell.bare_token(), "hello");
        assert!(cell.like.is_finite());
    }

    #[test]
    fn score_column_is_optional() {
        let cell = parse_cell("0\t40\tword").unwrap();
        assert_eq!(cell.like, 0.0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_cell("").is_none());
        assert!(parse_cell("12\t").is_none());
        assert!(parse_cell("a\tb\tc\td").is_none());
        let cells = parse_cells("0\t10\tok\t1.0\ngarbage\n10\t20\tfine\t0.5\n");
        assert_eq!(cells.len(), 2);
    }

    #[test]
    fn cells_round_trip() {
        let cells = vec![
            Cell { start: 0, end: 40, token: "a".into(), like: -1.5 },
            Cell { start: 40, end: 90, token: "<s>".into(), like: 0.0 },
        ];
        assert_eq!(parse_cells(&format_cells(&cells)), cells);
        assert!(cells[1].is_boundary());
    }

    #[test]
    fn success_reply_round_trip() {
        let reply = Reply::success("vr_node_1", 16000, "0\t40\thello\t0.9\n".into());
        let parsed = Reply::parse(&reply.render()).unwrap();
        assert_eq!(parsed, reply);
        let cells = parse_cells(&parsed.payload);
        assert_eq!(cells.len(), 1);
        assert!(cells[0].start <= cells[0].end);
    }

    #[test]
    fn failure_reply_carries_status_and_server_only() {
        let reply = Reply::failure(StatusToken::FailDownload, "vr_node_1");
        let raw = reply.render();
        assert!(raw.starts_with(b"E10200\nvr_node_1"));
        let parsed = Reply::parse(&raw).unwrap();
        assert_eq!(parsed.status, StatusToken::FailDownload);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn stereo_payload_splits_on_separator() {
        let body = join_stereo("0\t10\tleft\t1\n", "0\t12\tright\t1\n");
        let reply = Reply::success("s", 4, body);
        let parsed = Reply::parse(&reply.render()).unwrap();
        let channels = parsed.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(parse_cells(channels[0])[0].token, "left");
        assert_eq!(parse_cells(channels[1])[0].token, "right");
    }

    #[test]
    fn spk_header_line_is_recognized() {
        let mut reply = Reply::success("s", 8, "0\t10\tx\t1\n".into());
        reply.spk_node = Some("vr_spk_1".into());
        let parsed = Reply::parse(&reply.render()).unwrap();
        assert_eq!(parsed.spk_node.as_deref(), Some("vr_spk_1"));
        assert_eq!(parse_cells(&parsed.payload).len(), 1);
    }
}
