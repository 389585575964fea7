//! Text post-processing: turning cell-streams into readable sentences.
//!
//! The morphological post-processor itself is an external component; this
//! module owns the accumulation/flush policy around it and ships a plain
//! fallback used when none is deployed.

use std::path::Path;

use scribe_core::cells::{Cell, parse_cells};
use scribe_core::config::Config;

/// Accumulated input beyond this is flushed through the post-processor.
pub const MAX_SYNTAX: usize = 256;

/// Sentence gap, in frames, used when no pause length is configured.
const DEFAULT_PAUSE: i64 = 100;

pub trait TextPostProcessor: Send + Sync {
    fn process(&self, chunk: &str) -> anyhow::Result<String>;
}

/// Fallback processor: normalizes spacing and closes the chunk.
pub struct PlainTextPostProcessor;

impl TextPostProcessor for PlainTextPostProcessor {
    fn process(&self, chunk: &str) -> anyhow::Result<String> {
        let words: Vec<&str> = chunk.split_whitespace().collect();
        if words.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}\n", words.join(" ")))
    }
}

/// External post-processor invoked per chunk over stdin/stdout.
pub struct CommandPostProcessor {
    command: String,
}

impl CommandPostProcessor {
    pub fn new(command: impl Into<String>) -> Self {
        CommandPostProcessor {
            command: command.into(),
        }
    }
}

impl TextPostProcessor for CommandPostProcessor {
    fn process(&self, chunk: &str) -> anyhow::Result<String> {
        use std::io::Write as _;
        use std::process::{Command, Stdio};

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .expect("stdin piped")
            .write_all(chunk.as_bytes())?;
        let output = child.wait_with_output()?;
        anyhow::ensure!(output.status.success(), "'{}' exited with {}", self.command, output.status);
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Convert a cell-stream into text with no timing. Boundary markers are
/// skipped, morphological `#` prefixes stripped, and the accumulator is
/// flushed through the post-processor whenever it grows past the syntax
/// threshold.
pub fn unsegment(cell_text: &str, pp: &dyn TextPostProcessor) -> anyhow::Result<String> {
    let mut buf = String::new();
    let mut out = String::new();
    for cell in parse_cells(cell_text) {
        if cell.is_boundary() {
            continue;
        }
        let token = cell.bare_token();
        if token.is_empty() || token.starts_with('<') {
            continue;
        }
        buf.push_str(token);
        buf.push(' ');

        if buf.len() > MAX_SYNTAX {
            out.push_str(&pp.process(&buf)?);
            buf.clear();
        }
    }
    if !buf.is_empty() {
        out.push_str(&pp.process(&buf)?);
    }
    Ok(out)
}

/// Timed unsegment: read a cell file, emit `start\tend\tsentence` lines.
///
/// When `stt.unsegment_command` is configured the external tool does the
/// work (`cmd <cells> <out> <pause>`); otherwise sentences are split on
/// inter-cell gaps longer than the pause length.
pub async fn unsegment_with_time(
    cfg: &Config,
    cell_path: &Path,
    text_path: &Path,
    pause: i64,
) -> anyhow::Result<()> {
    if let Some(command) = &cfg.stt.unsegment_command {
        let line = format!(
            "{command} {} {} {pause}",
            cell_path.display(),
            text_path.display()
        );
        tracing::debug!(%line, "exec");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&line)
            .status()
            .await?;
        anyhow::ensure!(status.success(), "'{command}' exited with {status}");
        return Ok(());
    }

    let raw = tokio::fs::read_to_string(cell_path).await?;
    let pause = if pause < 0 { DEFAULT_PAUSE } else { pause } as u64;
    let cells: Vec<Cell> = parse_cells(&raw)
        .into_iter()
        .filter(|c| !c.is_boundary())
        .collect();

    let mut lines = String::new();
    let mut sentence: Vec<&Cell> = Vec::new();
    for cell in &cells {
        if let Some(prev) = sentence.last() {
            if cell.start.saturating_sub(prev.end) > pause {
                flush_sentence(&mut lines, &sentence);
                sentence.clear();
            }
        }
        sentence.push(cell);
    }
    flush_sentence(&mut lines, &sentence);

    tokio::fs::write(text_path, lines).await?;
    Ok(())
}

fn flush_sentence(out: &mut String, sentence: &[&Cell]) {
    let Some(first) = sentence.first() else {
        return;
    };
    let last = sentence.last().expect("non-empty sentence");
    let words: Vec<&str> = sentence.iter().map(|c| c.bare_token()).collect();
    out.push_str(&format!("{}\t{}\t{}\n", first.start, last.end, words.join(" ")));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsegment_skips_boundaries_and_strips_prefixes() {
        let cells = "0\t10\t<s>\t0\n10\t20\t#hello\t0.9\n20\t30\tworld\t0.8\n30\t40\t</s>\t0\n";
        let text = unsegment(cells, &PlainTextPostProcessor).unwrap();
        assert_eq!(text, "hello world\n");
    }

    #[test]
    fn long_streams_flush_in_chunks() {
        let mut cells = String::new();
        for i in 0..200u64 {
            cells.push_str(&format!("{}\t{}\tword{i}\t0.5\n", i * 10, i * 10 + 9));
        }
        let text = unsegment(&cells, &PlainTextPostProcessor).unwrap();
        assert!(text.lines().count() > 1, "threshold must force flushes");
        let rejoined: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rejoined.len(), 200);
        assert_eq!(rejoined[0], "word0");
        assert_eq!(rejoined[199], "word199");
    }

    #[tokio::test]
    async fn timed_unsegment_splits_on_pauses() {
        let dir = tempfile::tempdir().unwrap();
        let mlf = dir.path().join("a.mlf");
        let txt = dir.path().join("a.txt");
        std::fs::write(
            &mlf,
            "0\t40\thi\t0.9\n45\t80\tthere\t0.8\n500\t540\tbye\t0.7\n",
        )
        .unwrap();

        let cfg = Config::default();
        unsegment_with_time(&cfg, &mlf, &txt, 100).await.unwrap();
        let out = std::fs::read_to_string(&txt).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0\t80\thi there");
        assert_eq!(lines[1], "500\t540\tbye");
    }

    #[tokio::test]
    async fn timed_unsegment_prefers_the_external_tool() {
        let dir = tempfile::tempdir().unwrap();
        let mlf = dir.path().join("b.mlf");
        let txt = dir.path().join("b.txt");
        std::fs::write(&mlf, "0\t10\tx\t1\n").unwrap();

        let mut cfg = Config::default();
        // A stand-in tool taking <cells> <out> <pause>, ignoring the pause.
        cfg.stt.unsegment_command =
            Some("process_timed() { cp \"$1\" \"$2\"; }; process_timed".into());
        unsegment_with_time(&cfg, &mlf, &txt, 100).await.unwrap();
        assert_eq!(std::fs::read_to_string(&txt).unwrap(), "0\t10\tx\t1\n");
    }
}
