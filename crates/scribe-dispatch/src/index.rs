//! Work-ready event expansion.
//!
//! An event names one watched file; depending on `index_type` that file is
//! itself the recording, a metadata sidecar, or a newline-delimited list of
//! metadata lines. Each resulting line is matched against the configured
//! `index_format` template to extract the record's metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use scribe_core::config::{Config, IndexType};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("cannot read index '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("index_format is not set; check inotify.index_type and inotify.index_format")]
    MissingFormat,
    #[error("line does not match index_format: {0}")]
    NoMatch(String),
    #[error("index_format needs a filename key for detached lines")]
    MissingFilename,
    #[error("index_type 'pair' is not supported")]
    PairUnsupported,
}

/// A parsed `index_format` template: literal runs and `{key}` placeholders.
#[derive(Debug, Clone)]
pub struct IndexTemplate {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Key(String),
}

impl IndexTemplate {
    pub fn parse(format: &str) -> IndexTemplate {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = format;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            match rest[open..].find('}') {
                Some(close) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Key(rest[open + 1..open + close].to_string()));
                    rest = &rest[open + close + 1..];
                }
                None => {
                    // Unbalanced brace; treat the rest as literal text.
                    literal.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        IndexTemplate { segments }
    }

    /// Match a data line, yielding the captured metadata. Keys bind up to the
    /// next literal; the final key takes the remainder of the line.
    pub fn capture(&self, line: &str) -> Option<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let mut rest = line;
        let mut idx = 0;
        while idx < self.segments.len() {
            match &self.segments[idx] {
                Segment::Literal(lit) => {
                    rest = rest.strip_prefix(lit.as_str())?;
                    idx += 1;
                }
                Segment::Key(key) => match self.segments.get(idx + 1) {
                    Some(Segment::Literal(lit)) => {
                        let end = rest.find(lit.as_str())?;
                        out.insert(key.clone(), rest[..end].to_string());
                        rest = &rest[end + lit.len()..];
                        idx += 2;
                    }
                    _ => {
                        out.insert(key.clone(), rest.to_string());
                        rest = "";
                        idx += 1;
                    }
                },
            }
        }
        if !rest.is_empty() {
            return None;
        }
        Some(out)
    }
}

/// One metadata line awaiting record construction.
#[derive(Debug, Clone)]
pub struct WorkLine {
    pub data: String,
    /// Known on-disk location of the recording, when the event names it
    /// directly. Detached lines (list entries) carry their location in the
    /// metadata instead.
    pub pathname: Option<PathBuf>,
}

/// One unit of work, ready for admission and submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub uri: String,
    pub metadata: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn call_id(&self) -> Option<&str> {
        self.metadata.get("call_id").map(String::as_str)
    }
}

/// Expand a watched file into metadata lines according to `index_type`.
///
/// `pathname` is where the index content lives (it differs from the watched
/// location after a preprocess step); `filename` is the original name.
pub fn expand_event(
    cfg: &Config,
    pathname: &Path,
    filename: &str,
) -> Result<Vec<WorkLine>, IndexError> {
    match cfg.inotify.index_type {
        IndexType::Filename => Ok(vec![WorkLine {
            data: filename.to_string(),
            pathname: Some(pathname.to_path_buf()),
        }]),
        IndexType::File => {
            let text = read_index(pathname)?;
            let line = text.lines().next().unwrap_or_default().to_string();
            // The sidecar sits next to the recording; swap the extension.
            let rec_path = pathname.with_extension(&cfg.inotify.rec_ext);
            Ok(vec![WorkLine {
                data: line,
                pathname: Some(rec_path),
            }])
        }
        IndexType::List => {
            let text = read_index(pathname)?;
            Ok(text
                .lines()
                .filter(|line| line.len() >= 5)
                .map(|line| WorkLine {
                    data: line.to_string(),
                    pathname: None,
                })
                .collect())
        }
        IndexType::Pair => Err(IndexError::PairUnsupported),
    }
}

fn read_index(path: &Path) -> Result<String, IndexError> {
    std::fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Build a record from one metadata line.
///
/// The download location is resolved in priority order: the line's own
/// `download_path`, the configured download path, then the input directory.
pub fn build_record(
    cfg: &Config,
    template: &IndexTemplate,
    work: &WorkLine,
) -> Result<JobRecord, IndexError> {
    let metadata = template
        .capture(work.data.trim_end())
        .ok_or_else(|| IndexError::NoMatch(work.data.clone()))?;

    let uri = match metadata.get("filename") {
        Some(filename) => {
            let base = metadata
                .get("download_path")
                .cloned()
                .or_else(|| cfg.inotify.download_path.clone())
                .or_else(|| {
                    cfg.inotify
                        .input_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                });
            match base {
                Some(mut base) => {
                    if !base.is_empty() && !base.ends_with('/') {
                        base.push('/');
                    }
                    base.push_str(filename);
                    base
                }
                None => filename.clone(),
            }
        }
        None => match &work.pathname {
            Some(path) => path.display().to_string(),
            None => return Err(IndexError::MissingFilename),
        },
    };

    Ok(JobRecord { uri, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn template_roundtrip(format: &str, line: &str) -> Option<BTreeMap<String, String>> {
        IndexTemplate::parse(format).capture(line)
    }

    #[test]
    fn filename_template_captures_keys() {
        let meta = template_roundtrip(
            "{call_id}_{rec_date}_{rec_time}.wav",
            "CALL-7_20260801_093000.wav",
        )
        .unwrap();
        assert_eq!(meta["call_id"], "CALL-7");
        assert_eq!(meta["rec_date"], "20260801");
        assert_eq!(meta["rec_time"], "093000");
    }

    #[test]
    fn delimited_template_with_passthrough_keys() {
        let meta = template_roundtrip(
            "{filename},{call_id},{agent}",
            "http://h/a.wav,C1,kim",
        )
        .unwrap();
        assert_eq!(meta["filename"], "http://h/a.wav");
        assert_eq!(meta["agent"], "kim");
    }

    #[test]
    fn mismatched_lines_fail_capture() {
        assert!(template_roundtrip("{a},{b}", "no-delimiter-here").is_none());
        assert!(template_roundtrip("{a}.wav", "x.mp3").is_none());
    }

    #[test]
    fn last_key_takes_rest_of_line() {
        let meta = template_roundtrip("{filename}|{note}", "a.wav|free text, commas ok").unwrap();
        assert_eq!(meta["note"], "free text, commas ok");
    }

    fn list_config(dir: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.inotify.index_type = IndexType::List;
        cfg.inotify.index_format = Some("{filename}".into());
        cfg.inotify.input_path = Some(dir.to_path_buf());
        cfg
    }

    #[test]
    fn list_expansion_keeps_file_order_and_skips_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("batch.list");
        let mut f = std::fs::File::create(&list).unwrap();
        writeln!(f, "http://h/1.wav").unwrap();
        writeln!(f, "x").unwrap();
        writeln!(f, "http://h/2.wav").unwrap();

        let cfg = list_config(dir.path());
        let lines = expand_event(&cfg, &list, "batch.list").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].data, "http://h/1.wav");
        assert_eq!(lines[1].data, "http://h/2.wav");
    }

    #[test]
    fn record_uri_resolution_order() {
        let mut cfg = Config::default();
        cfg.inotify.input_path = Some(PathBuf::from("/in"));
        let template = IndexTemplate::parse("{filename},{call_id}");

        // No download path configured: input path is the base.
        let record = build_record(
            &cfg,
            &template,
            &WorkLine { data: "a.wav,C1".into(), pathname: None },
        )
        .unwrap();
        assert_eq!(record.uri, "/in/a.wav");
        assert_eq!(record.call_id(), Some("C1"));

        // Configured download path wins over the input path.
        cfg.inotify.download_path = Some("sftp://h/rec".into());
        let record = build_record(
            &cfg,
            &template,
            &WorkLine { data: "a.wav,C1".into(), pathname: None },
        )
        .unwrap();
        assert_eq!(record.uri, "sftp://h/rec/a.wav");

        // A per-line download_path wins over everything.
        let template = IndexTemplate::parse("{filename},{call_id},{download_path}");
        let record = build_record(
            &cfg,
            &template,
            &WorkLine { data: "a.wav,C1,http://other/".into(), pathname: None },
        )
        .unwrap();
        assert_eq!(record.uri, "http://other/a.wav");
    }

    #[test]
    fn detached_line_without_filename_is_an_error() {
        let cfg = Config::default();
        let template = IndexTemplate::parse("{call_id}");
        let err = build_record(
            &cfg,
            &template,
            &WorkLine { data: "C1".into(), pathname: None },
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::MissingFilename));
    }

    #[test]
    fn pair_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.inotify.index_type = IndexType::Pair;
        assert!(matches!(
            expand_event(&cfg, &dir.path().join("x.pair"), "x.pair"),
            Err(IndexError::PairUnsupported)
        ));
    }
}
