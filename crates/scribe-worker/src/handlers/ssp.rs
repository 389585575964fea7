//! Segment-scoring post-processor handler (`vr_ssp`).
//!
//! The payload is a cell-stream, filtered and handed to a classifier. Two
//! modes, keyed on whether `ssp.util` is configured: the external utility
//! consumes the stream with boundary markers and scores intact and its
//! output is returned verbatim; without it the bundled classifier gets a
//! stripped stream and its `ts=`/`te=` line format comes back as
//! `start\tend\tlabel` rows with the null class dropped.

use std::fmt::Write as _;
use std::sync::Arc;

use scribe_broker::{HandlerError, Job};

use super::{WorkerContext, check_payload};

/// The classifier's null class; spans labelled with it are not reported.
const NULL_CLASS: &str = "s0";

/// Classifier shipped alongside the worker, used when no `ssp.util` is
/// configured.
const DEFAULT_CLASSIFIER: &str = "./bin/MlfClassify_new.exe";

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedSpan {
    pub ts: i64,
    pub te: i64,
    pub first_label: String,
    pub first_score: f64,
    pub second_label: String,
    pub second_score: f64,
    pub text: String,
}

/// Parse one classifier output line:
/// `ts= 12, te= 50, [ s1=0.81 s0=0.19 ], str= the words`
pub fn parse_classified_line(line: &str) -> Option<ClassifiedSpan> {
    let ts = field_after(line, "ts=")?.trim_end_matches(',').parse().ok()?;
    let te = field_after(line, "te=")?.trim_end_matches(',').parse().ok()?;

    let bracket = line.split('[').nth(1)?.split(']').next()?;
    let mut scores = bracket.split_whitespace();
    let (first_label, first_score) = label_score(scores.next()?)?;
    let (second_label, second_score) = label_score(scores.next()?)?;

    let text = line.split("str=").nth(1)?.trim().to_string();
    Some(ClassifiedSpan {
        ts,
        te,
        first_label,
        first_score,
        second_label,
        second_score,
        text,
    })
}

fn field_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.split(marker).nth(1)?.split_whitespace().next()
}

fn label_score(part: &str) -> Option<(String, f64)> {
    let (label, score) = part.split_once('=')?;
    Some((label.to_string(), score.parse().ok()?))
}

/// Prepare the cell-stream for the classifier. The external utility wants
/// boundary markers and the score column; the bundled one wants neither.
pub fn filter_cells(cell_text: &str, keep_annotations: bool) -> String {
    let mut out = String::new();
    for line in cell_text.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            continue;
        }
        let token = fields[2];
        if !keep_annotations && (token == "<s>" || token == "</s>") {
            continue;
        }
        if keep_annotations {
            let score = fields.get(3).copied().unwrap_or("0");
            let _ = writeln!(out, "{}\t{}\t{}\t{}", fields[0], fields[1], token, score);
        } else {
            let _ = writeln!(out, "{}\t{}\t{}", fields[0], fields[1], token);
        }
    }
    out
}

/// Reduce classifier output to `start\tend\tlabel` rows, dropping the null
/// class.
pub fn select_spans(cls: &str) -> String {
    let mut out = String::new();
    for line in cls.lines() {
        let Some(span) = parse_classified_line(line) else {
            continue;
        };
        if span.first_label == NULL_CLASS {
            continue;
        }
        let _ = writeln!(out, "{}\t{}\t{}", span.ts, span.te, span.first_label);
    }
    out
}

pub async fn handle(ctx: Arc<WorkerContext>, job: Job) -> Result<Vec<u8>, HandlerError> {
    check_payload(&job)?;

    let util = ctx.cfg.ssp.util.clone();
    let filtered = filter_cells(&String::from_utf8_lossy(&job.payload), util.is_some());
    let cell_path = ctx.tmp_file(&job.handle, "mlf");
    let cls_path = ctx.tmp_file(&job.handle, "mlf.cls");
    tokio::fs::write(&cell_path, filtered)
        .await
        .map_err(|err| HandlerError::new(format!("fail to receive data: {err}")))?;

    let line = match &util {
        Some(util) => format!("{util} {} > {}", cell_path.display(), cls_path.display()),
        None => format!(
            "{DEFAULT_CLASSIFIER} ./out {} {} 5 500",
            cell_path.display(),
            cls_path.display()
        ),
    };
    tracing::debug!(%line, "exec classifier");
    let run = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&line)
        .status()
        .await;

    let result = match run {
        Ok(status) if status.success() => match tokio::fs::read_to_string(&cls_path).await {
            // The external utility's output goes back untouched; the bundled
            // classifier's line format is reduced to labelled spans.
            Ok(cls) => match util {
                Some(_) => Ok(cls.into_bytes()),
                None => Ok(select_spans(&cls).into_bytes()),
            },
            Err(err) => Err(HandlerError::new(format!("cannot open classifier output: {err}"))),
        },
        Ok(status) => Err(HandlerError::new(format!("classifier exited with {status}"))),
        Err(err) => Err(HandlerError::new(format!("fail to ssp: {err}"))),
    };

    let _ = tokio::fs::remove_file(&cell_path).await;
    let _ = tokio::fs::remove_file(&cls_path).await;
    result
}
