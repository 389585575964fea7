//! The dispatch pipeline: work-ready event → index expansion → admission →
//! REST submission, one task per record, with back-pressure instead of drops.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Datelike, Local, Timelike};
use tokio::task::JoinSet;

use crate::admission::AdmissionController;
use crate::auth::AuthTokenCache;
use crate::backend::{Backend, SubmitError, build_job_body};
use crate::index::{self, IndexTemplate, JobRecord};
use crate::watch::WatchEvent;
use scribe_core::config::Config;
use scribe_core::fetch::{Credentials, FetchOptions, Fetcher};
use scribe_core::uri::{self, ProtocolKind};

static PREPROCESS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Terminal outcome of one record, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Completed,
    FailedTransport,
    FailedAuth,
    FailedRejected,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    admission: Arc<AdmissionController>,
    backend: Arc<Backend>,
    fetcher: Arc<Fetcher>,
    byte_ceiling: Option<u64>,
}

impl Dispatcher {
    pub fn new(cfg: Arc<Config>) -> anyhow::Result<Arc<Self>> {
        let byte_ceiling = cfg.byte_ceiling()?;
        let count_ceiling = cfg
            .inotify
            .maximum_jobs
            .unwrap_or(crate::admission::DEFAULT_COUNT_CEILING);
        let admission = AdmissionController::new(count_ceiling, byte_ceiling);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let auth = Arc::new(AuthTokenCache::new(http.clone(), &cfg.api));
        let backend = Arc::new(Backend::new(http, &cfg.api, auth));
        let fetcher = Arc::new(Fetcher::new(FetchOptions::from_master(&cfg.master))?);

        Ok(Arc::new(Dispatcher {
            cfg,
            admission,
            backend,
            fetcher,
            byte_ceiling,
        }))
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Consume watch events until the channel closes. Each event runs as its
    /// own task; admission provides the only throttling.
    pub async fn run(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        let mut jobs = JoinSet::new();
        while let Some(event) = events.recv().await {
            let dispatcher = self.clone();
            jobs.spawn(async move {
                dispatcher.run_event(event).await;
            });
            // Reap finished event tasks without blocking intake.
            while jobs.try_join_next().is_some() {}
        }
        while jobs.join_next().await.is_some() {}
    }

    /// Process one work-ready event end to end.
    pub async fn run_event(self: &Arc<Self>, event: WatchEvent) {
        tracing::info!(file = %event.filename, "request STT");
        let watched = event.dir.join(&event.filename);

        let mut pathname = watched.clone();
        if let Some(preprocess) = &self.cfg.inotify.preprocess {
            let staged = std::env::temp_dir().join(format!(
                "scribe-pre-{}-{}.txt",
                std::process::id(),
                PREPROCESS_SEQ.fetch_add(1, Ordering::Relaxed),
            ));
            if let Err(err) = run_command(preprocess, &pathname, &staged).await {
                tracing::error!(%err, command = %preprocess, "preprocess failed");
                return;
            }
            pathname = staged;
        }

        let Some(format) = self.cfg.inotify.index_format.clone() else {
            tracing::error!("please check inotify.index_type and inotify.index_format");
            return;
        };
        let template = IndexTemplate::parse(&format);

        let lines = match index::expand_event(&self.cfg, &pathname, &event.filename) {
            Ok(lines) => lines,
            Err(err) => {
                tracing::error!(%err, file = %event.filename, "cannot expand work event");
                return;
            }
        };

        let output = self.output_path();

        let mut records = JoinSet::new();
        for line in &lines {
            let record = match index::build_record(&self.cfg, &template, line) {
                Ok(record) => record,
                // A bad line never aborts the batch.
                Err(err) => {
                    tracing::error!(%err, line = %line.data, "cannot parse record");
                    continue;
                }
            };

            // Admission happens here, in file order, so submissions start in
            // the order the index listed them.
            let size = self.record_footprint(&record).await;
            let permit = match self.admission.acquire(&record.uri, size).await {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::warn!(%err, "skipping record");
                    continue;
                }
            };

            let dispatcher = self.clone();
            let output = output.clone();
            records.spawn(async move {
                let outcome = dispatcher.submit_record(&record, output.as_deref()).await;
                drop(permit);
                outcome
            });
        }

        while records.join_next().await.is_some() {}
        tracing::info!(file = %event.filename, "done");

        if let Some(postprocess) = &self.cfg.inotify.postprocess {
            let out = output.map(PathBuf::from).unwrap_or_default();
            if let Err(err) = run_command(postprocess, &pathname, &out).await {
                tracing::error!(%err, command = %postprocess, "postprocess failed");
            }
        }
    }

    /// Probe the record's byte footprint when threshold admission is on.
    /// Probe failures degrade to count-only admission.
    async fn record_footprint(&self, record: &JobRecord) -> u64 {
        if self.byte_ceiling.is_none() {
            return 0;
        }
        match self.fetcher.probe(&record.uri, self.credentials().as_ref()).await {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!(%err, uri = %record.uri, "cannot probe size, admitting by count only");
                0
            }
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        let protocol = &self.cfg.protocol;
        if !protocol.enabled {
            return None;
        }
        Some(Credentials {
            username: protocol.username.clone()?,
            password: protocol.password.clone().unwrap_or_default(),
        })
    }

    pub async fn submit_record(
        self: &Arc<Self>,
        record: &JobRecord,
        output: Option<&str>,
    ) -> RecordOutcome {
        let body = build_job_body(record, output, false);
        match self.backend.submit(&body).await {
            Ok(()) => {
                tracing::info!(uri = %record.uri, "STT success");
                if self.cfg.inotify.delete_on_success {
                    self.delete_source(&record.uri).await;
                }
                RecordOutcome::Completed
            }
            Err(SubmitError::Auth(err)) => {
                tracing::error!(%err, "API server authentication failed");
                RecordOutcome::FailedAuth
            }
            Err(SubmitError::Transport(err)) => {
                tracing::error!(%err, uri = %record.uri, "fail to request");
                RecordOutcome::FailedTransport
            }
            Err(SubmitError::Rejected { status, body }) => {
                tracing::warn!(%status, %body, uri = %record.uri, "failure");
                RecordOutcome::FailedRejected
            }
        }
    }

    /// Remove a consumed source. Applies to plain files only: remote schemes
    /// stay put, and mounted shares are read-only from this side.
    async fn delete_source(&self, record_uri: &str) {
        let path = match uri::classify(record_uri) {
            Ok(ProtocolKind::File) => uri::local_path(record_uri),
            Ok(ProtocolKind::None) => Some(record_uri),
            _ => None,
        };
        if let Some(path) = path {
            if let Err(err) = tokio::fs::remove_file(path).await {
                tracing::warn!(%err, path, "cannot remove source");
            }
        }
    }

    /// Resolve the output directory for this batch, creating it eagerly.
    /// `daily_output` appends YYYY/MM/DD; `unique_output` appends a
    /// HHMMSS_<subsecond> leaf.
    pub fn output_path(&self) -> Option<String> {
        let root = self.cfg.inotify.output_path.as_ref()?;
        let mut path = root.clone();

        let unique = self.cfg.inotify.unique_output;
        if self.cfg.inotify.daily_output || unique {
            let now = Local::now();
            path.push(now.year().to_string());
            path.push(now.month().to_string());
            path.push(now.day().to_string());
            if unique {
                path.push(format!(
                    "{:02}{:02}{:02}_{}",
                    now.hour(),
                    now.minute(),
                    now.second(),
                    now.timestamp_subsec_millis(),
                ));
            }
        }

        if let Err(err) = std::fs::create_dir_all(&path) {
            tracing::error!(%err, path = %path.display(), "cannot create output directory");
        }
        Some(path.display().to_string())
    }
}

/// Run a configured shell hook with the work file and an output path
/// appended, the way the deployment scripts expect.
async fn run_command(
    command: &str,
    input: &std::path::Path,
    output: &std::path::Path,
) -> anyhow::Result<()> {
    let line = format!("{command} {} {}", input.display(), output.display());
    tracing::debug!(%line, "exec");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&line)
        .stdin(Stdio::null())
        .status()
        .await?;
    anyhow::ensure!(status.success(), "'{command}' exited with {status}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher_with(cfg: Config) -> Arc<Dispatcher> {
        Dispatcher::new(Arc::new(cfg)).unwrap()
    }

    #[tokio::test]
    async fn output_path_layouts() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = Config::default();
        cfg.inotify.output_path = Some(dir.path().join("out"));
        let flat = dispatcher_with(cfg).output_path().unwrap();
        assert_eq!(flat, dir.path().join("out").display().to_string());

        let mut cfg = Config::default();
        cfg.inotify.output_path = Some(dir.path().join("daily"));
        cfg.inotify.daily_output = true;
        let daily = dispatcher_with(cfg).output_path().unwrap();
        let now = Local::now();
        assert!(daily.ends_with(&format!("{}/{}/{}", now.year(), now.month(), now.day())));
        assert!(std::path::Path::new(&daily).is_dir());

        let mut cfg = Config::default();
        cfg.inotify.output_path = Some(dir.path().join("uniq"));
        cfg.inotify.unique_output = true;
        let d = dispatcher_with(cfg);
        let first = d.output_path().unwrap();
        let leaf = std::path::Path::new(&first).file_name().unwrap().to_str().unwrap();
        // HHMMSS_<subsecond>
        let (hms, sub) = leaf.split_once('_').unwrap();
        assert_eq!(hms.len(), 6);
        assert!(hms.chars().all(|c| c.is_ascii_digit()));
        assert!(sub.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn no_output_root_means_no_output() {
        let cfg = Config::default();
        assert!(dispatcher_with(cfg).output_path().is_none());
    }

    #[tokio::test]
    async fn shell_hooks_report_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "x").unwrap();
        let output = dir.path().join("out.txt");

        run_command("cp", &input, &output).await.unwrap();
        assert!(output.exists());
        assert!(run_command("false", &input, &output).await.is_err());
    }
}
