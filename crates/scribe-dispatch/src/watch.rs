//! Ingest directory watcher.
//!
//! Emits one event per file whose writer has closed it, filtered by the
//! configured extension. Dot-files and directories are ignored.

use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, EventKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub dir: PathBuf,
    pub filename: String,
}

/// Whether a filename should trigger work for the configured extension.
pub fn matches_watch_ext(filename: &str, watch_ext: &str) -> bool {
    if filename.starts_with('.') {
        return false;
    }
    match filename.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && ext == watch_ext,
        None => false,
    }
}

pub struct DirWatcher {
    // Held for its side effect; dropping it stops event delivery.
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Start watching `input_path`. Events arrive on the returned channel;
    /// the watcher stops when the returned handle is dropped.
    pub fn spawn(
        input_path: &Path,
        watch_ext: &str,
    ) -> notify::Result<(DirWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ext = watch_ext.to_string();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(%err, "watch error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Access(AccessKind::Close(AccessMode::Write))
            ) {
                return;
            }
            for path in event.paths {
                if path.is_dir() {
                    continue;
                }
                let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !matches_watch_ext(filename, &ext) {
                    tracing::debug!(filename, watch = %ext, "ignoring non-matching file");
                    continue;
                }
                let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
                let _ = tx.send(WatchEvent {
                    dir,
                    filename: filename.to_string(),
                });
            }
        })?;

        watcher.watch(input_path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %input_path.display(), "initialize monitoring module");
        Ok((DirWatcher { _watcher: watcher }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        assert!(matches_watch_ext("a.wav", "wav"));
        assert!(matches_watch_ext("call.2026.wav", "wav"));
        assert!(!matches_watch_ext("a.wavx", "wav"));
        assert!(!matches_watch_ext("a.pcm", "wav"));
        assert!(!matches_watch_ext(".hidden.wav", "wav"));
        assert!(!matches_watch_ext("noext", "wav"));
    }

    #[tokio::test]
    async fn close_write_produces_an_event() {
        use std::io::Write as _;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut rx) = DirWatcher::spawn(dir.path(), "wav").unwrap();

        {
            let mut f = std::fs::File::create(dir.path().join("a.wav")).unwrap();
            f.write_all(b"data").unwrap();
        } // close-write fires here

        std::fs::write(dir.path().join("skip.txt"), b"x").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the wav file")
            .unwrap();
        assert_eq!(event.filename, "a.wav");
        assert_eq!(event.dir, dir.path());

        // The .txt close must not have produced anything.
        assert!(rx.try_recv().is_err());
        drop(watcher);
    }
}
