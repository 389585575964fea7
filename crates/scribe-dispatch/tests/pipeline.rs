//! Dispatcher pipeline tests against an in-process REST backend.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use scribe_core::config::{Config, IndexType};
use scribe_dispatch::engine::{Dispatcher, RecordOutcome};
use scribe_dispatch::index::JobRecord;
use scribe_dispatch::watch::{DirWatcher, WatchEvent};

#[derive(Clone, Default)]
struct BackendState {
    logins: Arc<AtomicUsize>,
    submissions: Arc<AtomicUsize>,
    current: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    scripted: Arc<Mutex<VecDeque<u16>>>,
}

async fn login(State(state): State<BackendState>) -> Json<Value> {
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    // Tokens are unique per login so invalidation matching is observable.
    Json(json!({ "access_token": format!("tok-{n:028}") }))
}

async fn jobs(State(state): State<BackendState>, Json(_body): Json<Value>) -> StatusCode {
    let now = state.current.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_concurrent.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    state.current.fetch_sub(1, Ordering::SeqCst);

    state.submissions.fetch_add(1, Ordering::SeqCst);
    let code = state
        .scripted
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(200);
    StatusCode::from_u16(code).unwrap()
}

async fn spawn_backend(state: BackendState) -> String {
    let app = Router::new()
        .route("/login", post(login))
        .route("/vr/v1.0/jobs", post(jobs))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn base_config(input: &Path, backend_url: &str) -> Config {
    let mut cfg = Config::default();
    cfg.inotify.input_path = Some(input.to_path_buf());
    cfg.api.url = backend_url.to_string();
    cfg
}

#[tokio::test]
async fn list_of_uris_respects_the_count_ceiling() {
    let state = BackendState::default();
    let url = spawn_backend(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let lines: Vec<String> = (1..=5).map(|i| format!("http://h/{i}.wav")).collect();
    std::fs::write(dir.path().join("batch.list"), lines.join("\n")).unwrap();

    let mut cfg = base_config(dir.path(), &url);
    cfg.inotify.watch = "list".into();
    cfg.inotify.index_type = IndexType::List;
    cfg.inotify.index_format = Some("{filename}".into());
    cfg.inotify.download_path = Some(String::new());
    cfg.inotify.maximum_jobs = Some(2);

    let dispatcher = Dispatcher::new(Arc::new(cfg)).unwrap();
    dispatcher
        .run_event(WatchEvent {
            dir: dir.path().to_path_buf(),
            filename: "batch.list".into(),
        })
        .await;

    assert_eq!(state.submissions.load(Ordering::SeqCst), 5);
    assert!(state.max_concurrent.load(Ordering::SeqCst) <= 2);
    assert!(dispatcher.admission().index().is_empty());
}

#[tokio::test]
async fn expired_token_triggers_one_refresh_and_one_retry() {
    let state = BackendState::default();
    state.scripted.lock().unwrap().push_back(401);
    let url = spawn_backend(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let cfg = base_config(dir.path(), &url);
    let dispatcher = Dispatcher::new(Arc::new(cfg)).unwrap();

    let record = JobRecord {
        uri: "http://h/a.wav".into(),
        metadata: Default::default(),
    };
    let outcome = dispatcher.submit_record(&record, None).await;

    assert_eq!(outcome, RecordOutcome::Completed);
    // Initial login plus exactly one refresh after the 401.
    assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(state.submissions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn token_refresh_is_single_flight() {
    use scribe_dispatch::auth::AuthTokenCache;

    let state = BackendState::default();
    let url = spawn_backend(state.clone()).await;

    let mut api = scribe_core::config::ApiConfig::default();
    api.url = url;
    let cache = Arc::new(AuthTokenCache::new(reqwest::Client::new(), &api));

    // A stampede of callers produces exactly one login.
    let mut joins = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        joins.push(tokio::spawn(async move { cache.header().await.unwrap() }));
    }
    let mut tokens = Vec::new();
    for join in joins {
        tokens.push(join.await.unwrap().value);
    }
    assert!(tokens.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(state.logins.load(Ordering::SeqCst), 1);

    // Concurrent invalidations of the same token cause a single refresh.
    let seen = tokens[0].clone();
    let mut joins = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let seen = seen.clone();
        joins.push(tokio::spawn(async move {
            cache.invalidate(&seen).await;
            cache.header().await.unwrap()
        }));
    }
    for join in joins {
        join.await.unwrap();
    }
    assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(cache.login_count(), 2);
}

#[tokio::test]
async fn terminal_rejection_is_not_retried() {
    let state = BackendState::default();
    state.scripted.lock().unwrap().push_back(500);
    let url = spawn_backend(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let cfg = base_config(dir.path(), &url);
    let dispatcher = Dispatcher::new(Arc::new(cfg)).unwrap();

    let record = JobRecord {
        uri: "http://h/b.wav".into(),
        metadata: Default::default(),
    };
    let outcome = dispatcher.submit_record(&record, None).await;
    assert_eq!(outcome, RecordOutcome::FailedRejected);
    assert_eq!(state.submissions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_wav_is_submitted_and_deleted_on_success() {
    let state = BackendState::default();
    let url = spawn_backend(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut cfg = base_config(dir.path(), &url);
    cfg.inotify.watch = "wav".into();
    cfg.inotify.index_type = IndexType::Filename;
    cfg.inotify.index_format = Some("{call_id}.wav".into());
    cfg.inotify.delete_on_success = true;

    let dispatcher = Dispatcher::new(Arc::new(cfg.clone())).unwrap();
    let (watcher, mut events) = DirWatcher::spawn(dir.path(), "wav").unwrap();

    let wav = dir.path().join("CALL01.wav");
    {
        use std::io::Write as _;
        let mut f = std::fs::File::create(&wav).unwrap();
        f.write_all(&[0u8; 128]).unwrap();
    }

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("watch event")
        .unwrap();
    dispatcher.run_event(event).await;

    assert_eq!(state.submissions.load(Ordering::SeqCst), 1);
    assert!(!wav.exists(), "source removed after a successful submission");
    assert!(dispatcher.admission().index().is_empty());
    drop(watcher);
}
