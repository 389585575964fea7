//! Control-plane route semantics.

use scribe_worker::control::{ControlState, router};

async fn spawn() -> String {
    let app = router(ControlState {
        service: "vr".into(),
        version: "v1.0".into(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn local_hostname() -> String {
    hostname::get().unwrap().to_string_lossy().into_owned()
}

#[tokio::test]
async fn telemetry_for_the_local_host() {
    let base = spawn().await;
    let host = local_hostname();

    let res = reqwest::get(format!("{base}/vr/v1.0/servers/{host}"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body.get("cpu").is_some());
    assert!(body.get("memory").is_some());
    assert!(body.get("disk").is_some());
    assert!(body.get("network").is_some());

    // Scoped query returns only the requested section.
    let res = reqwest::get(format!("{base}/vr/v1.0/servers/{host}?q=memory"))
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body.get("memory").is_some());
    assert!(body.get("cpu").is_none());

    // A previous network reading turns counters into deltas.
    let res = reqwest::get(format!("{base}/vr/v1.0/servers/{host}?q=network&v=0,0"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn route_error_taxonomy() {
    let base = spawn().await;
    let host = local_hostname();
    let client = reqwest::Client::new();

    // Reserved resource.
    let res = client
        .get(format!("{base}/vr/v1.0/waves/42"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 405);

    // Unknown resource.
    let res = client
        .get(format!("{base}/vr/v1.0/mystery"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    // Method the resource does not speak.
    let res = client
        .post(format!("{base}/vr/v1.0/servers/{host}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 406);

    // Malformed: wrong service, wrong version, short path, bad query,
    // missing id, foreign hostname.
    for url in [
        format!("{base}/other/v1.0/servers/{host}"),
        format!("{base}/vr/v2.0/servers/{host}"),
        format!("{base}/vr"),
        format!("{base}/vr/v1.0/servers/{host}?q=turbo"),
        format!("{base}/vr/v1.0/servers"),
        format!("{base}/vr/v1.0/servers/not-this-host"),
    ] {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.status(), 400, "expected 400 for {url}");
    }
}

#[tokio::test]
async fn liveness_probe() {
    let base = spawn().await;
    let res = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "ok");
}
