use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use scribe_broker::stub::StubBroker;
use scribe_broker::{BrokerClient, BrokerError, HandlerError, Job, WorkerRuntime, admin};

#[tokio::test]
async fn submit_reaches_handler_and_reply_comes_back() {
    let broker = StubBroker::spawn().await.unwrap();

    let mut runtime = WorkerRuntime::new(broker.host(), broker.port());
    runtime.register_handler(
        "vr_stt",
        1,
        Arc::new(|job: Job| async move {
            let text = String::from_utf8_lossy(&job.payload).to_uppercase();
            Ok(text.into_bytes())
        }),
    );

    let client = BrokerClient::new(broker.host(), broker.port());
    let reply = client
        .submit("vr_stt", b"hello", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply, b"HELLO");

    runtime.shutdown();
    runtime.join().await;
}

#[tokio::test]
async fn handler_failure_maps_to_job_failed() {
    let broker = StubBroker::spawn().await.unwrap();

    let mut runtime = WorkerRuntime::new(broker.host(), broker.port());
    runtime.register_handler(
        "vr_text",
        1,
        Arc::new(|_job: Job| async move {
            Err::<Vec<u8>, _>(HandlerError::new("post-processor unavailable"))
        }),
    );

    let client = BrokerClient::new(broker.host(), broker.port());
    let err = client
        .submit("vr_text", b"0\t10\tx\t1\n", Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::JobFailed));

    runtime.shutdown();
    runtime.join().await;
}

#[tokio::test]
async fn every_submission_gets_exactly_one_outcome() {
    let broker = StubBroker::spawn().await.unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    let mut runtime = WorkerRuntime::new(broker.host(), broker.port());
    let served_in_handler = served.clone();
    runtime.register_handler(
        "vr_stt",
        2,
        Arc::new(move |job: Job| {
            let served = served_in_handler.clone();
            async move {
                served.fetch_add(1, Ordering::SeqCst);
                Ok(job.payload)
            }
        }),
    );

    let client = Arc::new(BrokerClient::new(broker.host(), broker.port()));
    let mut joins = Vec::new();
    for i in 0..5u8 {
        let client = client.clone();
        joins.push(tokio::spawn(async move {
            client
                .submit("vr_stt", &[i], Some(Duration::from_secs(10)))
                .await
        }));
    }

    let mut replies = Vec::new();
    for join in joins {
        replies.push(join.await.unwrap().unwrap());
    }
    replies.sort();
    assert_eq!(replies, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    assert_eq!(served.load(Ordering::SeqCst), 5);

    runtime.shutdown();
    runtime.join().await;
}

#[tokio::test]
async fn status_reports_registered_workers() {
    let broker = StubBroker::spawn().await.unwrap();

    let mut runtime = WorkerRuntime::new(broker.host(), broker.port());
    runtime.register_handler(
        "vr_stt",
        3,
        Arc::new(|job: Job| async move { Ok(job.payload) }),
    );

    // Registration is asynchronous; poll until the broker has seen CAN_DO.
    let mut workers = None;
    for _ in 0..50 {
        workers = admin::worker_count(&broker.host(), broker.port(), "vr_stt")
            .await
            .unwrap();
        if workers == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(workers, Some(3));
    assert_eq!(
        admin::worker_count(&broker.host(), broker.port(), "vr_nope")
            .await
            .unwrap(),
        None
    );

    runtime.shutdown();
    runtime.join().await;
}
