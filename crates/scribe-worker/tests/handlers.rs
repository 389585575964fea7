//! Handler tests over a real broker round-trip: stub broker, worker runtime
//! with the production handlers, broker client on the submitting side.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scribe_broker::stub::StubBroker;
use scribe_broker::{BrokerClient, WorkerRuntime};
use scribe_core::audio::{samples_to_bytes, standard_wave_header};
use scribe_core::cells::{Reply, parse_cells};
use scribe_core::config::Config;
use scribe_core::error::StatusToken;
use scribe_worker::handlers::{self, WorkerContext};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

struct Harness {
    _broker: StubBroker,
    _tmp: tempfile::TempDir,
    runtime: WorkerRuntime,
    client: BrokerClient,
    ctx: Arc<WorkerContext>,
}

async fn harness(tune: impl FnOnce(&mut Config, &Path)) -> Harness {
    let broker = StubBroker::spawn().await.unwrap();
    let tmp = tempfile::tempdir().unwrap();

    let mut cfg = Config::default();
    cfg.stt.server_name = "vr_test_1".into();
    cfg.stt.mfcc_size = 8;
    cfg.stt.mini_batch = 10;
    cfg.master.tmp_path = tmp.path().join("scratch");
    tune(&mut cfg, tmp.path());

    let ctx = WorkerContext::new(Arc::new(cfg)).unwrap();
    let mut runtime = WorkerRuntime::new(broker.host(), broker.port());
    handlers::register_all(&mut runtime, &ctx);
    let client = BrokerClient::new(broker.host(), broker.port());

    Harness {
        _broker: broker,
        _tmp: tmp,
        runtime,
        client,
        ctx,
    }
}

fn loud_pcm(frames: usize) -> Vec<i16> {
    vec![8192; frames * 80]
}

fn standard_wav(samples: &[i16]) -> Vec<u8> {
    let body = samples_to_bytes(samples);
    let mut wav = standard_wave_header(body.len() as u32).to_vec();
    wav.extend_from_slice(&body);
    wav
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn single_wav_produces_a_framed_cell_stream() {
    let h = harness(|_, _| {}).await;

    let payload = standard_wav(&loud_pcm(100));
    let raw = h.client.submit("vr_stt", &payload, TIMEOUT).await.unwrap();

    let reply = Reply::parse(&raw).expect("reply frame");
    assert_eq!(reply.status, StatusToken::Success);
    assert_eq!(reply.server, "vr_test_1");
    assert_eq!(reply.byte_count, Some((payload.len() - 44) as u64));

    let cells = parse_cells(&reply.payload);
    assert!(!cells.is_empty());
    for cell in &cells {
        assert!(cell.start <= cell.end);
        assert!(!cell.token.is_empty());
        assert!(cell.like.is_finite());
    }

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn missing_source_file_reports_the_ingress_code() {
    let h = harness(|_, _| {}).await;

    let raw = h
        .client
        .submit("vr_stt", b"file:///no/such/recording.wav", TIMEOUT)
        .await
        .unwrap();
    let reply = Reply::parse(&raw).unwrap();
    assert_eq!(reply.status, StatusToken::FailNoFile);
    assert_eq!(reply.server, "vr_test_1");
    assert!(reply.payload.is_empty());

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn non_standard_wave_goes_through_the_decoder() {
    let h = harness(|cfg, dir| {
        cfg.stt.decoder = Some(write_script(
            dir,
            "decoder.sh",
            "#!/bin/sh\ntail -c +45 \"$1\" > \"${1%.*}.pcm\"\n",
        ));
    })
    .await;

    // 16 kHz mono: a valid RIFF that is not the standard stream.
    let mut payload = standard_wav(&loud_pcm(100));
    payload[24..28].copy_from_slice(&16000u32.to_le_bytes());

    let raw = h.client.submit("vr_stt", &payload, TIMEOUT).await.unwrap();
    let reply = Reply::parse(&raw).unwrap();
    assert_eq!(reply.status, StatusToken::Success);
    assert!(!parse_cells(&reply.payload).is_empty());

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn decoder_failure_is_a_terminal_decoding_reply() {
    let h = harness(|cfg, dir| {
        cfg.stt.decoder = Some(write_script(dir, "broken.sh", "#!/bin/sh\nexit 3\n"));
    })
    .await;

    let mut payload = standard_wav(&loud_pcm(20));
    payload[24..28].copy_from_slice(&16000u32.to_le_bytes());

    let raw = h.client.submit("vr_stt", &payload, TIMEOUT).await.unwrap();
    let reply = Reply::parse(&raw).unwrap();
    assert_eq!(reply.status, StatusToken::FailDecoding);

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn stereo_wav_is_split_and_joined_with_the_separator() {
    let h = harness(|cfg, dir| {
        cfg.stt.separator = Some(write_script(
            dir,
            "separator.sh",
            "#!/bin/sh\nin=\"$1\"\nstem=\"${in%.*}\"\ntail -c +45 \"$in\" > \"${stem}_left.pcm\"\ntail -c +45 \"$in\" > \"${stem}_right.pcm\"\n",
        ));
    })
    .await;

    let mut payload = standard_wav(&loud_pcm(50));
    payload[22..24].copy_from_slice(&2u16.to_le_bytes());

    let raw = h.client.submit("vr_stt", &payload, TIMEOUT).await.unwrap();
    let reply = Reply::parse(&raw).unwrap();
    assert_eq!(reply.status, StatusToken::Success);

    let channels = reply.channels();
    assert_eq!(channels.len(), 2, "stereo reply joins two payload blocks");
    assert!(!parse_cells(channels[0]).is_empty());
    assert!(!parse_cells(channels[1]).is_empty());

    // Channel sidecars are cleaned up.
    let leftovers: Vec<_> = std::fs::read_dir(h.ctx.tmp_path.clone())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".pcm") || name.ends_with(".wav"))
        .collect();
    assert!(leftovers.is_empty(), "temp artifacts left behind: {leftovers:?}");

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn realtime_call_over_the_broker() {
    let h = harness(|_, _| {}).await;
    assert_eq!(h.ctx.channels.active_count().await, 0);

    let pcm = samples_to_bytes(&loud_pcm(10));
    let mut first = b"c1|FIRS|".to_vec();
    first.extend_from_slice(&pcm);
    let mut mid = b"c1||".to_vec();
    mid.extend_from_slice(&pcm);
    let mut last = b"c1|LAST|".to_vec();
    last.extend_from_slice(&pcm);

    let _ = h.client.submit("vr_realtime", &first, TIMEOUT).await.unwrap();
    assert_eq!(h.ctx.channels.active_count().await, 1);

    let _ = h.client.submit("vr_realtime", &mid, TIMEOUT).await.unwrap();
    assert_eq!(h.ctx.channels.active_count().await, 1);

    let final_reply = h.client.submit("vr_realtime", &last, TIMEOUT).await.unwrap();
    let text = String::from_utf8(final_reply).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("vr_test_1"));
    let recognized = lines.next().unwrap_or_default();
    assert!(!recognized.is_empty(), "LAST carries the recognized text");

    assert_eq!(h.ctx.channels.active_count().await, 0);

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn unsegment_only_returns_plain_text() {
    let h = harness(|_, _| {}).await;

    let cells = b"0\t10\t<s>\t0\n10\t20\t#hello\t0.9\n20\t30\tworld\t0.8\n";
    let raw = h.client.submit("vr_text_only", cells, TIMEOUT).await.unwrap();
    assert_eq!(String::from_utf8(raw).unwrap(), "hello world\n");

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn timed_unsegment_frames_its_reply() {
    let h = harness(|_, _| {}).await;

    let cells = b"0\t40\thi\t0.9\n45\t80\tthere\t0.8\n500\t540\tbye\t0.7\n";
    let raw = h.client.submit("vr_text", cells, TIMEOUT).await.unwrap();
    let text = String::from_utf8(raw).unwrap();

    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("SUCCESS"));
    assert_eq!(lines.next(), Some("vr_test_1"));
    assert_eq!(lines.next(), Some("0\t80\thi there"));
    assert_eq!(lines.next(), Some("500\t540\tbye"));

    h.runtime.shutdown();
    h.runtime.join().await;
}

#[tokio::test]
async fn ssp_utility_sees_annotations_and_replies_verbatim() {
    // The external utility gets boundaries and scores; whatever it prints is
    // the reply. This stand-in echoes its input back, proving the stream
    // reaches it unstripped.
    let h = harness(|cfg, dir| {
        cfg.ssp.util = Some(write_script(dir, "classify.sh", "#!/bin/sh\ncat \"$1\"\n"));
    })
    .await;

    let cells = b"0\t10\t<s>\t0.0\n10\t80\tagree\t0.9\n80\t90\t</s>\t0.0\n";
    let raw = h.client.submit("vr_ssp", cells, TIMEOUT).await.unwrap();
    assert_eq!(
        String::from_utf8(raw).unwrap(),
        "0\t10\t<s>\t0.0\n10\t80\tagree\t0.9\n80\t90\t</s>\t0.0\n"
    );

    h.runtime.shutdown();
    h.runtime.join().await;
}
