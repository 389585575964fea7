//! Typed job handlers for the five queues and their shared context.

pub mod batch;
pub mod ssp;
pub mod unsegment;

use std::path::PathBuf;
use std::sync::Arc;

use scribe_broker::{HandlerError, Job, WorkerRuntime};
use scribe_core::config::Config;
use scribe_core::fetch::{Credentials, FetchOptions, Fetcher};

use crate::engine::EngineStack;
use crate::postproc::{CommandPostProcessor, PlainTextPostProcessor, TextPostProcessor};
use crate::realtime::{PacketState, RealtimeChannels};

pub struct WorkerContext {
    pub cfg: Arc<Config>,
    pub stack: Arc<EngineStack>,
    pub fetcher: Arc<Fetcher>,
    pub postproc: Arc<dyn TextPostProcessor>,
    pub channels: Arc<RealtimeChannels>,
    pub server_name: String,
    pub tmp_path: PathBuf,
}

impl WorkerContext {
    pub fn new(cfg: Arc<Config>) -> anyhow::Result<Arc<Self>> {
        let stack = EngineStack::from_config(&cfg)?;
        let fetcher = Arc::new(Fetcher::new(FetchOptions::from_master(&cfg.master))?);
        let postproc: Arc<dyn TextPostProcessor> = match &cfg.stt.unsegment_command {
            Some(command) => Arc::new(CommandPostProcessor::new(command.clone())),
            None => Arc::new(PlainTextPostProcessor),
        };
        let channels = RealtimeChannels::new(stack.clone(), &cfg)?;

        let tmp_path = cfg.master.tmp_path.clone();
        std::fs::create_dir_all(&tmp_path)?;

        Ok(Arc::new(WorkerContext {
            server_name: cfg.stt.server_name.clone(),
            stack,
            fetcher,
            postproc,
            channels,
            tmp_path,
            cfg,
        }))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let protocol = &self.cfg.protocol;
        if !protocol.enabled {
            return None;
        }
        Some(Credentials {
            username: protocol.username.clone()?,
            password: protocol.password.clone().unwrap_or_default(),
        })
    }

    /// Scratch path for a job's temp artifacts.
    pub fn tmp_file(&self, name: &str, ext: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == ':' { '-' } else { c })
            .collect();
        self.tmp_path.join(format!("{safe}.{ext}"))
    }
}

/// Wire every queue to its handler with the configured pool sizes.
pub fn register_all(runtime: &mut WorkerRuntime, ctx: &Arc<WorkerContext>) {
    let cfg = ctx.cfg.clone();

    let batch_ctx = ctx.clone();
    runtime.register_handler(
        "vr_stt",
        cfg.queue_workers("vr_stt"),
        Arc::new(move |job: Job| batch::handle(batch_ctx.clone(), job)),
    );

    let text_ctx = ctx.clone();
    runtime.register_handler(
        "vr_text_only",
        cfg.queue_workers("vr_text_only"),
        Arc::new(move |job: Job| unsegment::handle_text_only(text_ctx.clone(), job)),
    );

    let timed_ctx = ctx.clone();
    runtime.register_handler(
        "vr_text",
        cfg.queue_workers("vr_text"),
        Arc::new(move |job: Job| unsegment::handle_with_time(timed_ctx.clone(), job)),
    );

    let ssp_ctx = ctx.clone();
    runtime.register_handler(
        "vr_ssp",
        cfg.queue_workers("vr_ssp"),
        Arc::new(move |job: Job| ssp::handle(ssp_ctx.clone(), job)),
    );

    let rt_ctx = ctx.clone();
    runtime.register_handler(
        "vr_realtime",
        cfg.queue_workers("vr_realtime"),
        Arc::new(move |job: Job| handle_realtime(rt_ctx.clone(), job)),
    );
}

/// Payloads below this are malformed, whatever the queue.
pub(crate) const MIN_PAYLOAD: usize = 10;

pub(crate) fn check_payload(job: &Job) -> Result<(), HandlerError> {
    if job.payload.len() < MIN_PAYLOAD {
        return Err(HandlerError::new(format!(
            "the payload is too small (< {MIN_PAYLOAD} bytes)"
        )));
    }
    Ok(())
}

/// `call_id|CMD|raw-pcm` framing of the realtime queue.
async fn handle_realtime(ctx: Arc<WorkerContext>, job: Job) -> Result<Vec<u8>, HandlerError> {
    check_payload(&job)?;

    let first = job
        .payload
        .iter()
        .position(|b| *b == b'|')
        .ok_or_else(|| HandlerError::new("cannot find call id"))?;
    let second = job.payload[first + 1..]
        .iter()
        .position(|b| *b == b'|')
        .map(|p| first + 1 + p)
        .ok_or_else(|| HandlerError::new("invalid realtime packet"))?;

    let call_id = String::from_utf8_lossy(&job.payload[..first]).into_owned();
    let command = String::from_utf8_lossy(&job.payload[first + 1..second]).into_owned();
    let state = PacketState::from_command(&command);
    let samples = scribe_core::audio::bytes_to_samples(&job.payload[second + 1..]);

    tracing::debug!(
        %call_id,
        %command,
        samples = samples.len(),
        state = ?state,
        "realtime packet"
    );

    let cells = ctx
        .channels
        .stt(&call_id, &samples, state)
        .await
        .map_err(|err| HandlerError::new(format!("fail to stt: {err}")))?;

    let mut text = String::new();
    if state == PacketState::Last {
        text.push_str(&ctx.server_name);
        text.push('\n');
    }
    let body = crate::postproc::unsegment(&cells, ctx.postproc.as_ref())
        .map_err(|err| HandlerError::new(format!("fail to unsegment: {err}")))?;
    text.push_str(&body);
    Ok(text.into_bytes())
}
