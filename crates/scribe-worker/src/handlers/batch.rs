//! The batch STT handler (`vr_stt`).
//!
//! A payload is either a locator for a recording or the raw PCM itself. The
//! flow: resolve bytes, classify the container, normalize to mono 8 kHz PCM
//! (invoking the external decoder/separator where needed), decode to a
//! cell-stream and frame the reply. Download and decoding failures are
//! reported as framed status replies, not broker-level failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use scribe_broker::{HandlerError, Job};
use scribe_core::audio::{self, WAVE_HEADER_LEN, WaveFormat};
use scribe_core::cells::{Reply, format_cells, join_stereo};
use scribe_core::error::StatusToken;
use scribe_core::uri::{self, ProtocolKind};

use super::{WorkerContext, check_payload};
use crate::stt;

pub async fn handle(ctx: Arc<WorkerContext>, job: Job) -> Result<Vec<u8>, HandlerError> {
    check_payload(&job)?;

    // Locator or inline stream?
    let head = String::from_utf8_lossy(&job.payload[..job.payload.len().min(10)]).into_owned();
    let inline = !head.contains("://");

    let (data, protocol, source) = if inline {
        (job.payload.clone(), ProtocolKind::None, None)
    } else {
        let source = String::from_utf8_lossy(&job.payload)
            .trim_end_matches(['\0', '\n', ' '])
            .to_string();
        let protocol = match uri::classify(&source) {
            Ok(protocol) => protocol,
            Err(err) => return Err(HandlerError::new(err.to_string())),
        };
        tracing::info!(uri = %source, "download start");
        match ctx.fetcher.fetch_bytes(&source, ctx.credentials().as_ref()).await {
            Ok(data) => {
                tracing::info!(uri = %source, bytes = data.len(), "download end");
                (data, protocol, Some(source))
            }
            Err(err) => {
                tracing::error!(%err, uri = %source, "fail to download");
                return Ok(Reply::failure(err.status_token(), &ctx.server_name).render());
            }
        }
    };

    let format = audio::check_wave_format(&data);
    let pcm: Vec<u8> = match format {
        WaveFormat::StandardWave => {
            tracing::info!("input data is standard WAVE format");
            data.get(WAVE_HEADER_LEN..).unwrap_or_default().to_vec()
        }
        WaveFormat::Unknown => {
            tracing::warn!("input data looks like raw PCM, attempting analysis");
            data
        }
        WaveFormat::Wave | WaveFormat::Mpeg | WaveFormat::MpegId3 => {
            match run_decoder(&ctx, &job, &data, format, protocol, source.as_deref()).await {
                Ok(pcm) => pcm,
                Err(err) => {
                    tracing::error!(%err, "fail to decoding");
                    return Ok(Reply::failure(StatusToken::FailDecoding, &ctx.server_name).render());
                }
            }
        }
        WaveFormat::Wave2Ch => {
            return stereo_wave(&ctx, &job, &data, protocol, source.as_deref()).await;
        }
        WaveFormat::Mpeg2Ch => {
            return Err(HandlerError::new("stereo MPEG input is not supported"));
        }
    };

    let samples = audio::bytes_to_samples(&pcm);
    let cells = decode(&ctx, samples).await?;

    let mut reply = Reply::success(&ctx.server_name, pcm.len() as u64, format_cells(&cells));
    if ctx.cfg.stt.spk_enable {
        reply.spk_node = Some(
            ctx.cfg
                .stt
                .spk_worker_name
                .clone()
                .unwrap_or_else(|| "vr_spk".into()),
        );
    }
    tracing::debug!(handle = %job.handle, bytes = reply.payload.len(), "STT done");
    Ok(reply.render())
}

async fn decode(ctx: &Arc<WorkerContext>, samples: Vec<i16>) -> Result<Vec<scribe_core::cells::Cell>, HandlerError> {
    let stack = ctx.stack.clone();
    tokio::task::spawn_blocking(move || stt::run_stt(&stack, &samples))
        .await
        .map_err(|err| HandlerError::new(format!("stt task: {err}")))?
        .map_err(|err| HandlerError::new(format!("fail to stt: {err}")))
}

/// Resolve the on-disk input file the external tools operate on. Local
/// sources are used in place; everything else is staged under the scratch
/// path using the source's own file name.
async fn stage_input(
    ctx: &WorkerContext,
    job: &Job,
    data: &[u8],
    is_wave: bool,
    protocol: ProtocolKind,
    source: Option<&str>,
) -> std::io::Result<(PathBuf, bool)> {
    if protocol.is_local() {
        let path = source
            .and_then(uri::local_path)
            .map(PathBuf::from)
            .expect("local protocol carries a path");
        return Ok((path, false));
    }

    let stem = source
        .map(|s| {
            let name = uri::file_name(s);
            name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name).to_string()
        })
        .unwrap_or_else(|| job.handle.clone());
    let staged = ctx.tmp_file(&stem, if is_wave { "wav" } else { "mp3" });
    tracing::debug!(path = %staged.display(), "write staged input");
    tokio::fs::write(&staged, data).await?;
    Ok((staged, true))
}

async fn run_decoder(
    ctx: &Arc<WorkerContext>,
    job: &Job,
    data: &[u8],
    format: WaveFormat,
    protocol: ProtocolKind,
    source: Option<&str>,
) -> anyhow::Result<Vec<u8>> {
    let decoder = ctx
        .cfg
        .stt
        .decoder
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("cannot decode: stt.decoder is not set"))?;

    let is_wave = format == WaveFormat::Wave;
    let (input, staged) = stage_input(ctx, job, data, is_wave, protocol, source).await?;

    let run = async {
        let line = format!("{decoder} {}", input.display());
        tracing::debug!(%line, "exec decoder");
        let status = tokio::process::Command::new("sh").arg("-c").arg(&line).status().await?;
        anyhow::ensure!(status.success(), "'{decoder}' exited with {status}");

        let sidecar = input.with_extension("pcm");
        let pcm = tokio::fs::read(&sidecar).await?;
        tracing::debug!(path = %sidecar.display(), "delete temporary file");
        let _ = tokio::fs::remove_file(&sidecar).await;
        Ok(pcm)
    };
    let result = run.await;

    if staged {
        let _ = tokio::fs::remove_file(&input).await;
    }
    result
}

async fn stereo_wave(
    ctx: &Arc<WorkerContext>,
    job: &Job,
    data: &[u8],
    protocol: ProtocolKind,
    source: Option<&str>,
) -> Result<Vec<u8>, HandlerError> {
    tracing::info!("input data is 2CH WAVE");
    let Some(separator) = ctx.cfg.stt.separator.clone() else {
        return Err(HandlerError::new("cannot separate: stt.separator is not set"));
    };

    let (input, staged) = stage_input(ctx, job, data, true, protocol, source)
        .await
        .map_err(|err| HandlerError::new(format!("cannot stage input: {err}")))?;

    let parent = input
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let line = format!("{separator} {} {}", input.display(), parent.display());
    tracing::debug!(%line, "exec separator");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&line)
        .status()
        .await
        .map_err(|err| HandlerError::new(format!("separator: {err}")))?;
    if staged {
        let _ = tokio::fs::remove_file(&input).await;
    }
    if !status.success() {
        return Err(HandlerError::new(format!("fail to separation: {status}")));
    }

    let stem = input.with_extension("");
    let mut parts = Vec::with_capacity(2);
    let mut part_bytes = 0u64;
    for side in ["left", "right"] {
        let channel_path = PathBuf::from(format!("{}_{side}.pcm", stem.display()));
        let pcm = match tokio::fs::read(&channel_path).await {
            Ok(pcm) => pcm,
            Err(err) => {
                tracing::error!(%err, path = %channel_path.display(), "cannot decoding");
                let _ = tokio::fs::remove_file(&channel_path).await;
                return Ok(Reply::failure(StatusToken::FailDecoding, &ctx.server_name).render());
            }
        };
        part_bytes = pcm.len() as u64;

        let samples = audio::bytes_to_samples(&pcm);
        let cells = decode(ctx, samples).await?;
        parts.push(format_cells(&cells));
        let _ = tokio::fs::remove_file(&channel_path).await;
    }

    let reply = Reply::success(
        &ctx.server_name,
        part_bytes,
        join_stereo(&parts[0], &parts[1]),
    );
    tracing::debug!(handle = %job.handle, "stereo STT done");
    Ok(reply.render())
}
