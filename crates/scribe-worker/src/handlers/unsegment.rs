//! Unsegment handlers: cell-streams to readable text, with and without
//! timing.

use std::sync::Arc;

use scribe_broker::{HandlerError, Job};

use super::{WorkerContext, check_payload};
use crate::postproc;

/// `vr_text_only`: text out, no timing, no framing header.
pub async fn handle_text_only(ctx: Arc<WorkerContext>, job: Job) -> Result<Vec<u8>, HandlerError> {
    check_payload(&job)?;

    let cells = String::from_utf8_lossy(&job.payload).into_owned();
    let text = postproc::unsegment(&cells, ctx.postproc.as_ref())
        .map_err(|err| HandlerError::new(format!("fail to unsegment: {err}")))?;

    tracing::info!(handle = %job.handle, bytes = text.len(), "unsegment done");
    Ok(text.into_bytes())
}

/// `vr_text`: the cell-stream round-trips through a temp file and the timed
/// post-processor; the reply carries the framing header.
pub async fn handle_with_time(ctx: Arc<WorkerContext>, job: Job) -> Result<Vec<u8>, HandlerError> {
    check_payload(&job)?;

    let cell_path = ctx.tmp_file(&job.handle, "mlf");
    let text_path = ctx.tmp_file(&job.handle, "txt");
    tokio::fs::write(&cell_path, &job.payload)
        .await
        .map_err(|err| HandlerError::new(format!("fail to receive data: {err}")))?;

    let pause = ctx.cfg.stt.unsegment_pause.unwrap_or(-1);
    let processed = postproc::unsegment_with_time(&ctx.cfg, &cell_path, &text_path, pause).await;

    let result = match processed {
        Ok(()) => match tokio::fs::read_to_string(&text_path).await {
            Ok(body) => {
                let mut text = format!("SUCCESS\n{}\n", ctx.server_name);
                text.push_str(&body);
                Ok(text.into_bytes())
            }
            Err(err) => Err(HandlerError::new(format!("cannot load data: {err}"))),
        },
        Err(err) => Err(HandlerError::new(format!("fail to unsegment_with_time: {err}"))),
    };

    let _ = tokio::fs::remove_file(&cell_path).await;
    let _ = tokio::fs::remove_file(&text_path).await;
    result
}
