//! Batch speech-to-text decode loop.
//!
//! Feeds a whole recording through the front-end in minibatch-sized reads,
//! steps the engine frame by frame, and bounds decoder state with the reset
//! period: once the frame index passes it, the current segment is finalized,
//! the engine reset, and later cells are offset by the carried position.

use scribe_core::cells::Cell;

use crate::engine::{EngineInstance, EngineStack};
use crate::engine::sim::SAMPLES_PER_FRAME;

/// Silence frames fed before reading a final alignment, letting the decoder
/// settle trailing word boundaries.
const SETTLE_FRAMES: usize = 40;

pub fn run_stt(stack: &EngineStack, samples: &[i16]) -> anyhow::Result<Vec<Cell>> {
    run_stt_with_reset(stack, samples, stack.reset_period)
}

pub fn run_stt_with_reset(
    stack: &EngineStack,
    samples: &[i16],
    reset_period: usize,
) -> anyhow::Result<Vec<Cell>> {
    let mut engine = stack.create_child()?;
    let mut frontend = stack.new_frontend();
    engine.reset()?;
    frontend.reset();

    let read_size = SAMPLES_PER_FRAME * stack.mini_batch;
    let mut features = vec![0.0f32; stack.feature_dim()];
    let mut cells = Vec::new();
    let mut index = 0usize;
    let mut last_position = 0u64;

    for chunk in samples.chunks(read_size) {
        let written = frontend.step(chunk, &mut features)?;
        if written == 0 {
            continue;
        }
        feed_frames(&mut *engine, stack, index, &features[..written])?;
        index += written / stack.mfcc_size;

        if index > reset_period {
            finalize_segment(&mut *engine, stack, &mut index, &mut last_position, &mut cells)?;
        }
    }

    // Flush the front-end remainder (zero padding closes the last frame).
    let written = frontend.step(&[], &mut features)?;
    if written > 0 {
        feed_frames(&mut *engine, stack, index, &features[..written])?;
        index += written / stack.mfcc_size;
    }

    if index > 0 {
        finalize_segment(&mut *engine, stack, &mut index, &mut last_position, &mut cells)?;
    }

    Ok(cells)
}

pub(crate) fn feed_frames(
    engine: &mut dyn EngineInstance,
    stack: &EngineStack,
    base_index: usize,
    features: &[f32],
) -> anyhow::Result<()> {
    let feature_dim = stack.feature_dim();
    for (i, frame) in features.chunks_exact(stack.mfcc_size).enumerate() {
        engine.step(base_index + i, feature_dim, frame)?;
    }
    Ok(())
}

/// Close the current segment: settle with silence, pull the final result,
/// shift cells by the carried position, and reset the engine.
pub(crate) fn finalize_segment(
    engine: &mut dyn EngineInstance,
    stack: &EngineStack,
    index: &mut usize,
    last_position: &mut u64,
    out: &mut Vec<Cell>,
) -> anyhow::Result<()> {
    let feature_dim = stack.feature_dim();
    for i in 0..SETTLE_FRAMES {
        engine.step(*index + i, feature_dim, &stack.silence)?;
    }

    let segment = engine.final_result(*index + SETTLE_FRAMES)?;
    let advance = segment.last().map(|cell| cell.end).unwrap_or(0);
    out.extend(segment.into_iter().map(|cell| Cell {
        start: cell.start + *last_position,
        end: cell.end + *last_position,
        ..cell
    }));
    *last_position += advance;

    engine.reset()?;
    *index = 0;
    Ok(())
}
