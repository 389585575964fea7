//! Deterministic simulation engine.
//!
//! Stands in for the licensed decoder so the fabric can run and be tested
//! end to end. The front-end condenses each 80-sample frame into a constant
//! energy feature; the engine buckets frames and emits one token per
//! non-silent bucket, with the token text derived from the quantized energy.
//! The mapping is pure, so identical audio always yields identical tokens
//! regardless of where engine resets fall (bucket-aligned).

use scribe_core::cells::Cell;

use super::{EngineInstance, EngineMaster, FrontEnd, FrontEndOptions};

/// Samples per feature frame at 8 kHz.
pub const SAMPLES_PER_FRAME: usize = 80;
/// Frames per emitted token.
pub const FRAMES_PER_TOKEN: usize = 10;
/// Energy below this is treated as silence and emits nothing.
const SILENCE_FLOOR: f32 = 1e-3;

pub struct SimEngineMaster;

impl SimEngineMaster {
    pub fn new() -> Self {
        SimEngineMaster
    }
}

impl Default for SimEngineMaster {
    fn default() -> Self {
        SimEngineMaster::new()
    }
}

impl EngineMaster for SimEngineMaster {
    fn create_child(&self) -> anyhow::Result<Box<dyn EngineInstance>> {
        Ok(Box::new(SimEngineInstance { energies: Vec::new() }))
    }
}

struct SimEngineInstance {
    /// Per-frame energy since the last reset, indexed by frame position.
    energies: Vec<f32>,
}

impl SimEngineInstance {
    fn cells_up_to(&self, index: usize) -> Vec<Cell> {
        let end = index.min(self.energies.len());
        let mut cells = Vec::new();
        for bucket_start in (0..end).step_by(FRAMES_PER_TOKEN) {
            let bucket_end = (bucket_start + FRAMES_PER_TOKEN).min(end);
            let frames = &self.energies[bucket_start..bucket_end];
            let mean = frames.iter().sum::<f32>() / frames.len() as f32;
            if mean < SILENCE_FLOOR {
                continue;
            }
            let level = (mean * 16.0).min(15.0) as u32;
            cells.push(Cell {
                start: bucket_start as u64,
                end: bucket_end as u64,
                token: format!("w{level:x}"),
                like: f64::from(mean),
            });
        }
        cells
    }
}

impl EngineInstance for SimEngineInstance {
    fn reset(&mut self) -> anyhow::Result<()> {
        self.energies.clear();
        Ok(())
    }

    fn step(
        &mut self,
        frame_index: usize,
        _feature_dim: usize,
        frame: &[f32],
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!frame.is_empty(), "empty feature frame");
        if self.energies.len() <= frame_index {
            self.energies.resize(frame_index + 1, 0.0);
        }
        self.energies[frame_index] = frame[0];
        Ok(())
    }

    fn final_result(&mut self, index: usize) -> anyhow::Result<Vec<Cell>> {
        Ok(self.cells_up_to(index))
    }

    fn intermediate_result(&mut self, index: usize) -> anyhow::Result<Vec<Cell>> {
        Ok(self.cells_up_to(index))
    }
}

pub struct SimFrontEnd {
    mfcc_size: usize,
    leftover: Vec<i16>,
    _options: FrontEndOptions,
}

impl SimFrontEnd {
    pub fn new(mfcc_size: usize, options: FrontEndOptions) -> Self {
        SimFrontEnd {
            mfcc_size,
            leftover: Vec::new(),
            _options: options,
        }
    }

    fn emit_frame(&self, samples: &[i16], out: &mut [f32]) {
        let energy = samples
            .iter()
            .map(|s| f32::from(*s).abs() / f32::from(i16::MAX))
            .sum::<f32>()
            / samples.len().max(1) as f32;
        out[..self.mfcc_size].fill(energy);
    }
}

impl FrontEnd for SimFrontEnd {
    fn reset(&mut self) {
        self.leftover.clear();
    }

    fn step(&mut self, samples: &[i16], out: &mut [f32]) -> anyhow::Result<usize> {
        if samples.is_empty() {
            // Flush: zero-pad the remainder into one last frame.
            if self.leftover.is_empty() {
                return Ok(0);
            }
            anyhow::ensure!(out.len() >= self.mfcc_size, "flush buffer too small");
            self.leftover.resize(SAMPLES_PER_FRAME, 0);
            let frame: Vec<i16> = std::mem::take(&mut self.leftover);
            self.emit_frame(&frame, out);
            return Ok(self.mfcc_size);
        }

        self.leftover.extend_from_slice(samples);
        let capacity = out.len() / self.mfcc_size;
        let complete = self.leftover.len() / SAMPLES_PER_FRAME;
        let frames = complete.min(capacity);
        for f in 0..frames {
            let start = f * SAMPLES_PER_FRAME;
            let frame = self.leftover[start..start + SAMPLES_PER_FRAME].to_vec();
            self.emit_frame(&frame, &mut out[f * self.mfcc_size..]);
        }
        self.leftover.drain(..frames * SAMPLES_PER_FRAME);
        Ok(frames * self.mfcc_size)
    }
}
