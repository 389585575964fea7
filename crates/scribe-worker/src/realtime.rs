//! Per-call streaming STT channels.
//!
//! A channel owns an engine child, a front-end and the streaming position
//! state for one live call. Channels come into being on the call's first
//! packet and die on its last; in pool mode a fixed set is pre-created and
//! calls claim an idle channel for their whole duration instead. The two
//! allocation strategies share the channel type and the feeding logic.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use scribe_core::cells::{Cell, format_cells};
use scribe_core::config::{Config, RealtimeMode};

use crate::engine::sim::SAMPLES_PER_FRAME;
use crate::engine::{EngineStack, FrontEnd, PooledInstance};
use crate::stt::{feed_frames, finalize_segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    First,
    Mid,
    Last,
}

impl PacketState {
    /// Wire command field: `FIRS` opens, `LAST` closes, anything else is a
    /// mid-call payload.
    pub fn from_command(cmd: &str) -> PacketState {
        if cmd.starts_with("FIRS") {
            PacketState::First
        } else if cmd.starts_with("LAST") {
            PacketState::Last
        } else {
            PacketState::Mid
        }
    }
}

struct ChannelState {
    engine: PooledInstance,
    frontend: Box<dyn FrontEnd>,
    features: Vec<f32>,
    pending: Vec<i16>,
    index: usize,
    last_position: u64,
}

pub struct Channel {
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(stack: &EngineStack) -> anyhow::Result<Arc<Channel>> {
        let mut engine = stack.create_child()?;
        engine.reset()?;
        let mut frontend = stack.new_frontend();
        frontend.reset();
        Ok(Arc::new(Channel {
            state: Mutex::new(ChannelState {
                engine,
                frontend,
                features: vec![0.0; stack.feature_dim()],
                pending: Vec::new(),
                index: 0,
                last_position: 0,
            }),
        }))
    }
}

impl ChannelState {
    /// Push samples and decode every complete minibatch read.
    fn feed(
        &mut self,
        stack: &EngineStack,
        reset_period: usize,
        samples: &[i16],
        out: &mut Vec<Cell>,
    ) -> anyhow::Result<()> {
        self.pending.extend_from_slice(samples);
        let read_size = SAMPLES_PER_FRAME * stack.mini_batch;

        while self.pending.len() >= read_size {
            let chunk: Vec<i16> = self.pending.drain(..read_size).collect();
            self.decode(stack, reset_period, &chunk, out)?;
        }
        Ok(())
    }

    fn decode(
        &mut self,
        stack: &EngineStack,
        reset_period: usize,
        chunk: &[i16],
        out: &mut Vec<Cell>,
    ) -> anyhow::Result<()> {
        let written = self.frontend.step(chunk, &mut self.features)?;
        if written == 0 {
            return Ok(());
        }
        feed_frames(&mut *self.engine, stack, self.index, &self.features[..written])?;
        self.index += written / stack.mfcc_size;

        if self.index > reset_period {
            self.emit_segment(stack, out)?;
        }
        Ok(())
    }

    fn emit_segment(&mut self, stack: &EngineStack, out: &mut Vec<Cell>) -> anyhow::Result<()> {
        finalize_segment(
            &mut *self.engine,
            stack,
            &mut self.index,
            &mut self.last_position,
            out,
        )
    }

    /// Drain buffered samples and close the final segment.
    fn finish(&mut self, stack: &EngineStack, out: &mut Vec<Cell>) -> anyhow::Result<()> {
        let remainder: Vec<i16> = std::mem::take(&mut self.pending);
        if !remainder.is_empty() {
            self.decode(stack, usize::MAX, &remainder, out)?;
        }

        let written = self.frontend.step(&[], &mut self.features)?;
        if written > 0 {
            feed_frames(&mut *self.engine, stack, self.index, &self.features[..written])?;
            self.index += written / stack.mfcc_size;
        }

        if self.index > 0 {
            self.emit_segment(stack, out)?;
        }
        Ok(())
    }

    /// Make the channel reusable for a fresh call (pool mode).
    fn recycle(&mut self) -> anyhow::Result<()> {
        self.engine.reset()?;
        self.frontend.reset();
        self.pending.clear();
        self.index = 0;
        self.last_position = 0;
        Ok(())
    }
}

struct Registry {
    active: HashMap<String, Arc<Channel>>,
    idle_pool: Vec<Arc<Channel>>,
}

pub struct RealtimeChannels {
    stack: Arc<EngineStack>,
    mode: RealtimeMode,
    reset_period: usize,
    registry: Mutex<Registry>,
    released: Notify,
}

impl RealtimeChannels {
    pub fn new(stack: Arc<EngineStack>, cfg: &Config) -> anyhow::Result<Arc<Self>> {
        let mode = cfg.realtime.mode;
        let mut idle_pool = Vec::new();
        if mode == RealtimeMode::Pool {
            for _ in 0..cfg.realtime.worker.max(1) {
                idle_pool.push(Channel::new(&stack)?);
            }
        }
        Ok(Arc::new(RealtimeChannels {
            stack,
            mode,
            reset_period: cfg.realtime.reset_period,
            registry: Mutex::new(Registry {
                active: HashMap::new(),
                idle_pool,
            }),
            released: Notify::new(),
        }))
    }

    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.active.len()
    }

    /// Feed one packet of a call. Returns the cell-stream recognized so far
    /// by this packet (complete segments, plus the tail on LAST).
    pub async fn stt(
        &self,
        call_id: &str,
        samples: &[i16],
        state: PacketState,
    ) -> anyhow::Result<String> {
        let channel = self.attach(call_id, state).await?;

        let mut cells = Vec::new();
        // One in-flight stt per channel; later packets of the same call
        // queue on the state lock.
        let mut st = channel.state.lock().await;
        let mut result = st.feed(&self.stack, self.reset_period, samples, &mut cells);
        if result.is_ok() && state == PacketState::Last {
            result = st.finish(&self.stack, &mut cells);
        }

        let closing = state == PacketState::Last || result.is_err();
        if closing && self.mode == RealtimeMode::Pool {
            if let Err(err) = st.recycle() {
                tracing::warn!(%err, call_id, "cannot recycle pooled channel");
            }
        }
        drop(st);

        if closing {
            self.detach(call_id).await;
        }
        result?;
        Ok(format_cells(&cells))
    }

    async fn attach(&self, call_id: &str, state: PacketState) -> anyhow::Result<Arc<Channel>> {
        loop {
            {
                let mut registry = self.registry.lock().await;
                if let Some(channel) = registry.active.get(call_id) {
                    return Ok(channel.clone());
                }
                // A mid-call packet for an unknown id has lost its channel.
                if state == PacketState::Mid {
                    anyhow::bail!("cannot connect channel for call {call_id}");
                }
                match self.mode {
                    RealtimeMode::PerCall => {
                        let channel = Channel::new(&self.stack)?;
                        registry.active.insert(call_id.to_string(), channel.clone());
                        return Ok(channel);
                    }
                    RealtimeMode::Pool => {
                        if let Some(channel) = registry.idle_pool.pop() {
                            registry.active.insert(call_id.to_string(), channel.clone());
                            return Ok(channel);
                        }
                    }
                }
            }
            // Pool exhausted; wait for a call to end.
            self.released.notified().await;
        }
    }

    async fn detach(&self, call_id: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(channel) = registry.active.remove(call_id) {
            if self.mode == RealtimeMode::Pool {
                registry.idle_pool.push(channel);
                self.released.notify_one();
            }
        }
    }

    /// Force-close everything, releasing the engines. Used at shutdown.
    pub async fn close_all(&self) {
        let mut registry = self.registry.lock().await;
        registry.active.clear();
        registry.idle_pool.clear();
    }
}
