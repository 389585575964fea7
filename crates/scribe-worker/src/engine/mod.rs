//! The decoding-engine seam.
//!
//! The acoustic engine is an external collaborator; this module fixes its
//! contract. A master owns model state for one device and mints child
//! instances; children are handed out through [`DevicePool`], which picks the
//! least-loaded device and returns the child as a guard that gives its slot
//! back on drop. Children address their master through the pool index only.

pub mod sim;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use scribe_core::cells::Cell;
use scribe_core::config::{Config, EngineKind};

/// Front-end construction options, as the engine library names them.
#[derive(Debug, Clone, Copy)]
pub struct FrontEndOptions {
    /// FRONTEND_OPTION_DOEPD
    pub endpoint_detection: bool,
    /// CMS_LEN_BLOCK
    pub cms_len_block: usize,
    /// FRONTEND_OPTION_8KHZFRONTEND
    pub khz8: bool,
    /// FRONTEND_OPTION_DNNFBFRONTEND
    pub dnn_filterbank: bool,
}

impl Default for FrontEndOptions {
    fn default() -> Self {
        FrontEndOptions {
            endpoint_detection: false,
            cms_len_block: 0,
            khz8: true,
            dnn_filterbank: true,
        }
    }
}

/// Signal-processing stage turning PCM samples into feature frames.
pub trait FrontEnd: Send {
    fn reset(&mut self);
    /// Feed samples, write complete feature frames into `out`. Returns the
    /// number of floats written (a multiple of the feature size). An empty
    /// sample slice flushes the internal remainder.
    fn step(&mut self, samples: &[i16], out: &mut [f32]) -> anyhow::Result<usize>;
}

/// One decoder state. Owned by exactly one task or channel at a time.
pub trait EngineInstance: Send {
    fn reset(&mut self) -> anyhow::Result<()>;
    fn step(&mut self, frame_index: usize, feature_dim: usize, frame: &[f32])
    -> anyhow::Result<()>;
    /// Finalized recognition up to `index`, frame positions relative to the
    /// last reset.
    fn final_result(&mut self, index: usize) -> anyhow::Result<Vec<Cell>>;
    fn intermediate_result(&mut self, index: usize) -> anyhow::Result<Vec<Cell>>;
}

pub trait EngineMaster: Send + Sync {
    fn create_child(&self) -> anyhow::Result<Box<dyn EngineInstance>>;
}

struct Device {
    master: Box<dyn EngineMaster>,
    load: AtomicUsize,
}

/// N masters, one per device. Children come from whichever device currently
/// runs the fewest.
pub struct DevicePool {
    devices: Vec<Device>,
}

impl DevicePool {
    pub fn new(masters: Vec<Box<dyn EngineMaster>>) -> Arc<Self> {
        assert!(!masters.is_empty(), "engine pool needs at least one device");
        Arc::new(DevicePool {
            devices: masters
                .into_iter()
                .map(|master| Device {
                    master,
                    load: AtomicUsize::new(0),
                })
                .collect(),
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_load(&self, device: usize) -> usize {
        self.devices[device].load.load(Ordering::Relaxed)
    }

    pub fn create_child(self: &Arc<Self>) -> anyhow::Result<PooledInstance> {
        let device = self
            .devices
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.load.load(Ordering::Relaxed))
            .map(|(idx, _)| idx)
            .expect("pool is never empty");

        self.devices[device].load.fetch_add(1, Ordering::Relaxed);
        match self.devices[device].master.create_child() {
            Ok(instance) => Ok(PooledInstance {
                instance,
                pool: self.clone(),
                device,
            }),
            Err(err) => {
                self.devices[device].load.fetch_sub(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

/// A child instance plus its device slot.
pub struct PooledInstance {
    instance: Box<dyn EngineInstance>,
    pool: Arc<DevicePool>,
    device: usize,
}

impl PooledInstance {
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Deref for PooledInstance {
    type Target = dyn EngineInstance;
    fn deref(&self) -> &Self::Target {
        self.instance.as_ref()
    }
}

impl DerefMut for PooledInstance {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.instance.as_mut()
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        self.pool.devices[self.device].load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a handler needs to decode: the device pool, a front-end
/// factory, the silence padding vector and the tuning dimensions.
pub struct EngineStack {
    pool: Arc<DevicePool>,
    frontend: Box<dyn Fn() -> Box<dyn FrontEnd> + Send + Sync>,
    pub mfcc_size: usize,
    pub mini_batch: usize,
    pub reset_period: usize,
    /// One frame of silence features, replicated to pad short minibatches.
    pub silence: Arc<Vec<f32>>,
}

impl EngineStack {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Arc<Self>> {
        let mfcc_size = cfg.stt.mfcc_size;
        let mini_batch = cfg.stt.mini_batch();
        let devices = cfg.stt.gpu_num.max(1);

        let silence = Arc::new(load_silence_frame(cfg, mfcc_size)?);

        match cfg.stt.engine {
            EngineKind::Sim => {
                tracing::info!(
                    devices,
                    mfcc_size,
                    mini_batch,
                    "load simulation engine ({} cores)",
                    cfg.stt.engine_core
                );
                let masters = (0..devices)
                    .map(|_| Box::new(sim::SimEngineMaster::new()) as Box<dyn EngineMaster>)
                    .collect();
                let options = FrontEndOptions::default();
                Ok(Arc::new(EngineStack {
                    pool: DevicePool::new(masters),
                    frontend: Box::new(move || {
                        Box::new(sim::SimFrontEnd::new(mfcc_size, options))
                    }),
                    mfcc_size,
                    mini_batch,
                    reset_period: cfg.stt.reset_period,
                    silence,
                }))
            }
        }
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    pub fn create_child(&self) -> anyhow::Result<PooledInstance> {
        self.pool.create_child()
    }

    pub fn new_frontend(&self) -> Box<dyn FrontEnd> {
        (self.frontend)()
    }

    pub fn feature_dim(&self) -> usize {
        self.mfcc_size * self.mini_batch
    }
}

/// Read the first `mfcc_size` floats of the silence model, falling back to a
/// flat near-zero frame when none is deployed.
fn load_silence_frame(cfg: &Config, mfcc_size: usize) -> anyhow::Result<Vec<f32>> {
    let Some(path) = &cfg.stt.sil_dnn else {
        return Ok(vec![0.0; mfcc_size]);
    };
    let raw = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("cannot open {}: {e}", path.display()))?;
    let mut frame = Vec::with_capacity(mfcc_size);
    for chunk in raw.chunks_exact(4).take(mfcc_size) {
        frame.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    if frame.len() < mfcc_size {
        anyhow::bail!("cannot read {}: short silence model", path.display());
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_prefers_least_loaded_device() {
        let masters: Vec<Box<dyn EngineMaster>> = (0..2)
            .map(|_| Box::new(sim::SimEngineMaster::new()) as Box<dyn EngineMaster>)
            .collect();
        let pool = DevicePool::new(masters);

        let a = pool.create_child().unwrap();
        let b = pool.create_child().unwrap();
        assert_ne!(a.device(), b.device());

        // Freeing one device makes it the next target.
        let freed = a.device();
        drop(a);
        let c = pool.create_child().unwrap();
        assert_eq!(c.device(), freed);
        assert_eq!(pool.device_load(freed), 1);
        drop(b);
        drop(c);
        assert_eq!(pool.device_load(0) + pool.device_load(1), 0);
    }

    #[test]
    fn stack_from_default_config() {
        let stack = EngineStack::from_config(&Config::default()).unwrap();
        assert_eq!(stack.mfcc_size, 600);
        assert_eq!(stack.mini_batch, 128);
        assert_eq!(stack.silence.len(), 600);
        assert_eq!(stack.feature_dim(), 600 * 128);
        let _child = stack.create_child().unwrap();
    }
}
