//! Daemon configuration.
//!
//! One TOML file shared by the dispatcher and the worker, sectioned the same
//! way the deployment's env file is: `[inotify]` for the input watcher,
//! `[api]` for the REST backend, `[stt]`/`[realtime]` for engine tuning,
//! `[protocol]` for remote-transfer credentials, `[master]` for broker and
//! scratch-space settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub const MAX_MINIBATCH: usize = 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inotify: InotifyConfig,
    pub api: ApiConfig,
    pub stt: SttConfig,
    pub realtime: RealtimeConfig,
    pub protocol: ProtocolConfig,
    pub ssp: SspConfig,
    pub master: MasterConfig,
    /// Per-queue worker-count overrides, e.g. `workers.vr_stt = 4`.
    pub workers: HashMap<String, usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InotifyConfig {
    pub input_path: Option<PathBuf>,
    /// Extension of files that trigger work, e.g. `wav`, `pcm` or a list ext.
    pub watch: String,
    pub index_type: IndexType,
    pub index_format: Option<String>,
    pub rec_ext: String,
    pub download_path: Option<String>,
    pub output_path: Option<PathBuf>,
    pub daily_output: bool,
    pub unique_output: bool,
    pub delete_on_success: bool,
    pub maximum_jobs: Option<usize>,
    pub fs_threshold_yn: bool,
    /// Aggregate in-flight byte ceiling, e.g. `"512MB"`.
    pub fs_threshold: Option<String>,
    pub preprocess: Option<String>,
    pub postprocess: Option<String>,
}

impl Default for InotifyConfig {
    fn default() -> Self {
        InotifyConfig {
            input_path: None,
            watch: "pcm".into(),
            index_type: IndexType::Filename,
            index_format: None,
            rec_ext: "wav".into(),
            download_path: None,
            output_path: None,
            daily_output: false,
            unique_output: false,
            delete_on_success: false,
            maximum_jobs: None,
            fs_threshold_yn: false,
            fs_threshold: None,
            preprocess: None,
            postprocess: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Filename,
    File,
    Pair,
    List,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub service: String,
    pub version: String,
    pub apikey: Option<String>,
    pub passwd: String,
    pub port: u16,
    pub limits: usize,
    /// Connection timeout, milliseconds.
    pub timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            url: "http://localhost:3000".into(),
            service: "vr".into(),
            version: "v1.0".into(),
            apikey: None,
            passwd: "vr_server".into(),
            port: 3001,
            limits: 10,
            timeout: 10_000,
        }
    }
}

impl ApiConfig {
    /// `{url}/{service}/{version}/jobs` with slash normalization.
    pub fn jobs_url(&self) -> String {
        let mut url = self.url.trim_end_matches('/').to_string();
        url.push('/');
        url.push_str(&self.service);
        url.push('/');
        url.push_str(&self.version);
        url.push_str("/jobs");
        url
    }

    pub fn login_url(&self) -> String {
        format!("{}/login", self.url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub server_name: String,
    pub worker: Option<usize>,
    pub engine: EngineKind,
    pub engine_core: usize,
    pub mfcc_size: usize,
    pub mini_batch: usize,
    pub prior_weight: f64,
    #[serde(rename = "useGPU")]
    pub use_gpu: bool,
    #[serde(rename = "idGPU")]
    pub id_gpu: usize,
    pub gpu_num: usize,
    pub reset_period: usize,
    pub minimum_confidence: f64,
    /// External audio decoder command producing a `.pcm` sidecar.
    pub decoder: Option<String>,
    /// External channel separator producing `*_left.pcm` / `*_right.pcm`.
    pub separator: Option<String>,
    pub unsegment_pause: Option<i64>,
    pub unsegment_command: Option<String>,
    pub sil_dnn: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
    /// Tag replies for the speaker-separation consumer.
    pub spk_enable: bool,
    pub spk_worker_name: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        SttConfig {
            server_name: "DEFAULT".into(),
            worker: None,
            engine: EngineKind::Sim,
            engine_core: 2,
            mfcc_size: 600,
            mini_batch: 128,
            prior_weight: 0.8,
            use_gpu: true,
            id_gpu: 0,
            gpu_num: 1,
            reset_period: 500_000,
            minimum_confidence: 0.0,
            decoder: None,
            separator: None,
            unsegment_pause: None,
            unsegment_command: None,
            sil_dnn: None,
            image_path: None,
            spk_enable: false,
            spk_worker_name: None,
        }
    }
}

impl SttConfig {
    /// Minibatch size with the engine's hard cap applied.
    pub fn mini_batch(&self) -> usize {
        self.mini_batch.min(MAX_MINIBATCH)
    }
}

/// Which engine implementation the worker links at runtime. The licensed
/// decoder is provided out-of-tree; `sim` is the in-repo stand-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Sim,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub worker: usize,
    pub reset_period: usize,
    pub startnum: usize,
    pub mode: RealtimeMode,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            worker: 1,
            reset_period: 500_000,
            startnum: 0,
            mode: RealtimeMode::PerCall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RealtimeMode {
    #[serde(rename = "per-call")]
    PerCall,
    #[serde(rename = "pool")]
    Pool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    #[serde(rename = "use")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: Option<ProtocolType>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub encrypt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Sftp,
    Ftps,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SspConfig {
    /// External classifier utility; when set, scores are forwarded to it.
    pub util: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    /// Broker administrative port for worker-count queries.
    pub admin_port: Option<u16>,
    /// Handler invocation timeout, milliseconds. Zero waits forever.
    pub timeout: u64,
    pub threads: usize,
    pub tmp_path: PathBuf,
    pub use_ftp_ssl: bool,
    pub ssl_insecure: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            host: "localhost".into(),
            port: 4730,
            admin_port: None,
            timeout: 0,
            threads: 1,
            tmp_path: PathBuf::from("/dev/shm/smart-vr"),
            use_ftp_ssl: false,
            ssl_insecure: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Worker count for a named queue: `[workers]` override, else the queue
    /// family's `worker` key, else the global thread count.
    pub fn queue_workers(&self, queue: &str) -> usize {
        if let Some(n) = self.workers.get(queue) {
            return (*n).max(1);
        }
        let family = match queue {
            "vr_stt" => self.stt.worker,
            "vr_realtime" => Some(self.realtime.worker),
            _ => None,
        };
        family.unwrap_or(self.master.threads).max(1)
    }

    /// In-flight byte ceiling, when threshold admission is enabled.
    pub fn byte_ceiling(&self) -> Result<Option<u64>, ConfigError> {
        if !self.inotify.fs_threshold_yn {
            return Ok(None);
        }
        let raw = self
            .inotify
            .fs_threshold
            .as_deref()
            .ok_or(ConfigError::Missing("inotify.fs_threshold"))?;
        parse_byte_size(raw)
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid {
                key: "inotify.fs_threshold",
                value: raw.to_string(),
            })
    }
}

/// Parse a size with a binary-unit suffix: `512MB`, `2GB`, `64KB`, `1024`.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let value: u64 = raw[..split].parse().ok()?;
    let mult = match raw[split..].trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(value * mult)
}
