// Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROD: &str = "prod";
#[allow(dead_code)]
pub const DEV: &str = "dev";
#[allow(dead_code)]
pub const TEST: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    Off,
    Always,
    Ratio,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Cfg {
    #[serde(rename = "roxxy")]
    pub roxxy: CfgBox,
}

impl Clone for Cfg {
    fn clone(&self) -> Self {
        Self {
            roxxy: CfgBox {
                env: self.roxxy.env.clone(),
                logs: self.roxxy.logs.clone(),
                runtime: self.roxxy.runtime.clone(),
                listen: self.roxxy.listen.clone(),
                redis: self.roxxy.redis.clone(),
                router: self.roxxy.router.clone(),
                cache_enabled: Arc::new(AtomicBool::new(
                    self.roxxy.cache_enabled.load(Ordering::Relaxed),
                )),
                request_id_header: self.roxxy.request_id_header.clone(),
                access_log: self.roxxy.access_log.clone(),
                traces: self.roxxy.traces.clone(),
                metrics: self.roxxy.metrics.clone(),
                k8s: self.roxxy.k8s.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CfgBox {
    pub env: String,
    pub logs: Option<Logs>,
    pub runtime: Option<Runtime>,
    pub listen: Vec<Listen>,
    pub redis: Redis,
    pub router: Router,
    #[serde(skip)]
    pub cache_enabled: Arc<AtomicBool>,
    #[serde(rename = "request_id_header")]
    pub request_id_header: Option<String>,
    pub access_log: Option<AccessLog>,
    pub traces: Option<Traces>,
    pub metrics: Option<Metrics>,
    pub k8s: Option<K8S>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Runtime {
    pub num_cpus: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logs {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Listen {
    pub addr: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Redis {
    pub read: RedisOptions,
    pub write: RedisOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisOptions {
    #[serde(default = "default_redis_network")]
    pub network: String,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    pub sentinel_addrs: Option<String>,
    pub sentinel_name: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

fn default_redis_network() -> String {
    "tcp".to_string()
}
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            network: default_redis_network(),
            host: default_redis_host(),
            port: default_redis_port(),
            sentinel_addrs: None,
            sentinel_name: None,
            password: None,
            db: 0,
        }
    }
}

/// Router-specific tunables: dead-backend TTL and the optional backend-set cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Router {
    #[serde(rename = "dead_backend_ttl", with = "humantime_serde", default = "default_dead_ttl")]
    pub dead_backend_ttl: Duration,
    #[serde(default)]
    pub cache_enabled: bool,
}

fn default_dead_ttl() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessLog {
    /// File path, "stdout", or "none".
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Traces {
    pub enabled: bool,
    #[serde(rename = "service_name")]
    pub service_name: Option<String>,
    #[serde(rename = "service_version")]
    pub service_version: Option<String>,
    pub exporter: Option<String>,
    pub endpoint: Option<String>,
    pub insecure: Option<bool>,
    #[serde(rename = "sampling_mode")]
    pub sampling_mode: Option<SamplingMode>,
    #[serde(rename = "sampling_rate")]
    pub sampling_rate: Option<f64>,
    #[serde(rename = "export_batch_size")]
    pub export_batch_size: Option<usize>,
    #[serde(rename = "export_batch_timeout", with = "humantime_serde")]
    pub export_batch_timeout: Option<Duration>,
    #[serde(rename = "export_max_queue")]
    pub export_max_queue: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metrics {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Probe {
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct K8S {
    pub probe: Probe,
}

pub trait ConfigTrait {
    fn is_prod(&self) -> bool;
    fn logs(&self) -> Option<&Logs>;
    fn runtime(&self) -> &Runtime;
    fn listen(&self) -> &[Listen];
    fn redis(&self) -> &Redis;
    fn router(&self) -> &Router;
    fn is_cache_enabled(&self) -> bool;
    fn set_cache_enabled(&self, v: bool);
    fn request_id_header(&self) -> Option<&str>;
    fn access_log(&self) -> Option<&AccessLog>;
    fn traces(&self) -> Option<&Traces>;
    fn metrics(&self) -> Option<&Metrics>;
    fn k8s(&self) -> Option<&K8S>;
}

pub type Config = Cfg;

impl ConfigTrait for Config {
    fn is_prod(&self) -> bool {
        self.roxxy.env == PROD
    }

    fn logs(&self) -> Option<&Logs> {
        self.roxxy.logs.as_ref()
    }

    fn runtime(&self) -> &Runtime {
        self.roxxy
            .runtime
            .as_ref()
            .unwrap_or(&Runtime { num_cpus: 0 })
    }

    fn listen(&self) -> &[Listen] {
        &self.roxxy.listen
    }

    fn redis(&self) -> &Redis {
        &self.roxxy.redis
    }

    fn router(&self) -> &Router {
        &self.roxxy.router
    }

    fn is_cache_enabled(&self) -> bool {
        self.roxxy.cache_enabled.load(Ordering::Relaxed)
    }

    fn set_cache_enabled(&self, v: bool) {
        self.roxxy.cache_enabled.store(v, Ordering::Relaxed);
    }

    fn request_id_header(&self) -> Option<&str> {
        self.roxxy.request_id_header.as_deref().filter(|s| !s.is_empty())
    }

    fn access_log(&self) -> Option<&AccessLog> {
        self.roxxy.access_log.as_ref()
    }

    fn traces(&self) -> Option<&Traces> {
        self.roxxy.traces.as_ref()
    }

    fn metrics(&self) -> Option<&Metrics> {
        self.roxxy.metrics.as_ref()
    }

    fn k8s(&self) -> Option<&K8S> {
        self.roxxy.k8s.as_ref()
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let abs_path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve absolute config filepath: {:?}", path))?;

        let data = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("read config yaml file {:?}", abs_path))?;

        let mut cfg: Cfg = serde_yaml::from_str(&data)
            .with_context(|| format!("unmarshal yaml from {:?}", abs_path))?;

        cfg.roxxy.cache_enabled = Arc::new(AtomicBool::new(cfg.roxxy.router.cache_enabled));

        if cfg.roxxy.listen.is_empty() {
            anyhow::bail!("at least one `listen` entry is required");
        }

        Ok(cfg)
    }
}

/// Builds a bare-minimum in-process configuration, used by tests and the harness.
#[allow(dead_code)]
pub fn new_test_config() -> Config {
    Cfg {
        roxxy: CfgBox {
            env: TEST.to_string(),
            logs: Some(Logs {
                level: Some("debug".to_string()),
            }),
            runtime: Some(Runtime { num_cpus: 2 }),
            listen: vec![Listen {
                addr: "127.0.0.1:0".to_string(),
                tls: false,
            }],
            redis: Redis {
                read: RedisOptions::default(),
                write: RedisOptions::default(),
            },
            router: Router {
                dead_backend_ttl: Duration::from_secs(30),
                cache_enabled: false,
            },
            cache_enabled: Arc::new(AtomicBool::new(false)),
            request_id_header: Some("X-Request-Id".to_string()),
            access_log: Some(AccessLog {
                path: Some("none".to_string()),
            }),
            traces: None,
            metrics: Some(Metrics { enabled: false }),
            k8s: Some(K8S {
                probe: Probe {
                    timeout: Some(Duration::from_secs(1)),
                },
            }),
        },
    }
}
