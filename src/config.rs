//! Face embedding service configuration

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// "auto" picks an accelerator when one is present; "cpu" forces CPU.
    pub device: String,
    pub embedding_dim: usize,
    /// Images larger than this on either side are downscaled before
    /// detection.
    pub max_image_dim: u32,
    pub low_memory: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub workers: usize,
    /// Hard capacity of the job buffer.
    pub capacity: usize,
    /// Overload threshold; must stay strictly below `capacity` so callers
    /// get an explicit rejection before the buffer fills.
    pub soft_limit: usize,
    pub enqueue_timeout_ms: u64,
    pub result_timeout_ms: u64,
    /// How long a worker blocks on the queue before re-checking for
    /// shutdown.
    pub poll_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub max_concurrent: usize,
    /// Emit a progress event every this many completions.
    pub progress_every: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// URLs containing this domain are fetched directly.
    pub remote_domain: String,
    /// Base URL of the local image-lookup service for 24-hex tokens.
    pub lookup_base_url: String,
    pub timeout_secs: u64,
}

impl QueueConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl InferenceConfig {
    pub fn force_cpu(&self) -> bool {
        self.device.eq_ignore_ascii_case("cpu")
    }

    /// The low-memory toggle caps the downscale limit so worker-resident
    /// image buffers stay small.
    pub fn effective_max_image_dim(&self) -> u32 {
        if self.low_memory {
            self.max_image_dim.min(1024)
        } else {
            self.max_image_dim
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    /// Apply `VISAGE_*` environment overrides on top of the file/default
    /// configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = env_parse::<u16>("VISAGE_PORT") {
            self.server.port = port;
        }
        if let Ok(device) = std::env::var("VISAGE_DEVICE") {
            if !device.is_empty() {
                self.inference.device = device;
            }
        }
        if let Ok(workers) = env_parse::<usize>("VISAGE_WORKERS") {
            if workers > 0 {
                self.queue.workers = workers;
            }
        }
        if let Ok(n) = env_parse::<usize>("VISAGE_BATCH_CONCURRENCY") {
            if n > 0 {
                self.batch.max_concurrent = n;
            }
        }
        if let Ok(dim) = env_parse::<u32>("VISAGE_MAX_IMAGE_DIM") {
            if dim > 0 {
                self.inference.max_image_dim = dim;
            }
        }
        if let Ok(v) = std::env::var("VISAGE_LOW_MEMORY") {
            self.inference.low_memory = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(url) = std::env::var("VISAGE_LOOKUP_BASE_URL") {
            if !url.is_empty() {
                self.fetch.lookup_base_url = url;
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<T, ()> {
    std::env::var(key).map_err(|_| ())?.parse().map_err(|_| ())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { port: 5001 },
            inference: InferenceConfig {
                device: "auto".to_string(),
                embedding_dim: 512,
                max_image_dim: 1920,
                low_memory: false,
            },
            queue: QueueConfig {
                workers: 24,
                capacity: 128,
                soft_limit: 100,
                enqueue_timeout_ms: 5_000,
                result_timeout_ms: 120_000,
                poll_timeout_ms: 30_000,
            },
            batch: BatchConfig {
                max_concurrent: 8,
                progress_every: 10,
            },
            fetch: FetchConfig {
                remote_domain: "cloudinary.com".to_string(),
                lookup_base_url: "http://localhost:5000/api/images".to_string(),
                timeout_secs: 30,
            },
        }
    }
}
