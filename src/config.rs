use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::queue::{QueuePolicy, DEFAULT_DECODE_WORKERS, DEFAULT_QUEUE_CAPACITY};

pub const CONFIG_ENV: &str = "MJPEG_RECEIVER_CONFIG";

const DEFAULT_URL: &str = "http://127.0.0.1:8080/stream.mjpg";
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 250;
const SUPPORTED_SCHEMES: [&str; 4] = ["http://", "https://", "file://", "stub://"];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReceiverConfigFile {
    url: Option<String>,
    queue: Option<QueueConfigFile>,
    stop_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct QueueConfigFile {
    policy: Option<String>,
    capacity: Option<usize>,
    decode_workers: Option<usize>,
}

/// Everything a `Receiver` needs before `start()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub url: String,
    pub policy: QueuePolicy,
    /// Upper bound on how long `stop()` waits for stage threads.
    pub stop_timeout: Duration,
    /// Upper bound on a single network read; sources re-check cancellation after it.
    pub read_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            policy: QueuePolicy::default(),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

impl ReceiverConfig {
    /// Defaults, then the file named by `MJPEG_RECEIVER_CONFIG`, then `MJPEG_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with a different stream URL.
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    fn from_file(file: ReceiverConfigFile) -> Result<Self> {
        let url = file.url.unwrap_or_else(|| DEFAULT_URL.to_string());
        let queue = file.queue.unwrap_or_default();
        let sized = queue.capacity.is_some() || queue.decode_workers.is_some();
        let policy = build_policy(
            queue.policy.as_deref().unwrap_or("bounded"),
            queue.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            queue.decode_workers.unwrap_or(DEFAULT_DECODE_WORKERS),
            sized.then_some("queue.capacity/queue.decode_workers"),
        )?;
        Ok(Self {
            url,
            policy,
            stop_timeout: Duration::from_millis(
                file.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            read_timeout: Duration::from_millis(
                file.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("MJPEG_URL") {
            if !url.trim().is_empty() {
                self.url = url.trim().to_string();
            }
        }

        let (mut capacity, mut workers) = match self.policy {
            QueuePolicy::Bounded {
                capacity,
                decode_workers,
            } => (capacity, decode_workers),
            QueuePolicy::LatestOnly => (DEFAULT_QUEUE_CAPACITY, DEFAULT_DECODE_WORKERS),
        };
        let mut policy_name = self.policy.label().to_string();
        if let Ok(name) = std::env::var("MJPEG_QUEUE_POLICY") {
            if !name.trim().is_empty() {
                policy_name = name.trim().to_lowercase();
            }
        }
        let mut sized = false;
        if let Some(value) = env_number::<usize>("MJPEG_QUEUE_CAPACITY")? {
            capacity = value;
            sized = true;
        }
        if let Some(value) = env_number::<usize>("MJPEG_DECODE_WORKERS")? {
            workers = value;
            sized = true;
        }
        self.policy = build_policy(
            &policy_name,
            capacity,
            workers,
            sized.then_some("MJPEG_QUEUE_CAPACITY/MJPEG_DECODE_WORKERS"),
        )?;

        if let Some(ms) = env_number::<u64>("MJPEG_STOP_TIMEOUT_MS")? {
            self.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("MJPEG_READ_TIMEOUT_MS")? {
            self.read_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_url(&self.url)?;
        if let QueuePolicy::Bounded {
            capacity,
            decode_workers,
        } = self.policy
        {
            if capacity == 0 {
                return Err(anyhow!("queue capacity must be at least 1"));
            }
            if decode_workers == 0 {
                return Err(anyhow!("decode workers must be at least 1"));
            }
        }
        if self.stop_timeout.is_zero() {
            return Err(anyhow!("stop timeout must be greater than zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(anyhow!("read timeout must be greater than zero"));
        }
        Ok(())
    }
}

pub(crate) fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("stream url must not be empty"));
    }
    if !SUPPORTED_SCHEMES
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme))
    {
        return Err(anyhow!(
            "unsupported stream url '{}'; expected http(s)://, file:// or stub://",
            url
        ));
    }
    Ok(())
}

/// `sized_by` names the settings that sized the queue explicitly, if any; they
/// only mean something for the bounded policy.
fn build_policy(
    name: &str,
    capacity: usize,
    decode_workers: usize,
    sized_by: Option<&str>,
) -> Result<QueuePolicy> {
    match name {
        "bounded" => Ok(QueuePolicy::Bounded {
            capacity,
            decode_workers,
        }),
        "latest_only" | "latest-only" => match sized_by {
            Some(settings) => Err(anyhow!(
                "{} only apply to the bounded queue policy, not latest_only",
                settings
            )),
            None => Ok(QueuePolicy::LatestOnly),
        },
        other => Err(anyhow!(
            "unknown queue policy '{}'; expected bounded or latest_only",
            other
        )),
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| anyhow!("{} must be a non-negative integer", key))
}

fn read_config_file(path: &Path) -> Result<ReceiverConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
