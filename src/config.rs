use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::index::QdrantConfig;
use crate::models::StreamKind;
use crate::sender::SenderConfig;
use crate::windowing::WindowConfig;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_PATH_VAR: &str = "GAITLINK_CONFIG";

const ENV_PREFIX: &str = "GAITLINK_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub buffer: BufferSettings,
    pub sender: SenderSettings,
    pub primary: PrimarySettings,
    pub fallbacks: FallbackSettings,
    pub index: IndexSettings,
    pub window: WindowConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub foot_path: PathBuf,
    pub accel_path: PathBuf,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            foot_path: PathBuf::from("./database/foot.db"),
            accel_path: PathBuf::from("./database/accel.db"),
        }
    }
}

impl BufferSettings {
    pub fn path(&self, stream: StreamKind) -> &Path {
        match stream {
            StreamKind::Foot => &self.foot_path,
            StreamKind::Inertial => &self.accel_path,
        }
    }
}

/// Sender tuning in whole seconds, as it appears in files and the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub max_records: usize,
    pub polling_interval_secs: u64,
    pub retry_backoff_base_secs: u64,
    pub max_backoff_secs: u64,
    pub retention_hours: u64,
    pub cleanup_interval_secs: u64,
    pub jitter_ratio: f64,
    pub request_timeout_secs: u64,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            max_records: 100,
            polling_interval_secs: 30,
            retry_backoff_base_secs: 60,
            max_backoff_secs: 3600,
            retention_hours: 24,
            cleanup_interval_secs: 3600,
            jitter_ratio: 0.0,
            request_timeout_secs: 10,
        }
    }
}

impl SenderSettings {
    pub fn to_sender_config(&self) -> SenderConfig {
        SenderConfig {
            max_records: self.max_records,
            polling_interval: Duration::from_secs(self.polling_interval_secs),
            backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            retention: Duration::from_secs(self.retention_hours.saturating_mul(3600)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The realtime channel. Disabled when `server_url` is unset or `enabled` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimarySettings {
    pub enabled: bool,
    pub server_url: Option<String>,
    pub device_key: String,
}

impl Default for PrimarySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: None,
            device_key: "sensor_hub_001".to_string(),
        }
    }
}

impl PrimarySettings {
    pub fn active_url(&self) -> Option<&str> {
        match &self.server_url {
            Some(url) if self.enabled && !url.trim().is_empty() => Some(url.as_str()),
            _ => None,
        }
    }
}

/// Webhook URLs tried in order after the primary channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    pub foot_urls: Vec<String>,
    pub accel_urls: Vec<String>,
}

impl FallbackSettings {
    pub fn urls(&self, stream: StreamKind) -> &[String] {
        match stream {
            StreamKind::Foot => &self.foot_urls,
            StreamKind::Inertial => &self.accel_urls,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Sqlite,
    Qdrant,
}

impl FromStr for IndexBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "qdrant" => Ok(Self::Qdrant),
            other => bail!("unknown index backend '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub backend: IndexBackend,
    pub sqlite_path: PathBuf,
    pub qdrant: QdrantConfig,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Sqlite,
            sqlite_path: PathBuf::from("./database/index.db"),
            qdrant: QdrantConfig::default(),
        }
    }
}

impl AppConfig {
    /// File named by `GAITLINK_CONFIG` (if any), then `GAITLINK_*` overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config in {}", path.display()))
    }

    /// Apply overrides from `lookup`, which maps a full variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
        };

        if let Some(path) = get("DB_FOOT_FILE") {
            self.buffer.foot_path = PathBuf::from(path);
        }
        if let Some(path) = get("DB_ACCEL_FILE") {
            self.buffer.accel_path = PathBuf::from(path);
        }

        let sender = &mut self.sender;
        override_parsed(&get, "SENDER_MAX_RECORDS", &mut sender.max_records)?;
        override_parsed(&get, "SENDER_POLLING_INTERVAL", &mut sender.polling_interval_secs)?;
        override_parsed(&get, "SENDER_RETRY_BACKOFF_BASE", &mut sender.retry_backoff_base_secs)?;
        override_parsed(&get, "SENDER_MAX_BACKOFF", &mut sender.max_backoff_secs)?;
        override_parsed(&get, "SENDER_RETENTION_HOURS", &mut sender.retention_hours)?;
        override_parsed(&get, "SENDER_JITTER_RATIO", &mut sender.jitter_ratio)?;

        if let Some(url) = get("SERVER_URL") {
            self.primary.server_url = Some(url);
        }
        if let Some(key) = get("DEVICE_KEY") {
            self.primary.device_key = key;
        }
        override_parsed(&get, "PRIMARY_ENABLED", &mut self.primary.enabled)?;

        if let Some(urls) = get("WEBHOOK_FOOT_URLS") {
            self.fallbacks.foot_urls = split_urls(&urls);
        }
        if let Some(urls) = get("WEBHOOK_ACCEL_URLS") {
            self.fallbacks.accel_urls = split_urls(&urls);
        }

        override_parsed(&get, "INDEX_BACKEND", &mut self.index.backend)?;
        if let Some(path) = get("INDEX_FILE") {
            self.index.sqlite_path = PathBuf::from(path);
        }
        if let Some(url) = get("QDRANT_URL") {
            self.index.qdrant.url = url;
        }
        if let Some(key) = get("QDRANT_API_KEY") {
            self.index.qdrant.api_key = Some(key);
        }
        if let Some(collection) = get("QDRANT_COLLECTION") {
            self.index.qdrant.collection = collection;
        }

        override_parsed(&get, "WINDOW_SIZE_MS", &mut self.window.window_size_ms)?;
        override_parsed(&get, "VECTOR_DIMENSION", &mut self.window.dimension)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sender
            .to_sender_config()
            .validate()
            .context("invalid sender settings")?;
        self.window.validate().context("invalid window settings")
    }
}

fn override_parsed<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{ENV_PREFIX}{name}={raw:?}: {err}"))?;
    }
    Ok(())
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
