// =============================================================================
// Runtime Configuration — feed, channel, worker and render settings
// =============================================================================
//
// Loaded from a JSON file at startup. Every field carries a serde default so
// an older or partial file still loads. `save` writes atomically through a
// tmp file + rename.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decimation::Algorithm;
use crate::pipeline::PipelineConfig;
use crate::render::RenderConfig;
use crate::transport::{Compression, ReconnectPolicy, TransportConfig};
use crate::types::PointLayout;
use crate::worker::{default_pool_size, PoolConfig};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_feed_url() -> String {
    "ws://127.0.0.1:9001/feed".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSD".to_string(), "ETHUSD".to_string()]
}

fn default_fields() -> Vec<String> {
    vec!["ohlc".to_string(), "volume".to_string()]
}

fn default_max_data_points() -> usize {
    100_000
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_target_points() -> usize {
    2_000
}

fn default_visible_points() -> usize {
    20_000
}

fn default_tick_interval_ms() -> u64 {
    16
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_feed_url")]
    pub url: String,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Field groups requested in the Subscribe message.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,

    #[serde(default)]
    pub compression: Compression,

    /// Subtracted from wire timestamps before they are stored as f32.
    /// Unset means the first update's timestamp.
    #[serde(default)]
    pub time_origin: Option<f64>,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            symbols: default_symbols(),
            fields: default_fields(),
            compression: Compression::None,
            time_origin: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Ring capacity per series, in points.
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,

    /// Stored layout. The feed pipeline only accepts candles.
    #[serde(default)]
    pub layout: PointLayout,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            max_data_points: default_max_data_points(),
            layout: PointLayout::Candle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Pool size; `None` means available hardware concurrency.
    #[serde(default)]
    pub worker_count: Option<usize>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_target_points")]
    pub target_points: usize,

    #[serde(default = "default_visible_points")]
    pub visible_points: usize,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            target_points: default_target_points(),
            visible_points: default_visible_points(),
            tick_interval_ms: default_tick_interval_ms(),
            algorithm: Algorithm::default(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the tickflow daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub feed: FeedSettings,

    #[serde(default)]
    pub channel: ChannelSettings,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub render: RenderSettings,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            url = %config.feed.url,
            symbols = ?config.feed.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Load `path`, or write the defaults there first when it does not
    /// exist yet so the daemon leaves an editable file behind.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config
            .save(path)
            .with_context(|| format!("failed to initialise runtime config at {}", path.display()))?;
        info!(path = %path.display(), "no runtime config found, wrote defaults");
        Ok(config)
    }

    /// Apply a comma-separated symbol list, upper-cased, blanks dropped.
    pub fn set_symbols_from_list(&mut self, list: &str) {
        self.feed.symbols = list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // --- Component configs ---------------------------------------------------

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.feed.url.clone(),
            reconnect: self.feed.reconnect.clone(),
            compression: self.feed.compression,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            symbols: self.feed.symbols.clone(),
            fields: self.feed.fields.clone(),
            max_data_points: self.channel.max_data_points,
            time_origin: self.feed.time_origin,
            layout: self.channel.layout,
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            size: self.workers.worker_count.unwrap_or_else(default_pool_size),
            poll_interval: Duration::from_millis(self.workers.poll_interval_ms),
        }
    }

    pub fn render(&self) -> RenderConfig {
        RenderConfig {
            target_points: self.render.target_points,
            visible_points: self.render.visible_points,
            algorithm: self.render.algorithm,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.render.tick_interval_ms.max(1))
    }
}
