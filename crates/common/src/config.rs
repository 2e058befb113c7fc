use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::types::SCHEMA_VERSION;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub series: SeriesConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub observability: Observability,
    #[serde(default)]
    pub server: Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    pub path: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            path: "data/portfolio.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Remote {
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesConfig {
    pub capacity: usize,
    pub schema_version: u32,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            capacity: crate::series::DEFAULT_CAPACITY,
            schema_version: SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    pub stake_decimals: u32,
    pub withdrawal_epsilon: f64,
    pub networth_min_interval_ms: i64,
    pub networth_min_usd_delta: f64,
    pub price_move_pct: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stake_decimals: 6,
            withdrawal_epsilon: 0.0002,
            networth_min_interval_ms: 5_000,
            networth_min_usd_delta: 0.25,
            price_move_pct: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    pub capacity: usize,
    pub resolve_delay_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: 1_200,
            resolve_delay_ms: 2_500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub pull_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_200,
            pull_interval_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    pub tick_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { tick_ms: 8_000 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Observability {
    pub prometheus_port: Option<u16>,
    /// Falls back to `OTEL_EXPORTER_OTLP_ENDPOINT` when unset.
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// SQLite file holding the merged payload of every identity.
    #[serde(default = "default_server_path")]
    pub path: String,
}

fn default_server_path() -> String {
    "data/pointstore.db".to_string()
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            path: default_server_path(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.series.capacity > 0, "series.capacity must be > 0");
        anyhow::ensure!(self.journal.capacity > 0, "journal.capacity must be > 0");
        anyhow::ensure!(
            self.detector.stake_decimals <= 12,
            "detector.stake_decimals must be <= 12"
        );
        anyhow::ensure!(
            self.detector.withdrawal_epsilon.is_finite() && self.detector.withdrawal_epsilon >= 0.0,
            "detector.withdrawal_epsilon must be finite and >= 0"
        );
        anyhow::ensure!(
            self.detector.networth_min_usd_delta.is_finite()
                && self.detector.networth_min_usd_delta >= 0.0,
            "detector.networth_min_usd_delta must be finite and >= 0"
        );
        anyhow::ensure!(
            self.detector.networth_min_interval_ms >= 0,
            "detector.networth_min_interval_ms must be >= 0"
        );
        anyhow::ensure!(
            self.detector.price_move_pct.is_finite() && self.detector.price_move_pct > 0.0,
            "detector.price_move_pct must be > 0"
        );
        anyhow::ensure!(self.sync.debounce_ms > 0, "sync.debounce_ms must be > 0");
        anyhow::ensure!(
            self.sync.pull_interval_secs > 0,
            "sync.pull_interval_secs must be > 0"
        );
        anyhow::ensure!(self.render.tick_ms > 0, "render.tick_ms must be > 0");
        Ok(())
    }

    /// Explicit OTLP endpoint, else the standard environment variable.
    pub fn otlp_endpoint(&self) -> Option<String> {
        self.observability
            .otlp_endpoint
            .clone()
            .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
    }

    pub fn default_config_path() -> String {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(std::path::Path::to_path_buf));

        if let Some(dir) = &exe_dir {
            let candidate = dir.join("portfolio.toml");
            if candidate.exists() {
                return candidate.to_string_lossy().to_string();
            }
        }

        let candidate = Path::new("config/default.toml");
        if candidate.exists() {
            return candidate.to_string_lossy().to_string();
        }

        "config/default.toml".to_string()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
