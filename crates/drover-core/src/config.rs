//! Global configuration loaded from `~/.config/drover/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// `[download]` section: scheduling and transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum number of worker slots (parallel downloads).
    pub max_downloads: usize,
    /// Maximum connections (chunks) per file.
    pub chunks: usize,
    /// Downloads only start inside this daily window. Equal bounds = always.
    pub start_time: String,
    pub end_time: String,
    /// When true, `max_speed` caps the aggregate rate.
    pub limit_speed: bool,
    /// Aggregate rate cap in KiB/s; -1 = unlimited.
    pub max_speed: i64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_downloads: 3,
            chunks: 4,
            start_time: "0:00".to_string(),
            end_time: "0:00".to_string(),
            limit_speed: false,
            max_speed: -1,
        }
    }
}

/// `[general]` section: storage layout and floors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory finished downloads land in.
    pub storage_folder: PathBuf,
    /// Pause the scheduler when free space drops below this many MiB.
    pub min_free_space: u64,
    /// Place each package's files in a folder named after the package.
    pub folder_per_package: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let storage_folder = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Downloads"))
            .unwrap_or_else(|| PathBuf::from("downloads"));
        Self {
            storage_folder,
            min_free_space: 512,
            folder_per_package: true,
        }
    }
}

/// `[reconnect]` section: external IP-change script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Shell script run to force an IP change. Must exist when enabled.
    pub script: PathBuf,
    /// Reconnects only happen inside this daily window. Equal bounds = always.
    pub start_time: String,
    pub end_time: String,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            script: PathBuf::new(),
            start_time: "0:00".to_string(),
            end_time: "0:00".to_string(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Log file directory; empty = XDG state dir.
    pub filelog_folder: PathBuf,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub download: DownloadConfig,
    pub general: GeneralConfig,
    pub reconnect: ReconnectConfig,
    pub log: LogConfig,
}

impl CoreConfig {
    /// Effective bandwidth cap in bytes/s; `None` when unlimited.
    pub fn speed_limit_bytes(&self) -> Option<u64> {
        if self.download.limit_speed && self.download.max_speed > 0 {
            Some(self.download.max_speed as u64 * 1024)
        } else {
            None
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("drover")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<CoreConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = CoreConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: CoreConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.download.max_downloads, 3);
        assert_eq!(cfg.download.chunks, 4);
        assert!(!cfg.download.limit_speed);
        assert_eq!(cfg.general.min_free_space, 512);
        assert!(!cfg.reconnect.enabled);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = CoreConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: CoreConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.download.max_downloads, cfg.download.max_downloads);
        assert_eq!(parsed.general.min_free_space, cfg.general.min_free_space);
        assert_eq!(parsed.reconnect.enabled, cfg.reconnect.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [download]
            max_downloads = 8
        "#;
        let cfg: CoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.download.max_downloads, 8);
        assert_eq!(cfg.download.chunks, 4);
        assert_eq!(cfg.general.min_free_space, 512);
    }

    #[test]
    fn speed_limit_requires_both_flag_and_rate() {
        let mut cfg = CoreConfig::default();
        assert_eq!(cfg.speed_limit_bytes(), None);
        cfg.download.limit_speed = true;
        assert_eq!(cfg.speed_limit_bytes(), None);
        cfg.download.max_speed = 100;
        assert_eq!(cfg.speed_limit_bytes(), Some(102_400));
    }
}
