use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub screenshot: ScreenshotConfig,
    pub monitoring: MonitoringConfig,
    pub processing: ProcessingConfig,
    pub image_optimization: ImageOptimizationConfig,
    pub language: LanguageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path. Empty means `<config dir>/lifetrace.db`.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    /// Image store base directory. Empty means `<config dir>/screenshots`.
    pub save_path: String,
    /// Per-monitor capture toggles. Empty means "primary only".
    pub screen_settings: Vec<ScreenSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSetting {
    pub monitor_index: usize,
    pub is_enabled: bool,
    pub monitor_name: String,
    pub resolution: String,
    pub is_primary: bool,
}

impl Default for ScreenSetting {
    fn default() -> Self {
        Self {
            monitor_index: 0,
            is_enabled: true,
            monitor_name: String::new(),
            resolution: String::new(),
            is_primary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Sliding window age bound in seconds.
    pub window_size: u64,
    /// Screenshot tick in seconds.
    pub capture_interval: f64,
    /// Coordinator drain-loop tick in seconds.
    pub processing_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// How many accumulated screenshots trigger an extraction.
    pub event_extraction_threshold: usize,
    pub activity_summary_interval: u64,
    pub knowledge_merge_interval: u64,
    pub todo_merge_interval: u64,
    pub enable_screenshot_deduplication: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptimizationConfig {
    /// ultra | aggressive | balanced | quality
    pub compression_level: String,
    pub enable_region_cropping: bool,
    /// Per-pixel mean-diff threshold (0-255) for region cropping.
    pub crop_threshold: u8,
    /// Fraction of hash bits (0-1) that must differ for a frame to count
    /// as significant.
    pub phash_threshold: f64,
    /// Minimum seconds between two sampled frames.
    pub min_interval: f64,
    /// Maximum frames sent to the LLM per event sequence.
    pub max_images: usize,
    pub enable_content_analysis: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// "zh" | "en"
    pub default_language: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8743,
            debug: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            screen_settings: Vec::new(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            capture_interval: 1.0,
            processing_interval: 30,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            event_extraction_threshold: 20,
            activity_summary_interval: 600,
            knowledge_merge_interval: 1200,
            todo_merge_interval: 1200,
            enable_screenshot_deduplication: true,
        }
    }
}

impl Default for ImageOptimizationConfig {
    fn default() -> Self {
        Self {
            compression_level: "aggressive".to_string(),
            enable_region_cropping: false,
            crop_threshold: 30,
            phash_threshold: 0.15,
            min_interval: 2.0,
            max_images: 8,
            enable_content_analysis: true,
        }
    }
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            default_language: "zh".to_string(),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/lifetrace/config.toml`, creating defaults
    /// if missing. `${VAR}` / `${VAR:default}` references are expanded from
    /// the environment before parsing.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let config_path = dir.join("config.toml");

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = AppConfig::default();
            fs::create_dir_all(&dir)?;
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
            fs::write(&config_path, toml_str)?;
            Ok(config)
        }
    }

    /// Load config from a specific path (for testing or custom setups).
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read config: {e}")))?;
        let expanded = expand_env_vars(&contents);
        let config: AppConfig = toml::from_str(&expanded)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Write the config back to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path, toml_str)?;
        Ok(())
    }

    /// Returns the config directory (`~/.config/lifetrace`).
    pub fn config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| CoreError::Config("could not determine config directory".to_string()))?;
        Ok(base.join("lifetrace"))
    }

    /// Resolved SQLite path: configured value or the default beside the config.
    pub fn db_path(&self) -> Result<PathBuf> {
        if self.database.path.is_empty() {
            Ok(Self::config_dir()?.join("lifetrace.db"))
        } else {
            resolve_tilde(&self.database.path)
        }
    }

    /// Resolved image store base directory.
    pub fn screenshot_dir(&self) -> Result<PathBuf> {
        if self.screenshot.save_path.is_empty() {
            Ok(Self::config_dir()?.join("screenshots"))
        } else {
            resolve_tilde(&self.screenshot.save_path)
        }
    }

    /// Monitor indices enabled for capture. No configured settings means
    /// primary only; configured-but-all-disabled means none (respect the
    /// user's choice).
    pub fn enabled_monitor_indices(&self) -> Option<Vec<usize>> {
        if self.screenshot.screen_settings.is_empty() {
            return None;
        }
        let mut seen = Vec::new();
        for s in &self.screenshot.screen_settings {
            if s.is_enabled && !seen.contains(&s.monitor_index) {
                seen.push(s.monitor_index);
            }
        }
        Some(seen)
    }
}

/// Expand `${VAR}` and `${VAR:default}` references from the environment.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let inner = &after[..end];
                let (name, default) = match inner.split_once(':') {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner, None),
                };
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        if let Some(d) = default {
                            out.push_str(d);
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand `~` to the user's home directory.
fn resolve_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Initialize tracing/logging with env filter.
///
/// Respects `RUST_LOG` env var. Defaults to `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.monitoring.window_size, 20);
        assert_eq!(config.monitoring.processing_interval, 30);
        assert_eq!(config.processing.event_extraction_threshold, 20);
        assert_eq!(config.processing.activity_summary_interval, 600);
        assert_eq!(config.image_optimization.compression_level, "aggressive");
        assert_eq!(config.image_optimization.max_images, 8);
        assert_eq!(config.language.default_language, "zh");
        assert!(config.processing.enable_screenshot_deduplication);
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[monitoring]
window_size = 45
processing_interval = 10

[processing]
event_extraction_threshold = 5
enable_screenshot_deduplication = false

[language]
default_language = "en"
"#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load_from(f.path()).unwrap();
        assert_eq!(config.monitoring.window_size, 45);
        assert_eq!(config.monitoring.processing_interval, 10);
        assert_eq!(config.processing.event_extraction_threshold, 5);
        assert!(!config.processing.enable_screenshot_deduplication);
        assert_eq!(config.language.default_language, "en");
        // defaults for fields not specified
        assert_eq!(config.processing.activity_summary_interval, 600);
        assert_eq!(config.image_optimization.min_interval, 2.0);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("LIFETRACE_TEST_DB", "/tmp/from-env.db");
        let toml_content = r#"
[database]
path = "${LIFETRACE_TEST_DB}"

[screenshot]
save_path = "${LIFETRACE_TEST_MISSING:/tmp/fallback}"
"#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load_from(f.path()).unwrap();
        assert_eq!(config.database.path, "/tmp/from-env.db");
        assert_eq!(config.screenshot.save_path, "/tmp/fallback");
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.monitoring.window_size = 33;
        config.screenshot.screen_settings.push(ScreenSetting {
            monitor_index: 1,
            is_enabled: true,
            monitor_name: "DP-1".to_string(),
            resolution: "2560x1440".to_string(),
            is_primary: true,
        });
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.monitoring.window_size, 33);
        assert_eq!(loaded.screenshot.screen_settings.len(), 1);
        assert_eq!(loaded.screenshot.screen_settings[0].monitor_name, "DP-1");
    }

    #[test]
    fn test_enabled_monitors_default_primary() {
        let config = AppConfig::default();
        assert_eq!(config.enabled_monitor_indices(), None);
    }

    #[test]
    fn test_enabled_monitors_all_disabled() {
        let mut config = AppConfig::default();
        config.screenshot.screen_settings.push(ScreenSetting {
            monitor_index: 0,
            is_enabled: false,
            ..Default::default()
        });
        assert_eq!(config.enabled_monitor_indices(), Some(Vec::new()));
    }
}
