use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_false")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_false(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_fitness_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timings for the session state machine, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_settle_ms")]
    pub discovery_settle_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_rssi_timeout_ms")]
    pub rssi_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_scan_duration_ms")]
    pub default_scan_duration_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_settle_ms: default_discovery_settle_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            rssi_timeout_ms: default_rssi_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            default_scan_duration_ms: default_scan_duration_ms(),
        }
    }
}

impl SessionSettings {
    pub fn default_scan_duration(&self) -> Duration {
        Duration::from_millis(self.default_scan_duration_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_settle_ms() -> u64 {
    1_000
}
fn default_read_timeout_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_rssi_timeout_ms() -> u64 {
    2_000
}
fn default_disconnect_timeout_ms() -> u64 {
    5_000
}
fn default_scan_duration_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Serve the RPC channel on this local socket in addition to stdio
    #[serde(default)]
    pub local_socket_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults when it
    /// is missing or malformed
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleFitnessBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_use_defaults() {
        let json = r#"{ "session": { "read_timeout_ms": 250 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.session.read_timeout_ms, 250);
        assert_eq!(settings.session.connect_timeout_ms, 10_000);
        assert_eq!(settings.session.discovery_settle_ms, 1_000);
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.transport.local_socket_name.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("ble_fitness_bridge_missing_settings.json");
        let _ = fs::remove_file(&path);
        let service = SettingsService::from_path(path.clone());
        assert_eq!(service.get().session.read_timeout_ms, 5_000);
        assert_eq!(service.path(), path.as_path());
    }

    #[test]
    fn test_save_then_reload() {
        let path = std::env::temp_dir().join("ble_fitness_bridge_saved_settings.json");
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().session.read_timeout_ms = 750;
        service.get_mut().transport.local_socket_name = Some("bridge.sock".into());
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().session.read_timeout_ms, 750);
        assert_eq!(
            reloaded.get().transport.local_socket_name.as_deref(),
            Some("bridge.sock")
        );
        let _ = fs::remove_file(&path);
    }
}
