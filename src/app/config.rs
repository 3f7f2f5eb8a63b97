use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathSettings {
    pub packages_list: String,
    pub package_config: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            packages_list: "/data/system/packages.list".to_string(),
            package_config: "/data/adb/ap/package_config".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    pub kpatch_program: String,
    pub apd_program: String,
    pub dumpsys_program: String,
    pub superkey: String,
    pub command_timeout: i32,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            kpatch_program: "/data/adb/kpatch".to_string(),
            apd_program: "/data/adb/apd".to_string(),
            dumpsys_program: "dumpsys".to_string(),
            superkey: String::new(),
            command_timeout: 30,
        }
    }
}

impl ToolSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout.max(1) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuperuserSettings {
    /// -1 system default, 0 exclude user apps, 1 exclude system apps, 2 exclude all.
    pub whitelist_mode: i32,
    pub manager_package: String,
    pub show_system_apps: bool,
}

impl Default for SuperuserSettings {
    fn default() -> Self {
        Self {
            whitelist_mode: -1,
            manager_package: "me.bmax.apatch".to_string(),
            show_system_apps: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateSettings {
    pub check_concurrency: usize,
    pub user_agent: String,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_concurrency: 4,
            user_agent: format!("patchmgr/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub superuser: SuperuserSettings,
    #[serde(default)]
    pub updates: UpdateSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Copy safe to print: the superkey is masked.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.tools.superkey.is_empty() {
            copy.tools.superkey = "********".to_string();
        }
        copy
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PATCHMGR_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".patchmgr_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let mut path = config_path().into_os_string();
    path.push(".backup");
    PathBuf::from(path)
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::parse(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.tools.command_timeout < 1 {
        config.tools.command_timeout = 30;
    }
    if !(-1..=2).contains(&config.superuser.whitelist_mode) {
        config.superuser.whitelist_mode = -1;
    }
    if config.updates.check_concurrency == 0 || config.updates.check_concurrency > 16 {
        config.updates.check_concurrency = 4;
    }
    if config.paths.packages_list.trim().is_empty() {
        config.paths.packages_list = PathSettings::default().packages_list;
    }
    if config.paths.package_config.trim().is_empty() {
        config.paths.package_config = PathSettings::default().package_config;
    }
    config
}
