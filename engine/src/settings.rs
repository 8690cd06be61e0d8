use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};
use uuid::Uuid;

use crate::error::Result;

const APP_DIR_NAME: &str = "mediagrab";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub download_directory: String,
    /// Executable used for both downloads and metadata fetches.
    #[serde(default = "default_downloader")]
    pub downloader_path: String,
    #[serde(default)]
    pub debug_logs: bool,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    /// Lifetime given to fetched metadata whose format URLs carry no expiry.
    #[serde(default = "default_expiry_minutes")]
    pub default_expiry_minutes: i64,
}

fn default_downloader() -> String { "yt-dlp".to_string() }
fn default_metadata_timeout() -> u64 { 120 }
fn default_expiry_minutes() -> i64 { 15 }

impl Default for Settings {
    fn default() -> Self {
        Settings {
            download_directory: default_download_dir().to_string_lossy().to_string(),
            downloader_path: default_downloader(),
            debug_logs: false,
            metadata_timeout_secs: default_metadata_timeout(),
            default_expiry_minutes: default_expiry_minutes(),
        }
    }
}

/// Where app data lives:
///   ~/Library/Application Support/mediagrab (macOS)
///   ~/.config/mediagrab (Linux)
///   %APPDATA%\mediagrab (Windows)
pub fn app_support_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
    base.join(APP_DIR_NAME)
}

pub fn settings_json_path() -> PathBuf {
    app_support_dir().join("settings.json")
}

pub fn cache_dir() -> PathBuf {
    app_support_dir().join("cache")
}

pub fn history_db_path() -> PathBuf {
    app_support_dir().join("history.db")
}

pub fn log_dir() -> PathBuf {
    app_support_dir().join("logs")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn dir_is_writable(p: &Path) -> bool {
    if !p.exists() || !p.is_dir() {
        return false;
    }
    let test = p.join(format!(".writecheck-{}.tmp", Uuid::new_v4()));
    match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&test)
    {
        Ok(_) => {
            let _ = fs::remove_file(test);
            true
        }
        Err(_) => false,
    }
}

/// Validate a candidate directory. If invalid, return the default Downloads dir (and try to create it).
fn validated_download_dir(candidate: &str) -> String {
    let mut path = PathBuf::from(candidate.trim());

    if path.as_os_str().is_empty() || !path.is_absolute() {
        path = default_download_dir();
    }

    if !path.exists() && fs::create_dir_all(&path).is_err() {
        path = default_download_dir();
        let _ = fs::create_dir_all(&path);
    }

    if !dir_is_writable(&path) {
        let d = default_download_dir();
        let _ = fs::create_dir_all(&d);
        return d.to_string_lossy().to_string();
    }

    path.to_string_lossy().to_string()
}

fn normalized(mut settings: Settings) -> Settings {
    settings.download_directory = validated_download_dir(&settings.download_directory);
    if settings.downloader_path.trim().is_empty() {
        settings.downloader_path = default_downloader();
    }
    if settings.metadata_timeout_secs == 0 {
        settings.metadata_timeout_secs = default_metadata_timeout();
    }
    if settings.default_expiry_minutes <= 0 {
        settings.default_expiry_minutes = default_expiry_minutes();
    }
    settings
}

/// Load settings from the default location.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_json_path())
}

/// Load settings from JSON, validate them, and persist any fixups.
pub fn load_settings_from(path: &Path) -> Settings {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let settings = match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str::<Settings>(&s).unwrap_or_default(),
        Err(_) => Settings::default(),
    };
    let settings = normalized(settings);

    // Persist the clean copy (also migrates any old/invalid file)
    if let Ok(body) = serde_json::to_string_pretty(&settings) {
        if let Err(e) = fs::write(path, body) {
            tracing::warn!("could not persist settings to {}: {e}", path.display());
        }
    }

    settings
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_json_path(), settings)
}

/// Save settings back to JSON after the same validation `load_settings_from` applies.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let to_write = normalized(settings.clone());
    let body = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, body)?;
    Ok(())
}
