// ============================================================================
// SETTINGS — key=value config file with platform-specific location
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatchConfig;

/// Persisted engine settings. Missing or malformed keys fall back to
/// their defaults; unknown keys are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Base URL of the PocketBase-style backend.
    pub store_url: String,
    pub canvas_id: String,
    /// Surface pixels per canvas cell.
    pub scale: u32,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub max_undo_steps: usize,
    /// Per-coordinate versions on mutations and events (off = last arrival wins).
    pub versioned_sync: bool,
    pub request_timeout_secs: u64,
    pub log_level: log::LevelFilter,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:8090".to_string(),
            canvas_id: String::new(),
            scale: 6,
            chunk_size: 10,
            chunk_delay_ms: 100,
            max_undo_steps: 50,
            versioned_sync: true,
            request_timeout_secs: 10,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl Settings {
    /// Get the platform-specific settings file path.
    ///
    /// On Linux:   ~/.config/pixelsync/pixelsync_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PixelSync\pixelsync_settings.cfg
    /// On macOS:   ~/Library/Application Support/PixelSync/pixelsync_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("pixelsync");
            return Some(config_dir.join("pixelsync_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("PixelSync").join("pixelsync_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("PixelSync")
                    .join("pixelsync_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("pixelsync_settings.cfg")))
        }
    }

    /// Load settings from the default location (defaults if missing or corrupt).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        let d = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "store_url" => {
                    if !val.is_empty() {
                        s.store_url = val.to_string();
                    }
                }
                "canvas_id" => {
                    s.canvas_id = val.to_string();
                }
                "scale" => {
                    s.scale = val.parse().ok().filter(|&v| v > 0).unwrap_or(d.scale);
                }
                "chunk_size" => {
                    s.chunk_size = val.parse().unwrap_or(d.chunk_size);
                }
                "chunk_delay_ms" => {
                    s.chunk_delay_ms = val.parse().unwrap_or(d.chunk_delay_ms);
                }
                "max_undo_steps" => {
                    s.max_undo_steps = val.parse().unwrap_or(d.max_undo_steps);
                }
                "versioned_sync" => {
                    s.versioned_sync = val != "false";
                }
                "request_timeout_secs" => {
                    s.request_timeout_secs = val.parse().ok().filter(|&v| v > 0).unwrap_or(d.request_timeout_secs);
                }
                "log_level" => {
                    s.log_level = val.parse().unwrap_or(d.log_level);
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "store_url={}\n\
             canvas_id={}\n\
             scale={}\n\
             chunk_size={}\n\
             chunk_delay_ms={}\n\
             max_undo_steps={}\n\
             versioned_sync={}\n\
             request_timeout_secs={}\n\
             log_level={}\n",
            self.store_url,
            self.canvas_id,
            self.scale,
            self.chunk_size,
            self.chunk_delay_ms,
            self.max_undo_steps,
            self.versioned_sync,
            self.request_timeout_secs,
            self.log_level.to_string().to_lowercase(),
        )
    }

    /// Save settings to the default location.
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = self.save_to(&path) {
            log::warn!("Could not save settings to {}: {}", path.display(), e);
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::new(self.chunk_size, Duration::from_millis(self.chunk_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_known_keys() {
        let s = Settings::parse(
            "store_url = https://pb.example.org\n\
             canvas_id=abc123\n\
             scale=4\n\
             chunk_size=25\n\
             chunk_delay_ms=0\n\
             versioned_sync=false\n\
             log_level=debug\n\
             some_future_key=1\n",
        );
        assert_eq!(s.store_url, "https://pb.example.org");
        assert_eq!(s.canvas_id, "abc123");
        assert_eq!(s.scale, 4);
        assert_eq!(s.chunk_size, 25);
        assert_eq!(s.chunk_delay_ms, 0);
        assert!(!s.versioned_sync);
        assert_eq!(s.log_level, log::LevelFilter::Debug);
        assert_eq!(s.max_undo_steps, 50);
    }

    #[test]
    fn malformed_values_fall_back() {
        let s = Settings::parse("scale=0\nchunk_size=ten\nrequest_timeout_secs=-3\nlog_level=loud\nnot a line");
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pixelsync_settings.cfg");
        let mut s = Settings::default();
        s.canvas_id = "xyz".into();
        s.chunk_size = 3;
        s.log_level = log::LevelFilter::Warn;
        s.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), s);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load_from(&dir.path().join("absent.cfg")), Settings::default());
    }
}
