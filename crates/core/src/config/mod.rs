use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Data directory used when none is given on the command line.
pub const DEFAULT_DATA_DIR: &str = "/usr/local/share/sndviz";
/// Name of the config file, both in the data directory and the user directory.
pub const CONFIG_FILE_NAME: &str = "config.json";
/// Per-user directory below `$HOME`.
pub const USER_DIR_NAME: &str = ".sndviz";

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub video: VideoConfig,
    pub engine: EngineConfig,
    pub encoder: EncoderConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Finds and loads the config for `data_dir`, falling back to built-in
    /// defaults when no file is available.
    pub fn discover(data_dir: &Path) -> Result<Self> {
        match resolve_config_path(data_dir, dirs::home_dir().as_deref()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            None => {
                tracing::warn!(
                    data_dir = %data_dir.display(),
                    "no config file found, using built-in settings"
                );
                Ok(Self::default())
            }
        }
    }
}

/// Output video format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Target frame rate. Non-positive values fall back to 60.
    pub fps: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            width: 1280,
            height: 720,
        }
    }
}

/// Settings handed to the visualiser engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds a preset stays on screen before the engine moves on.
    pub preset_duration_secs: f32,
    pub beat_sensitivity: f32,
    /// Pick the next preset at random instead of in order.
    pub shuffle: bool,
    /// Switch presets early on unusually strong beats.
    pub hard_cut: bool,
    pub hard_cut_sensitivity: f32,
    /// Minimum seconds between hard cuts.
    pub hard_cut_min_secs: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preset_duration_secs: 22.0,
            beat_sensitivity: 1.0,
            shuffle: true,
            hard_cut: true,
            hard_cut_sensitivity: 1.0,
            hard_cut_min_secs: 60.0,
        }
    }
}

/// How the external encoder is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    pub log_level: String,
    /// Output codec arguments placed before the output path.
    pub codec_args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            log_level: "error".to_string(),
            codec_args: [
                "-c:v", "libx264", "-pix_fmt", "yuv420p", "-preset", "medium", "-crf", "18",
                "-c:a", "aac", "-b:a", "192k",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Picks the config file to load.
///
/// The user copy in `<home>/.sndviz` wins. When only the data directory has a
/// config it is copied to the user directory first; if that copy fails the
/// data directory file is used directly.
pub fn resolve_config_path(data_dir: &Path, home: Option<&Path>) -> Option<PathBuf> {
    let shipped = data_dir.join(CONFIG_FILE_NAME);
    let user_dir = home.map(|home| home.join(USER_DIR_NAME));
    let user = user_dir.as_ref().map(|dir| dir.join(CONFIG_FILE_NAME));

    if let Some(user) = user.as_ref().filter(|path| path.is_file()) {
        return Some(user.clone());
    }
    if !shipped.is_file() {
        return None;
    }

    if let (Some(dir), Some(user)) = (user_dir.as_ref(), user.as_ref()) {
        match fs::create_dir_all(dir).and_then(|_| fs::copy(&shipped, user)) {
            Ok(_) => {
                tracing::info!(path = %user.display(), "created user config");
                return Some(user.clone());
            }
            Err(err) => {
                tracing::warn!(%err, "cannot create user config, using the shipped one");
            }
        }
    }
    Some(shipped)
}
