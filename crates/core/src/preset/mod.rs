use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, VizError};

/// Drawing routine a preset uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetStyle {
    /// Log-spaced spectrum bars.
    Spectrum,
    /// Oscilloscope trace of the latest PCM window.
    Scope,
    /// Disc whose radius follows loudness, flashing on beats.
    Pulse,
}

/// A named look for the software visualiser. Loaded from
/// `<datadir>/presets/*.json` or taken from the built-in set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub style: PresetStyle,
    /// Background colour as RGB.
    #[serde(default = "default_background")]
    pub background: [u8; 3],
    /// Foreground colour as RGB.
    #[serde(default = "default_foreground")]
    pub foreground: [u8; 3],
    /// How much of the previous frame survives each tick, in [0, 1).
    #[serde(default = "default_trail")]
    pub trail: f32,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_background() -> [u8; 3] {
    [0, 0, 0]
}

fn default_foreground() -> [u8; 3] {
    [255, 255, 255]
}

fn default_trail() -> f32 {
    0.8
}

fn default_gain() -> f32 {
    1.0
}

impl Preset {
    pub fn new(name: impl Into<String>, style: PresetStyle) -> Self {
        Self {
            name: name.into(),
            style,
            background: default_background(),
            foreground: default_foreground(),
            trail: default_trail(),
            gain: default_gain(),
        }
    }

    fn with_colors(mut self, background: [u8; 3], foreground: [u8; 3]) -> Self {
        self.background = background;
        self.foreground = foreground;
        self
    }
}

/// Ordered preset list. Built-ins come first, followed by files from the
/// data directory sorted by file name.
#[derive(Debug, Clone)]
pub struct PresetLibrary {
    presets: Vec<Preset>,
}

impl PresetLibrary {
    pub fn builtin() -> Self {
        Self {
            presets: vec![
                Preset::new("spectrum", PresetStyle::Spectrum).with_colors([8, 8, 24], [64, 200, 255]),
                Preset::new("scope", PresetStyle::Scope).with_colors([0, 12, 0], [120, 255, 120]),
                Preset::new("pulse", PresetStyle::Pulse).with_colors([20, 0, 20], [255, 96, 200]),
            ],
        }
    }

    /// Built-ins plus every `*.json` preset in `<data_dir>/presets`. A missing
    /// preset directory is not an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut library = Self::builtin();
        let dir = data_dir.join("presets");
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "no preset directory");
            return Ok(library);
        }

        let mut paths: Vec<_> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<Preset>(&text) {
                Ok(preset) => library.presets.push(preset),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable preset")
                }
            }
        }
        tracing::info!(count = library.len(), "presets loaded");
        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Preset> {
        self.presets.get(index)
    }

    pub fn as_slice(&self) -> &[Preset] {
        &self.presets
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.iter().map(|preset| preset.name.as_str())
    }

    /// Finds a preset by exact name, then case-insensitively, then by a
    /// `.json` file name.
    pub fn find(&self, name: &str) -> Option<usize> {
        let stem = name.strip_suffix(".json").unwrap_or(name);
        self.presets
            .iter()
            .position(|preset| preset.name == name)
            .or_else(|| {
                self.presets
                    .iter()
                    .position(|preset| preset.name.eq_ignore_ascii_case(stem))
            })
    }

    /// Like [`PresetLibrary::find`], but an unknown name is a configuration
    /// error.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.find(name).ok_or_else(|| {
            VizError::config(format!(
                "unknown preset `{name}` (available: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_names() {
        let library = PresetLibrary::builtin();
        assert_eq!(library.resolve("scope").unwrap(), 1);
        assert_eq!(library.resolve("PULSE").unwrap(), 2);
        assert_eq!(library.resolve("spectrum.json").unwrap(), 0);
    }

    #[test]
    fn unknown_preset_is_config_error() {
        let err = PresetLibrary::builtin().resolve("nope").unwrap_err();
        assert!(matches!(err, VizError::Config(_)));
        assert!(format!("{err}").contains("spectrum"));
    }

    #[test]
    fn loads_presets_from_data_dir() {
        let data = tempfile::tempdir().unwrap();
        let dir = data.path().join("presets");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("b_glow.json"),
            r#"{ "name": "glow", "style": "pulse", "foreground": [255, 200, 0] }"#,
        )
        .unwrap();
        fs::write(dir.join("a_bars.json"), r#"{ "name": "bars", "style": "spectrum" }"#).unwrap();
        fs::write(dir.join("broken.json"), "{ not json").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let library = PresetLibrary::load(data.path()).unwrap();
        let names: Vec<&str> = library.names().collect();
        assert_eq!(names, vec!["spectrum", "scope", "pulse", "bars", "glow"]);

        let glow = library.get(library.resolve("glow").unwrap()).unwrap();
        assert_eq!(glow.foreground, [255, 200, 0]);
        assert_eq!(glow.trail, 0.8);
    }

    #[test]
    fn missing_preset_dir_yields_builtins() {
        let data = tempfile::tempdir().unwrap();
        assert_eq!(PresetLibrary::load(data.path()).unwrap().len(), 3);
    }
}
