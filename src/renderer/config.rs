use std::path::Path;
use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use crate::renderer::error::{RenderError, Result};

pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CPU emulation, no GPU required
    #[default]
    Headless,
    Vulkan,
}

/// Contains configuration options for the renderer like the resolution, vsync, and descriptor heap sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Frame slots the CPU may record ahead of the GPU (1 to 4)
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,

    #[serde(default = "default_rtv_heap_capacity")]
    pub rtv_heap_capacity: u32,

    #[serde(default = "default_dsv_heap_capacity")]
    pub dsv_heap_capacity: u32,

    #[serde(default = "default_cbv_srv_uav_heap_capacity")]
    pub cbv_srv_uav_heap_capacity: u32,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_width")]
    pub back_buffer_width: u32,

    #[serde(default = "default_height")]
    pub back_buffer_height: u32,

    #[serde(default = "default_vsync")]
    pub vsync: bool,
}

fn default_frames_in_flight() -> u32 {
    2
}

fn default_rtv_heap_capacity() -> u32 {
    64
}

fn default_dsv_heap_capacity() -> u32 {
    16
}

fn default_cbv_srv_uav_heap_capacity() -> u32 {
    1024
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_vsync() -> bool {
    true
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            rtv_heap_capacity: default_rtv_heap_capacity(),
            dsv_heap_capacity: default_dsv_heap_capacity(),
            cbv_srv_uav_heap_capacity: default_cbv_srv_uav_heap_capacity(),
            backend: BackendKind::default(),
            back_buffer_width: default_width(),
            back_buffer_height: default_height(),
            vsync: default_vsync(),
        }
    }
}

impl RenderConfig {
    /// Load and validate a TOML file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> color_eyre::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let config: RenderConfig = toml::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> color_eyre::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No render config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> color_eyre::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .wrap_err_with(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(RenderError::InvalidConfig(format!(
                "frames_in_flight must be between 1 and {}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        for (field, capacity) in [
            ("rtv_heap_capacity", self.rtv_heap_capacity),
            ("dsv_heap_capacity", self.dsv_heap_capacity),
            ("cbv_srv_uav_heap_capacity", self.cbv_srv_uav_heap_capacity),
        ] {
            if capacity == 0 {
                return Err(RenderError::InvalidConfig(format!("{} must be greater than zero", field)));
            }
        }
        if self.back_buffer_width == 0 || self.back_buffer_height == 0 {
            return Err(RenderError::InvalidConfig("back buffer size must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: RenderConfig = toml::from_str("frames_in_flight = 3\nbackend = \"headless\"").unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.cbv_srv_uav_heap_capacity, 1024);
        assert!(config.vsync);
        assert_eq!(config.backend, BackendKind::Headless);

        let empty: RenderConfig = toml::from_str("").unwrap();
        assert_eq!(empty, RenderConfig::default());
    }

    #[test]
    fn save_then_load_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.toml");
        let config = RenderConfig {
            frames_in_flight: 3,
            rtv_heap_capacity: 8,
            backend: BackendKind::Vulkan,
            vsync: false,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(RenderConfig::load(&path).unwrap(), config);
        assert!(std::fs::read_to_string(&path).unwrap().contains("backend = \"vulkan\""));
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RenderConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RenderConfig::default());
        assert!(RenderConfig::load(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for config in [
            RenderConfig { frames_in_flight: 0, ..Default::default() },
            RenderConfig { frames_in_flight: 5, ..Default::default() },
            RenderConfig { dsv_heap_capacity: 0, ..Default::default() },
            RenderConfig { back_buffer_width: 0, ..Default::default() },
        ] {
            assert!(matches!(config.validate(), Err(RenderError::InvalidConfig(_))));
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "frames_in_flight = 9").unwrap();
        assert!(RenderConfig::load(&path).is_err());
    }
}
