//! Renderer configuration, stored as RON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::shadow;
use crate::error::ConfigError;

/// Tunables of the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Width and height of every shadow map, clamped to 256..=8192.
    pub shadow_map_size: u32,
    /// When false, shadow-casting lights are lit without shadows.
    pub shadows_enabled: bool,
    /// Diffuse color of the material used for drawables without one.
    pub default_material_color: [f32; 3],
    /// Drawables with invalid indices are skipped instead of drawn.
    pub validate_geometry: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            shadow_map_size: shadow::DEFAULT_SIZE,
            shadows_enabled: true,
            default_material_color: [0.5, 0.5, 0.5],
            validate_geometry: true,
        }
    }
}

impl RendererConfig {
    /// Shadow map size within the supported range.
    pub fn clamped_shadow_map_size(&self) -> u32 {
        self.shadow_map_size.clamp(shadow::MIN_SIZE, shadow::MAX_SIZE)
    }

    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Loads a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_ron(&content)?;
        tracing::info!("Loaded renderer config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, self.to_ron()?).map_err(|e| ConfigError::Io(e.to_string()))?;
        tracing::info!("Saved renderer config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = RendererConfig::from_ron("(shadow_map_size: 1024)").unwrap();
        assert_eq!(config.shadow_map_size, 1024);
        assert!(config.shadows_enabled);
        assert_eq!(config.default_material_color, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_shadow_map_size_is_clamped() {
        let config = RendererConfig {
            shadow_map_size: 16,
            ..Default::default()
        };
        assert_eq!(config.clamped_shadow_map_size(), 256);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("xviz-config-{}", std::process::id()));
        let path = dir.join("renderer.ron");
        let config = RendererConfig {
            shadows_enabled: false,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RendererConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = Path::new("/nonexistent/xviz/renderer.ron");
        assert_eq!(RendererConfig::load(path).unwrap(), RendererConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(matches!(
            RendererConfig::from_ron("(shadow_map_size: \"big\")"),
            Err(ConfigError::Deserialize(_))
        ));
    }
}
