// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file or a missing key falls back to
// the defaults below, so the binary runs with no config at all.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::GraphicsApiType;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub application: ApplicationConfig,
    pub xr: XrConfig,
    pub render: RenderConfig,
    pub debug: DebugConfig,
}

/// Application identity and backend choice
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub version: u32,
    pub engine_name: String,
    /// One of "d3d11", "d3d12", "opengl", "opengl_es", "vulkan"
    pub graphics_api: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "OpenXR Graphics".to_string(),
            version: 1,
            engine_name: "OpenXR Engine".to_string(),
            graphics_api: "vulkan".to_string(),
        }
    }
}

/// OpenXR instance settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct XrConfig {
    /// API layers to enable; names the runtime does not offer are skipped
    pub api_layers: Vec<String>,
    pub debug_utils: bool,
}

impl Default for XrConfig {
    fn default() -> Self {
        Self {
            api_layers: Vec::new(),
            debug_utils: true,
        }
    }
}

/// Scene and camera settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Clear colour used when the environment blend mode is OPAQUE
    pub clear_colour_opaque: [f32; 4],
    /// Clear colour for additive and alpha-blended displays
    pub clear_colour_passthrough: [f32; 4],
    pub clear_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
    pub view_height: f32,
    pub shader_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_colour_opaque: [0.17, 0.17, 0.17, 1.0],
            clear_colour_passthrough: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            near_z: 0.05,
            far_z: 100.0,
            view_height: 1.5,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "openxr_graphics.log".to_string(),
        }
    }
}

/// Where the active configuration came from
///
/// Loading happens before the logger exists, so the outcome is reported
/// afterwards through [`ConfigSource::log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at the path, defaults in use
    Missing(PathBuf),
    /// The file could not be read or parsed, defaults in use
    Invalid(String),
}

impl ConfigSource {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, ConfigSource::File(_))
    }

    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::warn!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(reason) => {
                log::warn!("Failed to load config: {}. Using defaults.", reason)
            }
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if it is missing or broken
    pub fn load() -> (Self, ConfigSource) {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            (Config::default(), ConfigSource::Invalid(format!("{:#}", e)))
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<(Self, ConfigSource)> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok((Config::default(), ConfigSource::Missing(path.to_path_buf())));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Backend requested by `application.graphics_api`
    pub fn graphics_api(&self) -> Result<GraphicsApiType> {
        self.application.graphics_api.parse()
    }

    /// Log level filter, defaulting to Info on unknown names
    pub fn log_level(&self) -> log::LevelFilter {
        self.known_log_level().unwrap_or(log::LevelFilter::Info)
    }

    /// None when `debug.log_level` names no level
    pub fn known_log_level(&self) -> Option<log::LevelFilter> {
        self.debug.log_level.parse().ok()
    }

    pub fn clear_colour(&self, blend_mode_opaque: bool) -> [f32; 4] {
        if blend_mode_opaque {
            self.render.clear_colour_opaque
        } else {
            self.render.clear_colour_passthrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.application.graphics_api, "vulkan");
        assert_eq!(config.render.near_z, 0.05);
        assert_eq!(config.render.far_z, 100.0);
        assert_eq!(config.render.view_height, 1.5);
        assert!(config.xr.debug_utils);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [application]
            graphics_api = "D3D11"

            [render]
            near_z = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics_api().unwrap(), GraphicsApiType::D3D11);
        assert_eq!(config.render.near_z, 0.1);
        assert_eq!(config.render.clear_depth, 1.0);
        assert_eq!(config.application.name, "OpenXR Graphics");
    }

    #[test]
    fn api_layers_are_read() {
        let config = Config::from_toml(
            r#"
            [xr]
            api_layers = ["XR_APILAYER_LUNARG_core_validation"]
            debug_utils = false
            "#,
        )
        .unwrap();
        assert_eq!(config.xr.api_layers, vec!["XR_APILAYER_LUNARG_core_validation"]);
        assert!(!config.xr.debug_utils);
    }

    #[test]
    fn unknown_graphics_api_is_an_error() {
        let config = Config::from_toml("[application]\ngraphics_api = \"metal\"").unwrap();
        assert!(config.graphics_api().is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml("[render\nnear_z = ").is_err());
    }

    #[test]
    fn clear_colour_depends_on_blend_mode() {
        let config = Config::default();
        assert_eq!(config.clear_colour(true), [0.17, 0.17, 0.17, 1.0]);
        assert_eq!(config.clear_colour(false), [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn log_level_parses_known_names() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        config.debug.log_level = "loud".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        assert_eq!(config.known_log_level(), None);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("openxr_graphics_no_such_config.toml");
        let (config, source) = Config::load_from_path(&path).unwrap();
        assert_eq!(source, ConfigSource::Missing(path));
        assert!(source.is_fallback());
        assert_eq!(config.application.graphics_api, "vulkan");
    }

    #[test]
    fn existing_file_is_reported_as_source() {
        let path = std::env::temp_dir().join(format!(
            "openxr_graphics_config_{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[render]\nview_height = 1.2\n").unwrap();
        let (config, source) = Config::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(source, ConfigSource::File(path));
        assert!(!source.is_fallback());
        assert_eq!(config.render.view_height, 1.2);
    }

    #[test]
    fn broken_file_is_an_error_from_load_from_path() {
        let path = std::env::temp_dir().join(format!(
            "openxr_graphics_broken_{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[render\nnear_z = ").unwrap();
        let result = Config::load_from_path(&path);
        std::fs::remove_file(&path).unwrap();
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to parse config file"), "{}", message);
    }
}
