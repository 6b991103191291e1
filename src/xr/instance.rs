// OpenXR instance, system and view setup

use anyhow::{Context, Result};
use openxr as xr;

use super::debug::DebugMessenger;
use crate::backend::{self, GraphicsApiType};
use crate::config::Config;

const APPLICATION_VIEW_CONFIGURATIONS: [xr::ViewConfigurationType; 2] = [
    xr::ViewConfigurationType::PRIMARY_STEREO,
    xr::ViewConfigurationType::PRIMARY_MONO,
];

const APPLICATION_BLEND_MODES: [xr::EnvironmentBlendMode; 2] = [
    xr::EnvironmentBlendMode::OPAQUE,
    xr::EnvironmentBlendMode::ADDITIVE,
];

/// First of our preferred view configurations the runtime offers, else stereo
pub fn select_view_configuration(
    available: &[xr::ViewConfigurationType],
) -> xr::ViewConfigurationType {
    APPLICATION_VIEW_CONFIGURATIONS
        .iter()
        .copied()
        .find(|c| available.contains(c))
        .unwrap_or_else(|| {
            log::error!(
                "No preferred view configuration in {:?}, defaulting to PRIMARY_STEREO",
                available
            );
            xr::ViewConfigurationType::PRIMARY_STEREO
        })
}

pub fn select_blend_mode(available: &[xr::EnvironmentBlendMode]) -> xr::EnvironmentBlendMode {
    APPLICATION_BLEND_MODES
        .iter()
        .copied()
        .find(|m| available.contains(m))
        .unwrap_or_else(|| {
            log::error!(
                "No preferred environment blend mode in {:?}, defaulting to OPAQUE",
                available
            );
            xr::EnvironmentBlendMode::OPAQUE
        })
}

/// API layers from `requested` that the runtime offers; missing ones are logged
pub fn filter_api_layers(requested: &[String], available: &[xr::ApiLayerProperties]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| {
            let found = available.iter().any(|layer| &layer.layer_name == *name);
            if !found {
                log::error!("Failed to find OpenXR API layer: {}", name);
            }
            found
        })
        .cloned()
        .collect()
}

pub struct XrContext {
    // Dropped before the instance
    _debug: Option<DebugMessenger>,
    pub instance: xr::Instance,
    pub system: xr::SystemId,
    pub view_configuration: xr::ViewConfigurationType,
    pub views: Vec<xr::ViewConfigurationView>,
    pub blend_mode: xr::EnvironmentBlendMode,
    pub api: GraphicsApiType,
}

impl XrContext {
    pub fn new(config: &Config, api: GraphicsApiType) -> Result<Self> {
        if !backend::is_valid_for_platform(api) {
            anyhow::bail!("{} is not available on this platform", api);
        }

        let entry = unsafe { xr::Entry::load() }.context("Failed to load the OpenXR loader")?;

        let layers = entry
            .enumerate_layers()
            .context("Failed to enumerate OpenXR API layers")?;
        for layer in &layers {
            log::info!(
                "API layer: {} (v{}) - {}",
                layer.layer_name,
                layer.layer_version,
                layer.description
            );
        }
        let api_layers = filter_api_layers(&config.xr.api_layers, &layers);

        let available = entry
            .enumerate_extensions()
            .context("Failed to enumerate OpenXR instance extensions")?;
        log::debug!("Runtime extensions: {:#?}", available);

        let mut extensions = xr::ExtensionSet::default();
        if config.xr.debug_utils {
            if available.ext_debug_utils {
                extensions.ext_debug_utils = true;
            } else {
                log::error!("Failed to find OpenXR instance extension: XR_EXT_debug_utils");
            }
        }
        if !backend::enable_instance_extension(api, &available, &mut extensions)? {
            anyhow::bail!(
                "Failed to find OpenXR instance extension: {}",
                backend::instance_extension_name(api)?
            );
        }

        let layer_refs: Vec<&str> = api_layers.iter().map(String::as_str).collect();
        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: &config.application.name,
                    application_version: config.application.version,
                    engine_name: &config.application.engine_name,
                    engine_version: config.application.version,
                    api_version: xr::Version::new(1, 0, 0),
                },
                &extensions,
                &layer_refs,
            )
            .context("Failed to create OpenXR instance")?;

        let debug = if extensions.ext_debug_utils {
            Some(DebugMessenger::new(&instance)?)
        } else {
            None
        };

        let props = instance
            .properties()
            .context("Failed to get OpenXR instance properties")?;
        log::info!(
            "OpenXR runtime: {} {}",
            props.runtime_name,
            props.runtime_version
        );

        let system = instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .context("Failed to get a head mounted display system")?;
        let system_props = instance
            .system_properties(system)
            .context("Failed to get OpenXR system properties")?;
        log::info!(
            "System: {} (vendor {:#x}), max {} layers, {}x{} max swapchain, orientation tracking {}, position tracking {}",
            system_props.system_name,
            system_props.vendor_id,
            system_props.graphics_properties.max_layer_count,
            system_props.graphics_properties.max_swapchain_image_width,
            system_props.graphics_properties.max_swapchain_image_height,
            system_props.tracking_properties.orientation_tracking,
            system_props.tracking_properties.position_tracking
        );

        let view_configurations = instance
            .enumerate_view_configurations(system)
            .context("Failed to enumerate view configurations")?;
        let view_configuration = select_view_configuration(&view_configurations);
        let views = instance
            .enumerate_view_configuration_views(system, view_configuration)
            .context("Failed to enumerate view configuration views")?;
        for (i, view) in views.iter().enumerate() {
            log::info!(
                "View {}: recommended {}x{}, {} samples",
                i,
                view.recommended_image_rect_width,
                view.recommended_image_rect_height,
                view.recommended_swapchain_sample_count
            );
        }

        let blend_modes = instance
            .enumerate_environment_blend_modes(system, view_configuration)
            .context("Failed to enumerate environment blend modes")?;
        let blend_mode = select_blend_mode(&blend_modes);
        log::info!(
            "View configuration {:?}, blend mode {:?}",
            view_configuration,
            blend_mode
        );

        Ok(Self {
            _debug: debug,
            instance,
            system,
            view_configuration,
            views,
            blend_mode,
            api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_preferred_over_mono() {
        let available = [
            xr::ViewConfigurationType::PRIMARY_MONO,
            xr::ViewConfigurationType::PRIMARY_STEREO,
        ];
        assert_eq!(
            select_view_configuration(&available),
            xr::ViewConfigurationType::PRIMARY_STEREO
        );
    }

    #[test]
    fn mono_only_runtime() {
        assert_eq!(
            select_view_configuration(&[xr::ViewConfigurationType::PRIMARY_MONO]),
            xr::ViewConfigurationType::PRIMARY_MONO
        );
    }

    #[test]
    fn unknown_view_configuration_defaults_to_stereo() {
        assert_eq!(
            select_view_configuration(&[]),
            xr::ViewConfigurationType::PRIMARY_STEREO
        );
    }

    #[test]
    fn opaque_preferred_then_additive() {
        let available = [
            xr::EnvironmentBlendMode::ALPHA_BLEND,
            xr::EnvironmentBlendMode::ADDITIVE,
            xr::EnvironmentBlendMode::OPAQUE,
        ];
        assert_eq!(select_blend_mode(&available), xr::EnvironmentBlendMode::OPAQUE);
        assert_eq!(
            select_blend_mode(&[xr::EnvironmentBlendMode::ADDITIVE]),
            xr::EnvironmentBlendMode::ADDITIVE
        );
    }

    #[test]
    fn alpha_blend_only_falls_back_to_opaque() {
        assert_eq!(
            select_blend_mode(&[xr::EnvironmentBlendMode::ALPHA_BLEND]),
            xr::EnvironmentBlendMode::OPAQUE
        );
    }

    #[test]
    fn missing_api_layers_are_dropped() {
        let available = vec![xr::ApiLayerProperties {
            layer_name: "XR_APILAYER_LUNARG_core_validation".to_string(),
            spec_version: xr::Version::new(1, 0, 0),
            layer_version: 1,
            description: "validation".to_string(),
        }];
        let requested = vec![
            "XR_APILAYER_LUNARG_core_validation".to_string(),
            "XR_APILAYER_missing".to_string(),
        ];
        assert_eq!(
            filter_api_layers(&requested, &available),
            vec!["XR_APILAYER_LUNARG_core_validation".to_string()]
        );
    }
}
