// =============================================================================
// OPENXR GRAPHICS - one render pass over D3D11, D3D12, OpenGL, OpenGL ES, Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (config, frame loop)                                       │
// │    ├── XrContext (instance, system, view config, blend mode)    │
// │    ├── Backend: impl GraphicsApi (native device)                │
// │    ├── XrSession (session, LOCAL space, frame waiter/stream)    │
// │    ├── SwapchainSet (colour + depth per view)                   │
// │    └── Scene (cube mesh, uniforms, pipeline)                    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Poll OpenXR events (session state changes begin/end the session)
// 2. Wait for and begin the frame
// 3. Locate the views in the LOCAL space
// 4. Per view: acquire images, clear, draw, release
// 5. End the frame with one projection layer
//
// =============================================================================

use anyhow::{Context, Result};
use openxr_graphics::app::App;
use openxr_graphics::backend::{self, GraphicsApiType};
use openxr_graphics::config::Config;
use openxr_graphics::xr::XrContext;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, source) = Config::load();
    init_logging(&config)?;
    source.log();
    if config.known_log_level().is_none() {
        log::warn!(
            "Unknown log level '{}', defaulting to INFO",
            config.debug.log_level
        );
    }
    log::debug!("Config: {:?}", config);

    let api = config.graphics_api()?;
    log::info!("Starting {} with the {} backend", config.application.name, api);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Relaxed))
        .context("Failed to set Ctrl-C handler")?;

    match api {
        GraphicsApiType::Vulkan => {
            let xr_ctx = XrContext::new(&config, api)?;
            let backend = backend::vulkan::VulkanApi::new(
                &xr_ctx.instance,
                xr_ctx.system,
                &config.application.name,
                config.debug.validation_layers,
            )?;
            App::new(config, xr_ctx, backend)?.run(&running)
        }
        #[cfg(windows)]
        GraphicsApiType::D3D11 => {
            let xr_ctx = XrContext::new(&config, api)?;
            let backend = backend::d3d::D3D11Api::new(
                &xr_ctx.instance,
                xr_ctx.system,
                config.debug.validation_layers,
            )?;
            App::new(config, xr_ctx, backend)?.run(&running)
        }
        #[cfg(windows)]
        GraphicsApiType::D3D12 => {
            let xr_ctx = XrContext::new(&config, api)?;
            let backend = backend::d3d::D3D12Api::new(
                &xr_ctx.instance,
                xr_ctx.system,
                config.debug.validation_layers,
            )?;
            App::new(config, xr_ctx, backend)?.run(&running)
        }
        GraphicsApiType::OpenGL | GraphicsApiType::OpenGLES => anyhow::bail!(
            "{} needs a current GL context from the host window system; \
             construct GlApi with one and drive App from there",
            api
        ),
        other => anyhow::bail!("{} is not available on this platform", other),
    }
}

/// Initialize logging, optionally into a truncated log file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
