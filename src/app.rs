// App - the OpenXR frame loop over any backend

use anyhow::{Context, Result};
use openxr as xr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backend::GraphicsApi;
use crate::config::Config;
use crate::scene::{Scene, ViewTarget};
use crate::xr::{SwapchainSet, XrContext, XrSession};

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything the frame loop touches.
///
/// IMPORTANT: Field order matters for Drop! The session and its swapchains
/// go before the graphics device, and the device before the instance.
pub struct App<B: GraphicsApi> {
    config: Config,
    scene: Option<Scene>,
    swapchains: Option<SwapchainSet<B::Xr>>,
    session: XrSession<B::Xr>,
    api: B,
    xr: XrContext,

    frame_count: u64,
    started: Instant,
}

impl<B: GraphicsApi> App<B> {
    pub fn new(config: Config, xr_ctx: XrContext, mut api: B) -> Result<Self> {
        let session = XrSession::new(&xr_ctx, &api)?;
        let swapchains = SwapchainSet::new(&mut api, &xr_ctx, &session.session)?;

        let colour_format = swapchains.colour_format().context("No views to render")?;
        let depth_format = swapchains.depth_format().context("No views to render")?;
        let scene = Scene::new(
            &mut api,
            &config.render,
            xr_ctx.views.len(),
            colour_format,
            depth_format,
        )?;

        Ok(Self {
            config,
            scene: Some(scene),
            swapchains: Some(swapchains),
            session,
            api,
            xr: xr_ctx,
            frame_count: 0,
            started: Instant::now(),
        })
    }

    // =========================================================================
    // MAIN LOOP
    // =========================================================================

    pub fn run(mut self, running: &AtomicBool) -> Result<()> {
        let mut exit_requested = false;

        loop {
            if !running.load(Ordering::Relaxed) && !exit_requested {
                log::info!("Exit requested");
                if !self.session.running {
                    break;
                }
                self.session.request_exit()?;
                exit_requested = true;
            }

            if !self
                .session
                .poll_events(&self.xr.instance, self.xr.view_configuration)?
            {
                break;
            }

            if !self.session.running {
                // Nothing to render until the runtime says READY
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            self.render_frame()?;
        }

        self.shutdown()
    }

    fn render_frame(&mut self) -> Result<()> {
        let frame_state = self
            .session
            .frame_waiter
            .wait()
            .context("Failed to wait for frame")?;
        self.session
            .frame_stream
            .begin()
            .context("Failed to begin frame")?;

        let display_time = frame_state.predicted_display_time;
        let blend_mode = self.xr.blend_mode;

        if !(self.session.is_active() && frame_state.should_render) {
            self.session
                .frame_stream
                .end(display_time, blend_mode, &[])
                .context("Failed to end frame")?;
            return Ok(());
        }

        let views = match self.session.session.locate_views(
            self.xr.view_configuration,
            display_time,
            &self.session.space,
        ) {
            Ok((_, views)) => views,
            Err(e) => {
                log::error!("Failed to locate views: {}", e);
                self.session
                    .frame_stream
                    .end(display_time, blend_mode, &[])
                    .context("Failed to end frame")?;
                return Ok(());
            }
        };

        let swapchains = self.swapchains.as_mut().context("Swapchains already destroyed")?;
        let scene = self.scene.as_ref().context("Scene already destroyed")?;
        if views.len() > swapchains.colour.len() {
            anyhow::bail!(
                "Runtime located {} views but {} swapchains exist",
                views.len(),
                swapchains.colour.len()
            );
        }

        let clear_colour = self
            .config
            .clear_colour(blend_mode == xr::EnvironmentBlendMode::OPAQUE);

        for (index, view) in views.iter().enumerate() {
            let colour = &mut swapchains.colour[index];
            let depth = &mut swapchains.depth[index];

            let colour_view = colour.acquire()?;
            let depth_view = depth.acquire()?;

            scene.render_view(
                &mut self.api,
                &ViewTarget {
                    index,
                    colour_view,
                    depth_view,
                    width: colour.width,
                    height: colour.height,
                    pose: view.pose,
                    fov: view.fov,
                },
                clear_colour,
            )?;

            colour.release()?;
            depth.release()?;
        }

        let projection_views: Vec<_> = views
            .iter()
            .zip(&swapchains.colour)
            .map(|(view, colour)| {
                xr::CompositionLayerProjectionView::new()
                    .pose(view.pose)
                    .fov(view.fov)
                    .sub_image(
                        xr::SwapchainSubImage::new()
                            .swapchain(&colour.swapchain)
                            .image_array_index(0)
                            .image_rect(xr::Rect2Di {
                                offset: xr::Offset2Di { x: 0, y: 0 },
                                extent: xr::Extent2Di {
                                    width: colour.width as i32,
                                    height: colour.height as i32,
                                },
                            }),
                    )
            })
            .collect();

        let layer = xr::CompositionLayerProjection::new()
            .layer_flags(
                xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA
                    | xr::CompositionLayerFlags::CORRECT_CHROMATIC_ABERRATION,
            )
            .space(&self.session.space)
            .views(&projection_views);

        self.session
            .frame_stream
            .end(display_time, blend_mode, &[&layer])
            .context("Failed to end frame")?;

        self.frame_count += 1;
        Ok(())
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    fn shutdown(mut self) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        log::info!(
            "Rendered {} frames in {:.1}s ({:.1} fps)",
            self.frame_count,
            elapsed,
            self.frame_count as f64 / elapsed.max(f64::EPSILON)
        );

        if let Some(scene) = self.scene.take() {
            scene.destroy(&mut self.api)?;
        }
        if let Some(swapchains) = self.swapchains.take() {
            swapchains.destroy(&mut self.api)?;
        }
        log::info!("Shutting down {}", self.api.api_type());
        Ok(())
    }
}
