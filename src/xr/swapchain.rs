// Per-view colour and depth swapchains
//
// Every swapchain image is registered with the backend and gets one view
// (render target for colour, depth stencil for depth) created up front.

use anyhow::{Context, Result};
use openxr as xr;

use super::XrContext;
use crate::backend::{
    GraphicsApi, ImageAspect, ImageCreateInfo, ImageHandle, ImageViewCreateInfo, ImageViewHandle,
    ImageViewKind, ImageViewType,
};

/// Clears outside a render pass (Vulkan `vkCmdClear*Image`) need TRANSFER_DST
pub fn swapchain_usage(depth: bool) -> xr::SwapchainUsageFlags {
    let attachment = if depth {
        xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT
    } else {
        xr::SwapchainUsageFlags::COLOR_ATTACHMENT
    };
    attachment | xr::SwapchainUsageFlags::SAMPLED | xr::SwapchainUsageFlags::TRANSFER_DST
}

pub struct ViewSwapchain<G: xr::Graphics> {
    pub swapchain: xr::Swapchain<G>,
    pub format: i64,
    pub width: u32,
    pub height: u32,
    images: Vec<ImageHandle>,
    views: Vec<ImageViewHandle>,
}

impl<G: xr::Graphics> ViewSwapchain<G> {
    fn new<B>(
        api: &mut B,
        session: &xr::Session<G>,
        view: &xr::ViewConfigurationView,
        format: i64,
        depth: bool,
    ) -> Result<Self>
    where
        B: GraphicsApi<Xr = G>,
    {
        let width = view.recommended_image_rect_width;
        let height = view.recommended_image_rect_height;
        let sample_count = view.recommended_swapchain_sample_count;
        let usage_flags = swapchain_usage(depth);

        let swapchain = session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags,
                format: G::raise_format(format),
                sample_count,
                width,
                height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .with_context(|| {
                format!(
                    "Failed to create {} swapchain {}x{}",
                    if depth { "depth" } else { "colour" },
                    width,
                    height
                )
            })?;

        let raw_images = swapchain
            .enumerate_images()
            .context("Failed to enumerate swapchain images")?;
        let image_info = ImageCreateInfo {
            dimension: 2,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            sample_count,
            format,
            cubemap: false,
            colour_attachment: !depth,
            depth_attachment: depth,
            sampled: true,
        };
        let images = api.register_swapchain_images(raw_images, &image_info)?;

        let (kind, aspect) = if depth {
            (ImageViewKind::Dsv, ImageAspect::DEPTH)
        } else {
            (ImageViewKind::Rtv, ImageAspect::COLOUR)
        };
        let views = images
            .iter()
            .map(|&image| {
                api.create_image_view(&ImageViewCreateInfo {
                    image,
                    kind,
                    view: ImageViewType::Type2D,
                    format,
                    aspect,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Created {} swapchain: {}x{}, format {}, {} images",
            if depth { "depth" } else { "colour" },
            width,
            height,
            format,
            images.len()
        );

        Ok(Self {
            swapchain,
            format,
            width,
            height,
            images,
            views,
        })
    }

    /// Acquire and wait for the next image; returns its view
    pub fn acquire(&mut self) -> Result<ImageViewHandle> {
        let index = self
            .swapchain
            .acquire_image()
            .context("Failed to acquire swapchain image")?;
        self.swapchain
            .wait_image(xr::Duration::INFINITE)
            .context("Failed to wait for swapchain image")?;
        self.views
            .get(index as usize)
            .copied()
            .with_context(|| format!("Runtime returned image index {} out of range", index))
    }

    pub fn release(&mut self) -> Result<()> {
        self.swapchain
            .release_image()
            .context("Failed to release swapchain image")
    }

    fn destroy<B>(self, api: &mut B) -> Result<()>
    where
        B: GraphicsApi<Xr = G>,
    {
        for view in self.views {
            api.destroy_image_view(view)?;
        }
        api.release_swapchain_images(&self.images)
    }
}

pub struct SwapchainSet<G: xr::Graphics> {
    pub colour: Vec<ViewSwapchain<G>>,
    pub depth: Vec<ViewSwapchain<G>>,
}

impl<G: xr::Graphics> SwapchainSet<G> {
    pub fn new<B>(api: &mut B, xr_ctx: &XrContext, session: &xr::Session<G>) -> Result<Self>
    where
        B: GraphicsApi<Xr = G>,
    {
        let runtime_formats: Vec<i64> = session
            .enumerate_swapchain_formats()
            .context("Failed to enumerate swapchain formats")?
            .into_iter()
            .map(G::lower_format)
            .collect();

        let colour_format = api.select_swapchain_format(&runtime_formats)?;
        let depth_format = api.depth_format();
        if !runtime_formats.contains(&depth_format) {
            anyhow::bail!(
                "Runtime does not offer depth format {} (offers {:?})",
                depth_format,
                runtime_formats
            );
        }
        log::info!(
            "Swapchain formats: colour {}, depth {}",
            colour_format,
            depth_format
        );

        let mut colour = Vec::with_capacity(xr_ctx.views.len());
        let mut depth = Vec::with_capacity(xr_ctx.views.len());
        for view in &xr_ctx.views {
            colour.push(ViewSwapchain::new(api, session, view, colour_format, false)?);
            depth.push(ViewSwapchain::new(api, session, view, depth_format, true)?);
        }

        Ok(Self { colour, depth })
    }

    pub fn colour_format(&self) -> Option<i64> {
        self.colour.first().map(|s| s.format)
    }

    pub fn depth_format(&self) -> Option<i64> {
        self.depth.first().map(|s| s.format)
    }

    /// Destroy the backend views and forget the images; the swapchains drop afterwards
    pub fn destroy<B>(self, api: &mut B) -> Result<()>
    where
        B: GraphicsApi<Xr = G>,
    {
        for swapchain in self.colour.into_iter().chain(self.depth) {
            swapchain.destroy(api)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_swapchains_can_be_cleared_and_sampled() {
        let usage = swapchain_usage(false);
        assert!(usage.contains(xr::SwapchainUsageFlags::COLOR_ATTACHMENT));
        assert!(usage.contains(xr::SwapchainUsageFlags::TRANSFER_DST));
        assert!(usage.contains(xr::SwapchainUsageFlags::SAMPLED));
        assert!(!usage.contains(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    fn depth_swapchains_can_be_cleared_and_sampled() {
        let usage = swapchain_usage(true);
        assert!(usage.contains(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(usage.contains(xr::SwapchainUsageFlags::TRANSFER_DST));
        assert!(usage.contains(xr::SwapchainUsageFlags::SAMPLED));
        assert!(!usage.contains(xr::SwapchainUsageFlags::COLOR_ATTACHMENT));
    }
}
