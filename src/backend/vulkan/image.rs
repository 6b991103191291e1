// Images, image views and samplers
//
// Swapchain images are owned by the OpenXR runtime: they have no allocation
// and carry the layout the runtime hands them over in, which must be
// restored before the image is released.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::device::keep_or_release;
use super::{convert, VulkanDevice};
use crate::backend::types::{ImageCreateInfo, ImageViewCreateInfo, SamplerCreateInfo};

pub struct VulkanImage {
    pub image: vk::Image,
    /// None for runtime-owned swapchain images
    pub allocation: Option<Allocation>,
    pub info: ImageCreateInfo,
    pub layout: vk::ImageLayout,
    /// Layout the runtime expects back at release
    pub swapchain_layout: Option<vk::ImageLayout>,
}

impl VulkanImage {
    pub fn new(device: &VulkanDevice, info: &ImageCreateInfo) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .flags(convert::image_create_flags(info))
            .image_type(convert::image_type(info.dimension))
            .format(convert::format(info.format))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth.max(1),
            })
            .mip_levels(info.mip_levels.max(1))
            .array_layers(info.array_layers.max(1))
            .samples(convert::sample_count(info.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(info))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind image memory");
        let allocation = keep_or_release(bound, allocation, |allocation| {
            unsafe { device.device.destroy_image(image, None) };
            if let Err(e) = device.free(allocation) {
                log::error!("Failed to free image memory after error: {:#}", e);
            }
        })?;

        Ok(Self {
            image,
            allocation: Some(allocation),
            info: *info,
            layout: vk::ImageLayout::UNDEFINED,
            swapchain_layout: None,
        })
    }

    /// Wrap a runtime-owned swapchain image
    pub fn from_swapchain(image: vk::Image, info: &ImageCreateInfo) -> Self {
        // After xrWaitSwapchainImage the runtime guarantees the attachment layout
        let layout = if info.depth_attachment {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        Self {
            image,
            allocation: None,
            info: *info,
            layout,
            swapchain_layout: Some(layout),
        }
    }

    /// Aspects covered by layout transitions of the whole image
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        let format = convert::format(self.info.format);
        if !(self.info.depth_attachment || convert::is_depth_format(format)) {
            return vk::ImageAspectFlags::COLOR;
        }
        match format {
            vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::DEPTH,
        }
    }

    pub fn is_swapchain(&self) -> bool {
        self.swapchain_layout.is_some()
    }

    pub fn destroy(self, device: &VulkanDevice) -> Result<()> {
        match self.allocation {
            Some(allocation) => {
                unsafe { device.device.destroy_image(self.image, None) };
                device.free(allocation)
            }
            None => anyhow::bail!("Swapchain images are owned by the OpenXR runtime"),
        }
    }
}

#[derive(Clone, Copy)]
pub struct VulkanImageView {
    pub view: vk::ImageView,
    pub info: ImageViewCreateInfo,
}

pub fn subresource_range(info: &ImageViewCreateInfo) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: convert::aspect(info.aspect),
        base_mip_level: info.base_mip_level,
        level_count: info.level_count,
        base_array_layer: info.base_array_layer,
        layer_count: info.layer_count,
    }
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    info: &ImageViewCreateInfo,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(convert::view_type(info.view))
        .format(convert::format(info.format))
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(subresource_range(info));

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

pub fn create_sampler(device: &VulkanDevice, info: &SamplerCreateInfo) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(convert::filter(info.mag_filter))
        .min_filter(convert::filter(info.min_filter))
        .mipmap_mode(convert::mipmap_mode(info.mipmap_mode))
        .address_mode_u(convert::address_mode(info.address_mode_s))
        .address_mode_v(convert::address_mode(info.address_mode_t))
        .address_mode_w(convert::address_mode(info.address_mode_r))
        .mip_lod_bias(info.mip_lod_bias)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .compare_enable(info.compare_enable)
        .compare_op(convert::compare_op(info.compare_op))
        .min_lod(info.min_lod)
        .max_lod(info.max_lod)
        .border_color(convert::border_colour(info.border_colour))
        .unnormalized_coordinates(false);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create sampler")
}

/// Full-subresource barrier moving `image` from `old` to `new`
pub fn transition_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}
