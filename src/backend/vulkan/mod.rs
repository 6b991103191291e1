// Vulkan backend
//
// Instance and device are created by the OpenXR runtime (XR_KHR_vulkan_enable2).
// Each begin/end_rendering bracket records one command buffer using dynamic
// rendering; image layouts are tracked per image so clears and attachment
// binds can insert the barriers they need.

pub mod buffer;
pub mod convert;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use device::VulkanDevice;

use anyhow::{Context, Result};
use ash::vk::{self, Handle as _};
use openxr as xr;
use std::sync::Arc;

use self::buffer::VulkanBuffer;
use self::image::{VulkanImage, VulkanImageView};
use self::pipeline::VulkanPipeline;
use self::shader::VulkanShader;
use self::sync::CommandContext;
use super::handles::ResourceTable;
use super::types::*;
use super::{
    BufferHandle, GraphicsApi, GraphicsApiType, ImageHandle, ImageViewHandle, PipelineHandle,
    SamplerHandle, ShaderHandle,
};

const MAX_DESCRIPTOR_SETS: u32 = 1024;

pub struct VulkanApi {
    device: Arc<VulkanDevice>,
    commands: CommandContext,
    descriptor_pool: vk::DescriptorPool,

    images: ResourceTable<ImageHandle, VulkanImage>,
    image_views: ResourceTable<ImageViewHandle, VulkanImageView>,
    samplers: ResourceTable<SamplerHandle, vk::Sampler>,
    buffers: ResourceTable<BufferHandle, VulkanBuffer>,
    shaders: ResourceTable<ShaderHandle, VulkanShader>,
    pipelines: ResourceTable<PipelineHandle, VulkanPipeline>,

    // Recording state
    recording: bool,
    rendering: bool,
    current_pipeline: Option<PipelineHandle>,
    pending_descriptors: Vec<DescriptorInfo>,
}

impl VulkanApi {
    pub fn new(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<Self> {
        let device = VulkanDevice::new(xr_instance, system, app_name, enable_validation)?;
        let commands = CommandContext::new(&device)?;
        let descriptor_pool = Self::create_descriptor_pool(&device)?;

        Ok(Self {
            device,
            commands,
            descriptor_pool,
            images: ResourceTable::new(),
            image_views: ResourceTable::new(),
            samplers: ResourceTable::new(),
            buffers: ResourceTable::new(),
            shaders: ResourceTable::new(),
            pipelines: ResourceTable::new(),
            recording: false,
            rendering: false,
            current_pipeline: None,
            pending_descriptors: Vec::new(),
        })
    }

    fn create_descriptor_pool(device: &VulkanDevice) -> Result<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS / 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: MAX_DESCRIPTOR_SETS / 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_DESCRIPTOR_SETS / 16,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: MAX_DESCRIPTOR_SETS / 4,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);

        unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")
    }

    fn cmd(&self) -> Result<vk::CommandBuffer> {
        if !self.recording {
            anyhow::bail!("Vulkan command recorded outside begin_rendering/end_rendering");
        }
        Ok(self.commands.buffer)
    }

    fn transition_image(&mut self, handle: ImageHandle, layout: vk::ImageLayout) -> Result<()> {
        let cmd = self.cmd()?;
        let image = self.images.get_mut(handle)?;
        if image.layout != layout {
            image::transition_layout(
                &self.device.device,
                cmd,
                image.image,
                image.aspect(),
                image.layout,
                layout,
            );
            image.layout = layout;
        }
        Ok(())
    }

    /// Close the dynamic rendering scope so transfer commands can be recorded
    fn end_dynamic_rendering(&mut self) -> Result<()> {
        if self.rendering {
            let cmd = self.cmd()?;
            unsafe { self.device.device.cmd_end_rendering(cmd) };
            self.rendering = false;
        }
        Ok(())
    }

    fn attachment_info(
        &self,
        view: ImageViewHandle,
        layout: vk::ImageLayout,
    ) -> Result<(vk::RenderingAttachmentInfo, vk::Extent2D)> {
        let view = self.image_views.get(view)?;
        let image = self.images.get(view.info.image)?;
        let info = vk::RenderingAttachmentInfo::builder()
            .image_view(view.view)
            .image_layout(layout)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();
        let extent = vk::Extent2D {
            width: image.info.width,
            height: image.info.height,
        };
        Ok((info, extent))
    }
}

impl GraphicsApi for VulkanApi {
    type Xr = xr::Vulkan;

    fn api_type(&self) -> GraphicsApiType {
        GraphicsApiType::Vulkan
    }

    fn graphics_binding(&self) -> xr::vulkan::SessionCreateInfo {
        xr::vulkan::SessionCreateInfo {
            instance: self.device.instance.handle().as_raw() as _,
            physical_device: self.device.physical_device.as_raw() as _,
            device: self.device.device.handle().as_raw() as _,
            queue_family_index: self.device.graphics_queue_family,
            queue_index: 0,
        }
    }

    fn depth_format(&self) -> i64 {
        convert::DEPTH_FORMAT
    }

    fn supported_swapchain_formats(&self) -> &'static [i64] {
        &convert::SUPPORTED_SWAPCHAIN_FORMATS
    }

    fn register_swapchain_images(
        &mut self,
        images: Vec<u64>,
        info: &ImageCreateInfo,
    ) -> Result<Vec<ImageHandle>> {
        images
            .into_iter()
            .map(|raw| {
                let image = vk::Image::from_raw(raw);
                self.images.insert(
                    ImageHandle::from_raw(image.as_raw()),
                    VulkanImage::from_swapchain(image, info),
                )
            })
            .collect()
    }

    fn release_swapchain_images(&mut self, images: &[ImageHandle]) -> Result<()> {
        for &handle in images {
            if !self.images.get(handle)?.is_swapchain() {
                anyhow::bail!("{:?} is not a swapchain image", handle);
            }
            self.images.remove(handle)?;
        }
        Ok(())
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let image = VulkanImage::new(&self.device, info)?;
        self.images
            .insert(ImageHandle::from_raw(image.image.as_raw()), image)
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        if self.images.get(image)?.is_swapchain() {
            anyhow::bail!("Swapchain image {:?} is owned by the OpenXR runtime", image);
        }
        self.images.remove(image)?.destroy(&self.device)
    }

    fn create_image_view(&mut self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let image = self.images.get(info.image)?.image;
        let view = image::create_image_view(&self.device, image, info)?;
        self.image_views.insert(
            ImageViewHandle::from_raw(view.as_raw()),
            VulkanImageView { view, info: *info },
        )
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) -> Result<()> {
        let view = self.image_views.remove(view)?;
        unsafe { self.device.device.destroy_image_view(view.view, None) };
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> Result<SamplerHandle> {
        let sampler = image::create_sampler(&self.device, info)?;
        self.samplers
            .insert(SamplerHandle::from_raw(sampler.as_raw()), sampler)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        let sampler = self.samplers.remove(sampler)?;
        unsafe { self.device.device.destroy_sampler(sampler, None) };
        Ok(())
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let buffer = VulkanBuffer::new(&self.device, info)?;
        self.buffers
            .insert(BufferHandle::from_raw(buffer.buffer.as_raw()), buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffers.remove(buffer)?.destroy(&self.device)
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo) -> Result<ShaderHandle> {
        let module = shader::create_shader_module(&self.device, &info.source)?;
        self.shaders.insert(
            ShaderHandle::from_raw(module.as_raw()),
            VulkanShader {
                module,
                stage: info.stage,
            },
        )
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        let shader = self.shaders.remove(shader)?;
        unsafe { self.device.device.destroy_shader_module(shader.module, None) };
        Ok(())
    }

    fn create_pipeline(&mut self, info: &PipelineCreateInfo) -> Result<PipelineHandle> {
        let pipeline = VulkanPipeline::new(&self.device, info, &self.shaders)?;
        self.pipelines
            .insert(PipelineHandle::from_raw(pipeline.pipeline.as_raw()), pipeline)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if self.current_pipeline == Some(pipeline) {
            self.current_pipeline = None;
        }
        self.pipelines.remove(pipeline)?.destroy(&self.device);
        Ok(())
    }

    fn begin_rendering(&mut self) -> Result<()> {
        if self.recording {
            anyhow::bail!("begin_rendering called twice without end_rendering");
        }
        unsafe {
            self.device
                .device
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .context("Failed to reset descriptor pool")?;
        }
        self.commands.begin(&self.device.device)?;
        self.recording = true;
        self.current_pipeline = None;
        self.pending_descriptors.clear();
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        let cmd = self.cmd()?;
        self.end_dynamic_rendering()?;

        // Hand swapchain images back in the layout the runtime expects
        for image in self.images.values_mut() {
            if let Some(layout) = image.swapchain_layout {
                if image.layout != layout {
                    image::transition_layout(
                        &self.device.device,
                        cmd,
                        image.image,
                        image.aspect(),
                        image.layout,
                        layout,
                    );
                    image.layout = layout;
                }
            }
        }

        self.recording = false;
        self.commands
            .submit_and_wait(&self.device.device, self.device.graphics_queue)
    }

    fn set_buffer_data(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.buffers.get_mut(buffer)?.write(offset, data)
    }

    fn clear_colour(&mut self, view: ImageViewHandle, colour: [f32; 4]) -> Result<()> {
        let cmd = self.cmd()?;
        self.end_dynamic_rendering()?;

        let view = *self.image_views.get(view)?;
        self.transition_image(view.info.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let image = self.images.get(view.info.image)?.image;

        let clear = vk::ClearColorValue { float32: colour };
        unsafe {
            self.device.device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[image::subresource_range(&view.info)],
            );
        }
        self.transition_image(view.info.image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
    }

    fn clear_depth(&mut self, view: ImageViewHandle, depth: f32) -> Result<()> {
        let cmd = self.cmd()?;
        self.end_dynamic_rendering()?;

        let view = *self.image_views.get(view)?;
        self.transition_image(view.info.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let image = self.images.get(view.info.image)?.image;

        let clear = vk::ClearDepthStencilValue { depth, stencil: 0 };
        unsafe {
            self.device.device.cmd_clear_depth_stencil_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[image::subresource_range(&view.info)],
            );
        }
        self.transition_image(
            view.info.image,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
    }

    fn set_render_attachments(
        &mut self,
        colour_views: &[ImageViewHandle],
        depth_view: Option<ImageViewHandle>,
    ) -> Result<()> {
        let cmd = self.cmd()?;
        self.end_dynamic_rendering()?;

        for &view in colour_views {
            let image = self.image_views.get(view)?.info.image;
            self.transition_image(image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
        }
        if let Some(view) = depth_view {
            let image = self.image_views.get(view)?.info.image;
            self.transition_image(image, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
        }

        let mut extent = None;
        let mut colour_infos = Vec::with_capacity(colour_views.len());
        for &view in colour_views {
            let (info, size) = self.attachment_info(view, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
            colour_infos.push(info);
            extent.get_or_insert(size);
        }
        let depth_info = match depth_view {
            Some(view) => {
                let (info, size) =
                    self.attachment_info(view, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
                extent.get_or_insert(size);
                Some(info)
            }
            None => None,
        };
        let extent = extent.context("set_render_attachments needs at least one attachment")?;

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&colour_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        unsafe { self.device.device.cmd_begin_rendering(cmd, &rendering_info) };
        self.rendering = true;
        Ok(())
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()> {
        let cmd = self.cmd()?;
        let viewports: Vec<vk::Viewport> = viewports
            .iter()
            .map(|v| vk::Viewport {
                x: v.x,
                y: v.y,
                width: v.width,
                height: v.height,
                min_depth: v.min_depth,
                max_depth: v.max_depth,
            })
            .collect();
        unsafe { self.device.device.cmd_set_viewport(cmd, 0, &viewports) };
        Ok(())
    }

    fn set_scissors(&mut self, scissors: &[Rect2D]) -> Result<()> {
        let cmd = self.cmd()?;
        let scissors: Vec<vk::Rect2D> = scissors
            .iter()
            .map(|s| vk::Rect2D {
                offset: vk::Offset2D {
                    x: s.offset.x,
                    y: s.offset.y,
                },
                extent: vk::Extent2D {
                    width: s.extent.width,
                    height: s.extent.height,
                },
            })
            .collect();
        unsafe { self.device.device.cmd_set_scissor(cmd, 0, &scissors) };
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let cmd = self.cmd()?;
        let vk_pipeline = self.pipelines.get(pipeline)?.pipeline;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, vk_pipeline)
        };
        self.current_pipeline = Some(pipeline);
        self.pending_descriptors.clear();
        Ok(())
    }

    fn set_descriptor(&mut self, info: &DescriptorInfo) -> Result<()> {
        self.pending_descriptors
            .retain(|d| d.binding_index != info.binding_index);
        self.pending_descriptors.push(*info);
        Ok(())
    }

    fn update_descriptors(&mut self) -> Result<()> {
        let cmd = self.cmd()?;
        let pipeline = self
            .current_pipeline
            .context("update_descriptors called with no pipeline bound")?;
        let (set_layout, pipeline_layout) = {
            let p = self.pipelines.get(pipeline)?;
            (p.set_layout, p.layout)
        };

        // Sampled and storage images must already be readable
        let pending = std::mem::take(&mut self.pending_descriptors);
        for d in &pending {
            if let DescriptorResource::Image(view) = d.resource {
                let layout = if d.read_write {
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                };
                let image = self.image_views.get(view)?.info.image;
                if self.images.get(image)?.layout != layout {
                    if self.rendering {
                        anyhow::bail!(
                            "{:?} must be bound before set_render_attachments to change layout",
                            view
                        );
                    }
                    self.transition_image(image, layout)?;
                }
            }
        }

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];

        let mut buffer_infos = Vec::with_capacity(pending.len());
        let mut image_infos = Vec::with_capacity(pending.len());
        for d in &pending {
            match d.resource {
                DescriptorResource::Buffer(handle) => {
                    let buffer = self.buffers.get(handle)?;
                    let (offset, size) = d.buffer_range(buffer.info.size)?;
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buffer.buffer,
                        offset: offset as vk::DeviceSize,
                        range: size as vk::DeviceSize,
                    });
                }
                DescriptorResource::Image(handle) => {
                    let view = self.image_views.get(handle)?;
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view.view,
                        image_layout: if d.read_write {
                            vk::ImageLayout::GENERAL
                        } else {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        },
                    });
                }
                DescriptorResource::Sampler(handle) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: *self.samplers.get(handle)?,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                }
            }
        }

        let (mut next_buffer, mut next_image) = (0, 0);
        let writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .map(|d| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(d.binding_index)
                    .descriptor_type(convert::descriptor_type(d));
                match d.resource {
                    DescriptorResource::Buffer(_) => {
                        next_buffer += 1;
                        write
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1]))
                            .build()
                    }
                    _ => {
                        next_image += 1;
                        write
                            .image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                            .build()
                    }
                }
            })
            .collect();

        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[]);
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    fn set_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        let cmd = self.cmd()?;
        let vk_buffers = buffers
            .iter()
            .map(|&b| Ok(self.buffers.get(b)?.buffer))
            .collect::<Result<Vec<_>>>()?;
        let offsets = vec![0; vk_buffers.len()];
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &vk_buffers, &offsets)
        };
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let cmd = self.cmd()?;
        let buffer = self.buffers.get(buffer)?;
        unsafe {
            self.device.device.cmd_bind_index_buffer(
                cmd,
                buffer.buffer,
                0,
                convert::index_type(&buffer.info),
            )
        };
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let cmd = self.cmd()?;
        unsafe {
            self.device.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        let cmd = self.cmd()?;
        unsafe {
            self.device
                .device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        };
        Ok(())
    }
}

impl Drop for VulkanApi {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan resources...");
        let _ = self.device.wait_idle();

        let device = &self.device;
        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(device);
        }
        for (_, shader) in self.shaders.drain() {
            unsafe { device.device.destroy_shader_module(shader.module, None) };
        }
        for (_, view) in self.image_views.drain() {
            unsafe { device.device.destroy_image_view(view.view, None) };
        }
        for (_, sampler) in self.samplers.drain() {
            unsafe { device.device.destroy_sampler(sampler, None) };
        }
        for (_, buffer) in self.buffers.drain() {
            if let Err(e) = buffer.destroy(device) {
                log::warn!("{:#}", e);
            }
        }
        for (_, image) in self.images.drain() {
            if !image.is_swapchain() {
                if let Err(e) = image.destroy(device) {
                    log::warn!("{:#}", e);
                }
            }
        }

        unsafe { device.device.destroy_descriptor_pool(self.descriptor_pool, None) };
        self.commands.destroy(&device.device);
    }
}
