// OpenGL and OpenGL ES backends
//
// Both run on a GL context the host created and made current before the
// backend is constructed; `glow` provides the function table. The
// platform-specific parts (OpenXR graphics type, session binding, version
// requirements, formats) sit behind `GlPlatform`, everything else is shared.

pub mod convert;
pub mod opengl;
#[cfg(target_os = "android")]
pub mod opengl_es;

pub use opengl::{DesktopGl, GlContextBinding, OpenGLApi};
#[cfg(target_os = "android")]
pub use opengl_es::{EglBinding, GlEs, OpenGLESApi};

use anyhow::{Context, Result};
use glow::HasContext;
use openxr as xr;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::backend::handles::ResourceTable;
use crate::backend::types::*;
use crate::backend::{
    BufferHandle, GraphicsApi, GraphicsApiType, ImageHandle, ImageViewHandle, PipelineHandle,
    SamplerHandle, ShaderHandle,
};

/// What differs between desktop GL and GLES
pub trait GlPlatform {
    type Xr: xr::Graphics<SwapchainImage = u32>;

    const API: GraphicsApiType;

    /// (min, max) context versions the runtime accepts, as (major, minor)
    fn version_requirements(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
    ) -> Result<((u32, u32), (u32, u32))>;

    fn graphics_binding(&self) -> <Self::Xr as xr::Graphics>::SessionCreateInfo;

    fn supported_swapchain_formats() -> &'static [i64];
}

struct GlImage {
    texture: glow::NativeTexture,
    target: u32,
    swapchain: bool,
}

struct GlView {
    /// Render target and depth views own a framebuffer used for clears
    framebuffer: Option<glow::NativeFramebuffer>,
    texture: glow::NativeTexture,
    target: u32,
    attachment: u32,
    info: ImageViewCreateInfo,
}

struct GlBuffer {
    buffer: glow::NativeBuffer,
    info: BufferCreateInfo,
}

struct GlPipeline {
    program: glow::NativeProgram,
    info: PipelineCreateInfo,
}

pub struct GlApi<P: GlPlatform> {
    gl: Arc<glow::Context>,
    platform: P,
    /// Context (major, minor)
    version: (u32, u32),

    images: ResourceTable<ImageHandle, GlImage>,
    image_views: ResourceTable<ImageViewHandle, GlView>,
    samplers: ResourceTable<SamplerHandle, glow::NativeSampler>,
    buffers: ResourceTable<BufferHandle, GlBuffer>,
    shaders: ResourceTable<ShaderHandle, glow::NativeShader>,
    pipelines: ResourceTable<PipelineHandle, GlPipeline>,

    /// Framebuffer that set_render_attachments assembles from views
    render_framebuffer: glow::NativeFramebuffer,
    vertex_array: Option<glow::NativeVertexArray>,
    recording: bool,
    current_pipeline: Option<PipelineHandle>,
    index_buffer_type: u32,
    pending_descriptors: Vec<DescriptorInfo>,
}

fn gl_err(e: String) -> anyhow::Error {
    anyhow::anyhow!(e)
}

fn name(raw: u64) -> Result<NonZeroU32> {
    NonZeroU32::new(raw as u32).context("GL object name 0 is not a valid handle")
}

impl<P: GlPlatform> GlApi<P> {
    /// `gl` must wrap the context the platform binding refers to, current on this thread
    pub fn new(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        gl: Arc<glow::Context>,
        platform: P,
    ) -> Result<Self> {
        let (min, max) = P::version_requirements(xr_instance, system)?;
        let version = gl.version();
        let actual = (version.major, version.minor);
        log::info!(
            "{} context version {}.{} (runtime accepts {}.{} to {}.{})",
            P::API,
            actual.0,
            actual.1,
            min.0,
            min.1,
            max.0,
            max.1
        );
        if !convert::version_supported(actual, min, max) {
            anyhow::bail!(
                "{} {}.{} does not meet the runtime's required range {}.{} to {}.{}",
                P::API,
                actual.0,
                actual.1,
                min.0,
                min.1,
                max.0,
                max.1
            );
        }

        let render_framebuffer = unsafe { gl.create_framebuffer() }.map_err(gl_err)?;

        Ok(Self {
            gl,
            platform,
            version: actual,
            images: ResourceTable::new(),
            image_views: ResourceTable::new(),
            samplers: ResourceTable::new(),
            buffers: ResourceTable::new(),
            shaders: ResourceTable::new(),
            pipelines: ResourceTable::new(),
            render_framebuffer,
            vertex_array: None,
            recording: false,
            current_pipeline: None,
            index_buffer_type: glow::UNSIGNED_SHORT,
            pending_descriptors: Vec::new(),
        })
    }

    fn is_desktop() -> bool {
        P::API == GraphicsApiType::OpenGL
    }

    fn check_recording(&self) -> Result<()> {
        if !self.recording {
            anyhow::bail!("GL command recorded outside begin_rendering/end_rendering");
        }
        Ok(())
    }

    fn current_pipeline(&self) -> Result<&GlPipeline> {
        let handle = self.current_pipeline.context("No pipeline is bound")?;
        self.pipelines.get(handle)
    }

    /// Attach a view's texture to `attachment` of the framebuffer bound to FRAMEBUFFER
    unsafe fn attach(&self, attachment: u32, view: &GlView) {
        let level = view.info.base_mip_level as i32;
        match view.info.view {
            ImageViewType::Type2D => self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                attachment,
                view.target,
                Some(view.texture),
                level,
            ),
            _ => self.gl.framebuffer_texture_layer(
                glow::FRAMEBUFFER,
                attachment,
                Some(view.texture),
                level,
                view.info.base_array_layer as i32,
            ),
        }
    }

    fn check_framebuffer(&self, what: &str) -> Result<()> {
        let status = unsafe { self.gl.check_framebuffer_status(glow::FRAMEBUFFER) };
        if status != glow::FRAMEBUFFER_COMPLETE {
            anyhow::bail!("{} framebuffer is incomplete (status {:#x})", what, status);
        }
        Ok(())
    }

    /// Bind a view's own framebuffer, run `clear`, unbind
    fn clear_view<F>(&self, view: ImageViewHandle, expect_depth: bool, clear: F) -> Result<()>
    where
        F: FnOnce(&glow::Context),
    {
        let v = self.image_views.get(view)?;
        let is_depth = v.attachment != glow::COLOR_ATTACHMENT0;
        if is_depth != expect_depth {
            anyhow::bail!(
                "{:?} is not a {} view",
                view,
                if expect_depth { "depth" } else { "colour" }
            );
        }
        let framebuffer = v
            .framebuffer
            .with_context(|| format!("{:?} is not an attachment view", view))?;
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            self.gl.disable(glow::SCISSOR_TEST);
            clear(&*self.gl);
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        Ok(())
    }

    unsafe fn apply_pipeline_state(&self, info: &PipelineCreateInfo) {
        let gl = &self.gl;
        let toggle = |cap: u32, on: bool| {
            if on {
                gl.enable(cap)
            } else {
                gl.disable(cap)
            }
        };

        toggle(
            glow::PRIMITIVE_RESTART_FIXED_INDEX,
            info.input_assembly_state.primitive_restart_enable,
        );

        let rs = &info.rasterisation_state;
        if Self::is_desktop() {
            toggle(glow::DEPTH_CLAMP, rs.depth_clamp_enable);
            gl.polygon_mode(glow::FRONT_AND_BACK, convert::polygon_mode(rs.polygon_mode));
        }
        toggle(glow::RASTERIZER_DISCARD, rs.rasteriser_discard_enable);
        match convert::cull_face(rs.cull_mode) {
            Some(face) => {
                gl.enable(glow::CULL_FACE);
                gl.cull_face(face);
            }
            None => gl.disable(glow::CULL_FACE),
        }
        gl.front_face(convert::front_face(rs.front_face));
        let offset_mode = convert::polygon_offset_mode(rs.polygon_mode);
        toggle(offset_mode, rs.depth_bias_enable);
        if rs.depth_bias_enable {
            gl.polygon_offset(rs.depth_bias_slope_factor, rs.depth_bias_constant_factor);
        }
        gl.line_width(rs.line_width);

        let ms = &info.multisample_state;
        if Self::is_desktop() {
            toggle(glow::MULTISAMPLE, ms.rasterisation_samples > 1);
            toggle(glow::SAMPLE_ALPHA_TO_ONE, ms.alpha_to_one_enable);
        }
        if convert::sample_shading_available(Self::is_desktop(), self.version) {
            toggle(glow::SAMPLE_SHADING, ms.sample_shading_enable);
        }
        toggle(glow::SAMPLE_ALPHA_TO_COVERAGE, ms.alpha_to_coverage_enable);

        let ds = &info.depth_stencil_state;
        toggle(glow::DEPTH_TEST, ds.depth_test_enable);
        gl.depth_mask(ds.depth_write_enable);
        gl.depth_func(convert::compare_op(ds.depth_compare_op));
        toggle(glow::STENCIL_TEST, ds.stencil_test_enable);
        for (face, s) in [(glow::FRONT, &ds.front), (glow::BACK, &ds.back)] {
            gl.stencil_op_separate(
                face,
                convert::stencil_op(s.fail_op),
                convert::stencil_op(s.depth_fail_op),
                convert::stencil_op(s.pass_op),
            );
            gl.stencil_func_separate(
                face,
                convert::compare_op(s.compare_op),
                s.reference as i32,
                s.compare_mask,
            );
            gl.stencil_mask_separate(face, s.write_mask);
        }

        let cb = &info.colour_blend_state;
        for (i, a) in cb.attachments.iter().enumerate() {
            let i = i as u32;
            if a.blend_enable {
                gl.enable_draw_buffer(glow::BLEND, i);
            } else {
                gl.disable_draw_buffer(glow::BLEND, i);
            }
            gl.blend_equation_separate_draw_buffer(
                i,
                convert::blend_op(a.colour_blend_op),
                convert::blend_op(a.alpha_blend_op),
            );
            gl.blend_func_separate_draw_buffer(
                i,
                convert::blend_factor(a.src_colour_blend_factor),
                convert::blend_factor(a.dst_colour_blend_factor),
                convert::blend_factor(a.src_alpha_blend_factor),
                convert::blend_factor(a.dst_alpha_blend_factor),
            );
            let mask = a.colour_write_mask;
            gl.color_mask_draw_buffer(
                i,
                mask.contains(ColourComponent::R),
                mask.contains(ColourComponent::G),
                mask.contains(ColourComponent::B),
                mask.contains(ColourComponent::A),
            );
        }
        let [r, g, b, a] = cb.blend_constants;
        gl.blend_color(r, g, b, a);
    }
}

impl<P: GlPlatform> GraphicsApi for GlApi<P> {
    type Xr = P::Xr;

    fn api_type(&self) -> GraphicsApiType {
        P::API
    }

    fn graphics_binding(&self) -> <P::Xr as xr::Graphics>::SessionCreateInfo {
        self.platform.graphics_binding()
    }

    fn depth_format(&self) -> i64 {
        convert::DEPTH_FORMAT
    }

    fn supported_swapchain_formats(&self) -> &'static [i64] {
        P::supported_swapchain_formats()
    }

    fn register_swapchain_images(
        &mut self,
        images: Vec<u32>,
        info: &ImageCreateInfo,
    ) -> Result<Vec<ImageHandle>> {
        let target = convert::texture_target(info)?;
        images
            .into_iter()
            .map(|texture| {
                let handle = ImageHandle::from_raw(texture as u64);
                self.images.insert(
                    handle,
                    GlImage {
                        texture: glow::NativeTexture(name(texture as u64)?),
                        target,
                        swapchain: true,
                    },
                )
            })
            .collect()
    }

    fn release_swapchain_images(&mut self, images: &[ImageHandle]) -> Result<()> {
        for &handle in images {
            if !self.images.get(handle)?.swapchain {
                anyhow::bail!("{:?} is not a swapchain image", handle);
            }
            self.images.remove(handle)?;
        }
        Ok(())
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let target = convert::texture_target(info)?;
        let gl = &self.gl;
        let format = info.format as u32;
        let levels = info.mip_levels.max(1) as i32;
        let (w, h) = (info.width as i32, info.height as i32);

        let texture = unsafe { gl.create_texture() }.map_err(gl_err)?;
        unsafe {
            gl.bind_texture(target, Some(texture));
            match target {
                glow::TEXTURE_1D => gl.tex_storage_1d(target, levels, format, w),
                glow::TEXTURE_2D | glow::TEXTURE_CUBE_MAP => {
                    gl.tex_storage_2d(target, levels, format, w, h)
                }
                glow::TEXTURE_1D_ARRAY => {
                    gl.tex_storage_2d(target, levels, format, w, info.array_layers as i32)
                }
                glow::TEXTURE_2D_MULTISAMPLE => gl.tex_storage_2d_multisample(
                    target,
                    info.sample_count as i32,
                    format,
                    w,
                    h,
                    true,
                ),
                glow::TEXTURE_3D => gl.tex_storage_3d(target, levels, format, w, h, info.depth as i32),
                glow::TEXTURE_2D_ARRAY | glow::TEXTURE_CUBE_MAP_ARRAY => {
                    gl.tex_storage_3d(target, levels, format, w, h, info.array_layers as i32)
                }
                _ => {
                    gl.bind_texture(target, None);
                    gl.delete_texture(texture);
                    anyhow::bail!("Multisampled array textures are not supported");
                }
            }
            gl.bind_texture(target, None);
        }

        self.images.insert(
            ImageHandle::from_raw(texture.0.get() as u64),
            GlImage {
                texture,
                target,
                swapchain: false,
            },
        )
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        if self.images.get(image)?.swapchain {
            anyhow::bail!("Swapchain image {:?} is owned by the OpenXR runtime", image);
        }
        let image = self.images.remove(image)?;
        unsafe { self.gl.delete_texture(image.texture) };
        Ok(())
    }

    fn create_image_view(&mut self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let image = self.images.get(info.image)?;
        let mut view = GlView {
            framebuffer: None,
            texture: image.texture,
            target: image.target,
            attachment: convert::attachment(info.aspect),
            info: *info,
        };

        if matches!(info.kind, ImageViewKind::Rtv | ImageViewKind::Dsv) {
            match info.view {
                ImageViewType::Type2D => {}
                ImageViewType::Type2DArray if info.layer_count == 1 => {}
                other => anyhow::bail!(
                    "{:?} with {} layers cannot be a GL attachment view",
                    other,
                    info.layer_count
                ),
            }
            let framebuffer = unsafe { self.gl.create_framebuffer() }.map_err(gl_err)?;
            unsafe {
                self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
                self.attach(view.attachment, &view);
            }
            let status = self.check_framebuffer("Image view");
            unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
            if let Err(e) = status {
                unsafe { self.gl.delete_framebuffer(framebuffer) };
                return Err(e);
            }
            view.framebuffer = Some(framebuffer);
        }

        // Several views may share one texture, so the texture name is no key
        Ok(self.image_views.insert_next(view))
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) -> Result<()> {
        let view = self.image_views.remove(view)?;
        if let Some(framebuffer) = view.framebuffer {
            unsafe { self.gl.delete_framebuffer(framebuffer) };
        }
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> Result<SamplerHandle> {
        let gl = &self.gl;
        let sampler = unsafe { gl.create_sampler() }.map_err(gl_err)?;
        let mut border = info.border_colour;
        unsafe {
            gl.sampler_parameter_i32(sampler, glow::TEXTURE_MAG_FILTER, convert::filter(info.mag_filter));
            gl.sampler_parameter_i32(
                sampler,
                glow::TEXTURE_MIN_FILTER,
                convert::min_filter(info.min_filter, info.mipmap_mode),
            );
            gl.sampler_parameter_i32(sampler, glow::TEXTURE_WRAP_S, convert::address_mode(info.address_mode_s));
            gl.sampler_parameter_i32(sampler, glow::TEXTURE_WRAP_T, convert::address_mode(info.address_mode_t));
            gl.sampler_parameter_i32(sampler, glow::TEXTURE_WRAP_R, convert::address_mode(info.address_mode_r));
            if Self::is_desktop() {
                gl.sampler_parameter_f32(sampler, glow::TEXTURE_LOD_BIAS, info.mip_lod_bias);
            }
            gl.sampler_parameter_i32(
                sampler,
                glow::TEXTURE_COMPARE_MODE,
                if info.compare_enable {
                    glow::COMPARE_REF_TO_TEXTURE as i32
                } else {
                    glow::NONE as i32
                },
            );
            gl.sampler_parameter_i32(
                sampler,
                glow::TEXTURE_COMPARE_FUNC,
                convert::compare_op(info.compare_op) as i32,
            );
            gl.sampler_parameter_f32(sampler, glow::TEXTURE_MIN_LOD, info.min_lod);
            gl.sampler_parameter_f32(sampler, glow::TEXTURE_MAX_LOD, info.max_lod);
            gl.sampler_parameter_f32_slice(sampler, glow::TEXTURE_BORDER_COLOR, &mut border);
        }
        self.samplers
            .insert(SamplerHandle::from_raw(sampler.0.get() as u64), sampler)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        let sampler = self.samplers.remove(sampler)?;
        unsafe { self.gl.delete_sampler(sampler) };
        Ok(())
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let gl = &self.gl;
        let usage = match info.kind {
            BufferKind::Uniform => glow::DYNAMIC_DRAW,
            BufferKind::Vertex | BufferKind::Index => glow::STATIC_DRAW,
        };
        let buffer = unsafe { gl.create_buffer() }.map_err(gl_err)?;
        // Upload through COPY_WRITE_BUFFER; ELEMENT_ARRAY_BUFFER is vertex array state
        unsafe {
            gl.bind_buffer(glow::COPY_WRITE_BUFFER, Some(buffer));
            match &info.data {
                Some(data) if data.len() == info.size => {
                    gl.buffer_data_u8_slice(glow::COPY_WRITE_BUFFER, data, usage)
                }
                data => {
                    gl.buffer_data_size(glow::COPY_WRITE_BUFFER, info.size as i32, usage);
                    if let Some(data) = data {
                        let len = data.len().min(info.size);
                        gl.buffer_sub_data_u8_slice(glow::COPY_WRITE_BUFFER, 0, &data[..len]);
                    }
                }
            }
            gl.bind_buffer(glow::COPY_WRITE_BUFFER, None);
        }
        self.buffers.insert(
            BufferHandle::from_raw(buffer.0.get() as u64),
            GlBuffer {
                buffer,
                info: BufferCreateInfo {
                    data: None,
                    ..info.clone()
                },
            },
        )
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let buffer = self.buffers.remove(buffer)?;
        unsafe { self.gl.delete_buffer(buffer.buffer) };
        Ok(())
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo) -> Result<ShaderHandle> {
        let source = std::str::from_utf8(&info.source).context("GLSL source is not UTF-8")?;
        let gl = &self.gl;
        let shader = unsafe { gl.create_shader(convert::shader_type(info.stage)) }.map_err(gl_err)?;
        unsafe {
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                anyhow::bail!("Failed to compile {:?} shader: {}", info.stage, log);
            }
        }
        self.shaders
            .insert(ShaderHandle::from_raw(shader.0.get() as u64), shader)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        let shader = self.shaders.remove(shader)?;
        unsafe { self.gl.delete_shader(shader) };
        Ok(())
    }

    fn create_pipeline(&mut self, info: &PipelineCreateInfo) -> Result<PipelineHandle> {
        if info.colour_blend_state.logic_op_enable {
            log::warn!("GL pipelines ignore logic ops");
        }
        let ms = &info.multisample_state;
        if ms.sample_shading_enable {
            if convert::sample_shading_available(Self::is_desktop(), self.version) {
                log::warn!(
                    "GL pipelines ignore min_sample_shading {}; the driver's fraction applies",
                    ms.min_sample_shading
                );
            } else {
                log::warn!(
                    "{} {}.{} has no sample shading; ignored",
                    P::API,
                    self.version.0,
                    self.version.1
                );
            }
        }

        let shaders = info
            .shaders
            .iter()
            .map(|&h| self.shaders.get(h).copied())
            .collect::<Result<Vec<_>>>()?;

        let gl = &self.gl;
        let program = unsafe { gl.create_program() }.map_err(gl_err)?;
        unsafe {
            for &shader in &shaders {
                gl.attach_shader(program, shader);
            }
            gl.link_program(program);
            for &shader in &shaders {
                gl.detach_shader(program, shader);
            }
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                anyhow::bail!("Failed to link program: {}", log);
            }
        }

        self.pipelines.insert(
            PipelineHandle::from_raw(program.0.get() as u64),
            GlPipeline {
                program,
                info: info.clone(),
            },
        )
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if self.current_pipeline == Some(pipeline) {
            self.current_pipeline = None;
        }
        let pipeline = self.pipelines.remove(pipeline)?;
        unsafe { self.gl.delete_program(pipeline.program) };
        Ok(())
    }

    fn begin_rendering(&mut self) -> Result<()> {
        if self.recording {
            anyhow::bail!("begin_rendering called twice without end_rendering");
        }
        let vertex_array = unsafe { self.gl.create_vertex_array() }.map_err(gl_err)?;
        unsafe { self.gl.bind_vertex_array(Some(vertex_array)) };
        self.vertex_array = Some(vertex_array);
        self.recording = true;
        self.current_pipeline = None;
        self.pending_descriptors.clear();
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        self.check_recording()?;
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            self.gl.bind_vertex_array(None);
            if let Some(vertex_array) = self.vertex_array.take() {
                self.gl.delete_vertex_array(vertex_array);
            }
            self.gl.use_program(None);
            self.gl.flush();
        }
        self.recording = false;
        Ok(())
    }

    fn set_buffer_data(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let entry = self.buffers.get(buffer)?;
        if offset
            .checked_add(data.len())
            .map_or(true, |end| end > entry.info.size)
        {
            anyhow::bail!(
                "Write of {} bytes at offset {} overflows buffer of {} bytes",
                data.len(),
                offset,
                entry.info.size
            );
        }
        unsafe {
            self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, Some(entry.buffer));
            self.gl
                .buffer_sub_data_u8_slice(glow::COPY_WRITE_BUFFER, offset as i32, data);
            self.gl.bind_buffer(glow::COPY_WRITE_BUFFER, None);
        }
        Ok(())
    }

    fn clear_colour(&mut self, view: ImageViewHandle, colour: [f32; 4]) -> Result<()> {
        self.check_recording()?;
        self.clear_view(view, false, |gl| unsafe {
            gl.color_mask(true, true, true, true);
            gl.clear_color(colour[0], colour[1], colour[2], colour[3]);
            gl.clear(glow::COLOR_BUFFER_BIT);
        })
    }

    fn clear_depth(&mut self, view: ImageViewHandle, depth: f32) -> Result<()> {
        self.check_recording()?;
        self.clear_view(view, true, |gl| unsafe {
            gl.depth_mask(true);
            gl.clear_depth_f32(depth);
            gl.clear(glow::DEPTH_BUFFER_BIT);
        })
    }

    fn set_render_attachments(
        &mut self,
        colour_views: &[ImageViewHandle],
        depth_view: Option<ImageViewHandle>,
    ) -> Result<()> {
        self.check_recording()?;
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, Some(self.render_framebuffer))
        };

        let mut draw_buffers = Vec::with_capacity(colour_views.len());
        for (i, &handle) in colour_views.iter().enumerate() {
            let view = self.image_views.get(handle)?;
            if view.attachment != glow::COLOR_ATTACHMENT0 {
                anyhow::bail!("{:?} is not a colour view", handle);
            }
            let attachment = glow::COLOR_ATTACHMENT0 + i as u32;
            unsafe { self.attach(attachment, view) };
            draw_buffers.push(attachment);
        }

        match depth_view {
            Some(handle) => {
                let view = self.image_views.get(handle)?;
                if view.attachment == glow::COLOR_ATTACHMENT0 {
                    anyhow::bail!("{:?} is not a depth view", handle);
                }
                unsafe { self.attach(view.attachment, view) };
            }
            None => unsafe {
                self.gl.framebuffer_texture_2d(
                    glow::FRAMEBUFFER,
                    glow::DEPTH_STENCIL_ATTACHMENT,
                    glow::TEXTURE_2D,
                    None,
                    0,
                )
            },
        }

        unsafe { self.gl.draw_buffers(&draw_buffers) };
        self.check_framebuffer("Render")
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()> {
        self.check_recording()?;
        let vp = viewports.first().context("set_viewports needs at least one viewport")?;
        unsafe {
            self.gl.viewport(
                vp.x as i32,
                vp.y as i32,
                vp.width as i32,
                vp.height as i32,
            );
            self.gl.depth_range_f32(vp.min_depth, vp.max_depth);
        }
        Ok(())
    }

    fn set_scissors(&mut self, scissors: &[Rect2D]) -> Result<()> {
        self.check_recording()?;
        let s = scissors.first().context("set_scissors needs at least one rectangle")?;
        unsafe {
            self.gl.enable(glow::SCISSOR_TEST);
            self.gl.scissor(
                s.offset.x,
                s.offset.y,
                s.extent.width as i32,
                s.extent.height as i32,
            );
        }
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.check_recording()?;
        let p = self.pipelines.get(pipeline)?;
        unsafe {
            self.gl.use_program(Some(p.program));
            self.apply_pipeline_state(&p.info);
        }
        self.current_pipeline = Some(pipeline);
        self.pending_descriptors.clear();
        Ok(())
    }

    fn set_descriptor(&mut self, info: &DescriptorInfo) -> Result<()> {
        self.pending_descriptors.retain(|d| {
            d.binding_index != info.binding_index || d.descriptor_type() != info.descriptor_type()
        });
        self.pending_descriptors.push(*info);
        Ok(())
    }

    fn update_descriptors(&mut self) -> Result<()> {
        self.check_recording()?;
        let pending = std::mem::take(&mut self.pending_descriptors);
        for d in &pending {
            match d.resource {
                DescriptorResource::Buffer(handle) => {
                    let buffer = self.buffers.get(handle)?;
                    let (offset, size) = d.buffer_range(buffer.info.size)?;
                    unsafe {
                        self.gl.bind_buffer_range(
                            glow::UNIFORM_BUFFER,
                            d.binding_index,
                            Some(buffer.buffer),
                            offset as i32,
                            size as i32,
                        )
                    };
                }
                DescriptorResource::Image(handle) => {
                    let view = self.image_views.get(handle)?;
                    if view.info.kind != ImageViewKind::Srv {
                        anyhow::bail!("GL backends only bind sampled image views, got {:?}", handle);
                    }
                    unsafe {
                        self.gl.active_texture(glow::TEXTURE0 + d.binding_index);
                        self.gl.bind_texture(view.target, Some(view.texture));
                    }
                }
                DescriptorResource::Sampler(handle) => {
                    let sampler = *self.samplers.get(handle)?;
                    unsafe { self.gl.bind_sampler(d.binding_index, Some(sampler)) };
                }
            }
        }
        Ok(())
    }

    fn set_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        self.check_recording()?;
        let input = &self.current_pipeline()?.info.vertex_input_state;

        for (slot, &handle) in buffers.iter().enumerate() {
            let slot = slot as u32;
            let buffer = self.buffers.get(handle)?;
            if buffer.info.kind != BufferKind::Vertex {
                anyhow::bail!("{:?} is not a vertex buffer", handle);
            }
            unsafe {
                self.gl
                    .bind_buffer(convert::buffer_target(buffer.info.kind), Some(buffer.buffer))
            };

            for binding in input.bindings.iter().filter(|b| b.binding_index == slot) {
                for attribute in input.attributes.iter().filter(|a| a.binding_index == slot) {
                    let index = attribute.attrib_index;
                    let size = attribute.vertex_type.component_count() as i32;
                    let data_type = convert::vertex_data_type(attribute.vertex_type);
                    let stride = binding.stride as i32;
                    let offset = (binding.offset + attribute.offset) as i32;
                    unsafe {
                        self.gl.enable_vertex_attrib_array(index);
                        if data_type == glow::FLOAT {
                            self.gl
                                .vertex_attrib_pointer_f32(index, size, data_type, false, stride, offset);
                        } else {
                            self.gl
                                .vertex_attrib_pointer_i32(index, size, data_type, stride, offset);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.check_recording()?;
        let entry = self.buffers.get(buffer)?;
        if entry.info.kind != BufferKind::Index {
            anyhow::bail!("{:?} is not an index buffer", buffer);
        }
        unsafe {
            self.gl
                .bind_buffer(convert::buffer_target(entry.info.kind), Some(entry.buffer))
        };
        self.index_buffer_type = convert::index_type(&entry.info);
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
        self.check_recording()?;
        let mode = convert::topology(self.current_pipeline()?.info.input_assembly_state.topology);
        let index_size = if self.index_buffer_type == glow::UNSIGNED_INT { 4 } else { 2 };
        let offset = (first_index * index_size) as i32;
        unsafe {
            if first_instance == 0 {
                self.gl.draw_elements_instanced_base_vertex(
                    mode,
                    index_count as i32,
                    self.index_buffer_type,
                    offset,
                    instance_count as i32,
                    vertex_offset,
                );
            } else {
                self.gl.draw_elements_instanced_base_vertex_base_instance(
                    mode,
                    index_count as i32,
                    self.index_buffer_type,
                    offset,
                    instance_count as i32,
                    vertex_offset,
                    first_instance,
                );
            }
        }
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.check_recording()?;
        let mode = convert::topology(self.current_pipeline()?.info.input_assembly_state.topology);
        unsafe {
            if first_instance == 0 {
                self.gl.draw_arrays_instanced(
                    mode,
                    first_vertex as i32,
                    vertex_count as i32,
                    instance_count as i32,
                );
            } else {
                self.gl.draw_arrays_instanced_base_instance(
                    mode,
                    first_vertex as i32,
                    vertex_count as i32,
                    instance_count as i32,
                    first_instance,
                );
            }
        }
        Ok(())
    }
}

impl<P: GlPlatform> Drop for GlApi<P> {
    fn drop(&mut self) {
        log::info!("Destroying {} resources...", P::API);
        let gl = &self.gl;
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                gl.delete_program(pipeline.program);
            }
            for (_, shader) in self.shaders.drain() {
                gl.delete_shader(shader);
            }
            for (_, buffer) in self.buffers.drain() {
                gl.delete_buffer(buffer.buffer);
            }
            for (_, sampler) in self.samplers.drain() {
                gl.delete_sampler(sampler);
            }
            for (_, view) in self.image_views.drain() {
                if let Some(framebuffer) = view.framebuffer {
                    gl.delete_framebuffer(framebuffer);
                }
            }
            for (_, image) in self.images.drain() {
                if !image.swapchain {
                    gl.delete_texture(image.texture);
                }
            }
            if let Some(vertex_array) = self.vertex_array.take() {
                gl.delete_vertex_array(vertex_array);
            }
            gl.delete_framebuffer(self.render_framebuffer);
        }
    }
}
