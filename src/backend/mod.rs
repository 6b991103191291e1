// Backend module - graphics abstraction over D3D11, D3D12, OpenGL, OpenGL ES and Vulkan
//
// Each backend owns its native device, produces the graphics binding OpenXR
// needs for session creation, and translates the neutral descriptors in
// `types` into native objects tracked by `handles::ResourceTable`s.

pub mod handles;
pub mod types;

pub mod d3d;
pub mod gl;
pub mod vulkan;

use anyhow::{Context, Result};
use openxr as xr;
use std::fmt;
use std::str::FromStr;

pub use handles::{
    BufferHandle, ImageHandle, ImageViewHandle, PipelineHandle, SamplerHandle, ShaderHandle,
};
pub use types::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GraphicsApiType {
    #[default]
    Unknown,
    D3D11,
    D3D12,
    OpenGL,
    OpenGLES,
    Vulkan,
}

impl fmt::Display for GraphicsApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphicsApiType::Unknown => "Unknown",
            GraphicsApiType::D3D11 => "D3D11",
            GraphicsApiType::D3D12 => "D3D12",
            GraphicsApiType::OpenGL => "OpenGL",
            GraphicsApiType::OpenGLES => "OpenGL ES",
            GraphicsApiType::Vulkan => "Vulkan",
        };
        f.write_str(name)
    }
}

impl FromStr for GraphicsApiType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "d3d11" => Ok(GraphicsApiType::D3D11),
            "d3d12" => Ok(GraphicsApiType::D3D12),
            "opengl" | "gl" => Ok(GraphicsApiType::OpenGL),
            "opengl_es" | "opengles" | "gles" => Ok(GraphicsApiType::OpenGLES),
            "vulkan" | "vk" => Ok(GraphicsApiType::Vulkan),
            other => anyhow::bail!("Unknown graphics API '{}'", other),
        }
    }
}

/// Whether `api` can run on the platform this binary was built for
pub fn is_valid_for_platform(api: GraphicsApiType) -> bool {
    use GraphicsApiType::*;

    if cfg!(windows) {
        matches!(api, D3D11 | D3D12 | OpenGL | Vulkan)
    } else if cfg!(target_os = "android") {
        matches!(api, OpenGLES | Vulkan)
    } else if cfg!(target_os = "linux") {
        matches!(api, OpenGL | Vulkan)
    } else {
        false
    }
}

/// OpenXR instance extension that enables `api`
pub fn instance_extension_name(api: GraphicsApiType) -> Result<&'static str> {
    match api {
        GraphicsApiType::D3D11 => Ok("XR_KHR_D3D11_enable"),
        GraphicsApiType::D3D12 => Ok("XR_KHR_D3D12_enable"),
        GraphicsApiType::OpenGL => Ok("XR_KHR_opengl_enable"),
        GraphicsApiType::OpenGLES => Ok("XR_KHR_opengl_es_enable"),
        GraphicsApiType::Vulkan => Ok("XR_KHR_vulkan_enable2"),
        GraphicsApiType::Unknown => anyhow::bail!("Unknown graphics API has no OpenXR extension"),
    }
}

/// Turn on the extension for `api` in `set`; true if the runtime offers it
pub fn enable_instance_extension(
    api: GraphicsApiType,
    available: &xr::ExtensionSet,
    set: &mut xr::ExtensionSet,
) -> Result<bool> {
    let supported = match api {
        #[cfg(windows)]
        GraphicsApiType::D3D11 => {
            set.khr_d3d11_enable = true;
            available.khr_d3d11_enable
        }
        #[cfg(windows)]
        GraphicsApiType::D3D12 => {
            set.khr_d3d12_enable = true;
            available.khr_d3d12_enable
        }
        GraphicsApiType::OpenGL => {
            set.khr_opengl_enable = true;
            available.khr_opengl_enable
        }
        #[cfg(target_os = "android")]
        GraphicsApiType::OpenGLES => {
            set.khr_opengl_es_enable = true;
            available.khr_opengl_es_enable
        }
        GraphicsApiType::Vulkan => {
            set.khr_vulkan_enable2 = true;
            available.khr_vulkan_enable2
        }
        GraphicsApiType::Unknown => {
            anyhow::bail!("Unknown graphics API has no OpenXR extension")
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("{} is not available on this platform", other),
    };
    Ok(supported)
}

/// First runtime format (in the runtime's preference order) that the backend supports
pub fn select_swapchain_format(runtime_formats: &[i64], supported: &[i64]) -> Result<i64> {
    runtime_formats
        .iter()
        .copied()
        .find(|format| supported.contains(format))
        .with_context(|| {
            format!(
                "Unable to find a supported swapchain format; runtime offers {:?}, backend supports {:?}",
                runtime_formats, supported
            )
        })
}

/// Uniform interface over the native graphics APIs
///
/// Handles returned by one backend are only meaningful to that backend.
/// Recording calls (`clear_*`, `set_*`, `draw*`) must sit between
/// `begin_rendering` and `end_rendering`.
pub trait GraphicsApi {
    /// OpenXR graphics type this backend binds to
    type Xr: xr::Graphics;

    fn api_type(&self) -> GraphicsApiType;

    /// Session create info handed to `xr::Instance::create_session`
    fn graphics_binding(&self) -> <Self::Xr as xr::Graphics>::SessionCreateInfo;

    fn depth_format(&self) -> i64;

    /// Colour formats in the backend's preference order
    fn supported_swapchain_formats(&self) -> &'static [i64];

    fn select_swapchain_format(&self, runtime_formats: &[i64]) -> Result<i64> {
        select_swapchain_format(runtime_formats, self.supported_swapchain_formats())
    }

    /// Record runtime-owned swapchain images so views can be created on them.
    /// The images stay owned by the runtime; `destroy_image` refuses them.
    fn register_swapchain_images(
        &mut self,
        images: Vec<<Self::Xr as xr::Graphics>::SwapchainImage>,
        info: &ImageCreateInfo,
    ) -> Result<Vec<ImageHandle>>;

    /// Forget swapchain images once their swapchain is destroyed
    fn release_swapchain_images(&mut self, images: &[ImageHandle]) -> Result<()>;

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageHandle>;
    fn destroy_image(&mut self, image: ImageHandle) -> Result<()>;

    fn create_image_view(&mut self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle>;
    fn destroy_image_view(&mut self, view: ImageViewHandle) -> Result<()>;

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> Result<SamplerHandle>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()>;

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn create_shader(&mut self, info: &ShaderCreateInfo) -> Result<ShaderHandle>;
    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()>;

    fn create_pipeline(&mut self, info: &PipelineCreateInfo) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;

    fn begin_rendering(&mut self) -> Result<()>;
    fn end_rendering(&mut self) -> Result<()>;

    /// Copy `data` into `buffer` starting at `offset` bytes
    fn set_buffer_data(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    fn clear_colour(&mut self, view: ImageViewHandle, colour: [f32; 4]) -> Result<()>;
    fn clear_depth(&mut self, view: ImageViewHandle, depth: f32) -> Result<()>;

    fn set_render_attachments(
        &mut self,
        colour_views: &[ImageViewHandle],
        depth_view: Option<ImageViewHandle>,
    ) -> Result<()>;
    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()>;
    fn set_scissors(&mut self, scissors: &[Rect2D]) -> Result<()>;

    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;
    /// Stage a resource binding; applied by `update_descriptors`
    fn set_descriptor(&mut self, info: &DescriptorInfo) -> Result<()>;
    fn update_descriptors(&mut self) -> Result<()>;
    fn set_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()>;
    fn set_index_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()>;
    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_names() {
        assert_eq!("Vulkan".parse::<GraphicsApiType>().unwrap(), GraphicsApiType::Vulkan);
        assert_eq!("d3d12".parse::<GraphicsApiType>().unwrap(), GraphicsApiType::D3D12);
        assert_eq!("OPENGL_ES".parse::<GraphicsApiType>().unwrap(), GraphicsApiType::OpenGLES);
        assert!("metal".parse::<GraphicsApiType>().is_err());
    }

    #[test]
    fn platform_validity() {
        assert!(is_valid_for_platform(GraphicsApiType::Vulkan));
        assert!(!is_valid_for_platform(GraphicsApiType::Unknown));
        if cfg!(windows) {
            assert!(is_valid_for_platform(GraphicsApiType::D3D11));
            assert!(!is_valid_for_platform(GraphicsApiType::OpenGLES));
        }
        if cfg!(all(target_os = "linux", not(target_os = "android"))) {
            assert!(is_valid_for_platform(GraphicsApiType::OpenGL));
            assert!(!is_valid_for_platform(GraphicsApiType::D3D11));
            assert!(!is_valid_for_platform(GraphicsApiType::D3D12));
        }
    }

    #[test]
    fn extension_names() {
        assert_eq!(
            instance_extension_name(GraphicsApiType::D3D11).unwrap(),
            "XR_KHR_D3D11_enable"
        );
        assert_eq!(
            instance_extension_name(GraphicsApiType::Vulkan).unwrap(),
            "XR_KHR_vulkan_enable2"
        );
        assert!(instance_extension_name(GraphicsApiType::Unknown).is_err());
    }

    #[test]
    fn extension_set_reports_runtime_support() {
        let mut available = xr::ExtensionSet::default();
        available.khr_opengl_enable = true;

        let mut set = xr::ExtensionSet::default();
        assert!(enable_instance_extension(GraphicsApiType::OpenGL, &available, &mut set).unwrap());
        assert!(set.khr_opengl_enable);

        let mut set = xr::ExtensionSet::default();
        assert!(!enable_instance_extension(GraphicsApiType::Vulkan, &available, &mut set).unwrap());
        assert!(set.khr_vulkan_enable2);
    }

    #[test]
    fn swapchain_format_follows_runtime_order() {
        // Runtime prefers 29 over 43; both are supported, so the runtime's first wins
        let runtime = [91, 29, 43];
        let supported = [43, 29];
        assert_eq!(select_swapchain_format(&runtime, &supported).unwrap(), 29);
    }

    #[test]
    fn swapchain_format_none_supported() {
        let err = select_swapchain_format(&[1, 2], &[3]).unwrap_err();
        assert!(err.to_string().contains("supported swapchain format"));
    }

    #[test]
    fn swapchain_format_empty_runtime_list() {
        assert!(select_swapchain_format(&[], &[43]).is_err());
    }
}
