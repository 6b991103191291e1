// Desktop OpenGL platform (XR_KHR_opengl_enable)

use anyhow::Result;
use openxr as xr;
use std::ffi::c_void;

use super::{convert, GlApi, GlPlatform};
use crate::backend::GraphicsApiType;

pub type OpenGLApi = GlApi<DesktopGl>;

/// Native handles of the host's GL context, passed through to the runtime
#[derive(Clone, Copy, Debug)]
pub enum GlContextBinding {
    #[cfg(not(windows))]
    Xlib {
        x_display: *mut c_void,
        visualid: u32,
        glx_fb_config: *mut c_void,
        glx_drawable: u64,
        glx_context: *mut c_void,
    },
    #[cfg(windows)]
    Wgl {
        h_dc: *mut c_void,
        h_glrc: *mut c_void,
    },
}

pub struct DesktopGl {
    binding: GlContextBinding,
}

impl DesktopGl {
    pub fn new(binding: GlContextBinding) -> Self {
        Self { binding }
    }
}

impl GlPlatform for DesktopGl {
    type Xr = xr::OpenGL;

    const API: GraphicsApiType = GraphicsApiType::OpenGL;

    fn version_requirements(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
    ) -> Result<((u32, u32), (u32, u32))> {
        let reqs = xr_instance.graphics_requirements::<xr::OpenGL>(system)?;
        let min = reqs.min_api_version_supported;
        let max = reqs.max_api_version_supported;
        Ok((
            (min.major() as u32, min.minor() as u32),
            (max.major() as u32, max.minor() as u32),
        ))
    }

    fn graphics_binding(&self) -> xr::opengl::SessionCreateInfo {
        match self.binding {
            #[cfg(not(windows))]
            GlContextBinding::Xlib {
                x_display,
                visualid,
                glx_fb_config,
                glx_drawable,
                glx_context,
            } => xr::opengl::SessionCreateInfo::Xlib {
                x_display: x_display as _,
                visualid,
                glx_fb_config: glx_fb_config as _,
                glx_drawable: glx_drawable as _,
                glx_context: glx_context as _,
            },
            #[cfg(windows)]
            GlContextBinding::Wgl { h_dc, h_glrc } => xr::opengl::SessionCreateInfo::Wgl {
                h_dc: h_dc as _,
                h_glrc: h_glrc as _,
            },
        }
    }

    fn supported_swapchain_formats() -> &'static [i64] {
        &convert::DESKTOP_SWAPCHAIN_FORMATS
    }
}
