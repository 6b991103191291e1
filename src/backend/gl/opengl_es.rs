// OpenGL ES platform (XR_KHR_opengl_es_enable), Android only

use anyhow::Result;
use openxr as xr;
use std::ffi::c_void;

use super::{convert, GlApi, GlPlatform};
use crate::backend::GraphicsApiType;

pub type OpenGLESApi = GlApi<GlEs>;

/// EGL objects behind the host's GLES context
#[derive(Clone, Copy, Debug)]
pub struct EglBinding {
    pub display: *mut c_void,
    pub config: *mut c_void,
    pub context: *mut c_void,
}

pub struct GlEs {
    binding: EglBinding,
}

impl GlEs {
    pub fn new(binding: EglBinding) -> Self {
        Self { binding }
    }
}

impl GlPlatform for GlEs {
    type Xr = xr::OpenGlEs;

    const API: GraphicsApiType = GraphicsApiType::OpenGLES;

    fn version_requirements(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
    ) -> Result<((u32, u32), (u32, u32))> {
        let reqs = xr_instance.graphics_requirements::<xr::OpenGlEs>(system)?;
        let min = reqs.min_api_version_supported;
        let max = reqs.max_api_version_supported;
        Ok((
            (min.major() as u32, min.minor() as u32),
            (max.major() as u32, max.minor() as u32),
        ))
    }

    fn graphics_binding(&self) -> xr::opengles::SessionCreateInfo {
        xr::opengles::SessionCreateInfo::Android {
            display: self.binding.display as _,
            config: self.binding.config as _,
            context: self.binding.context as _,
        }
    }

    fn supported_swapchain_formats() -> &'static [i64] {
        &convert::ES_SWAPCHAIN_FORMATS
    }
}
