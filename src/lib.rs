// OpenXR graphics: backend abstraction, OpenXR bootstrap and a minimal scene
//
// The binary drives Vulkan and D3D directly. GL hosts create their context,
// build a `backend::gl::GlApi` on it and hand that to `app::App`.

pub mod app;
pub mod backend;
pub mod config;
pub mod scene;
pub mod xr;
