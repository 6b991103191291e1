// OpenXR bootstrap: instance and system, debug messenger, session, swapchains

pub mod debug;
pub mod instance;
pub mod session;
pub mod swapchain;

pub use instance::XrContext;
pub use session::XrSession;
pub use swapchain::SwapchainSet;
