// Command recording and submission
//
// One command pool/buffer pair is recorded per begin/end_rendering bracket.
// end_rendering submits and blocks on the fence, so resources touched by the
// previous bracket are free to reuse once it returns.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

pub struct CommandContext {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

impl CommandContext {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?[0];

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;

        Ok(Self { pool, buffer, fence })
    }

    pub fn begin(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .context("Failed to reset command pool")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }
        Ok(())
    }

    /// End recording, submit to `queue` and wait for completion
    pub fn submit_and_wait(&self, device: &ash::Device, queue: vk::Queue) -> Result<()> {
        unsafe {
            device
                .end_command_buffer(self.buffer)
                .context("Failed to end command buffer")?;

            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(std::slice::from_ref(&self.buffer))
                .build();
            device
                .queue_submit(queue, std::slice::from_ref(&submit_info), self.fence)
                .context("Failed to submit command buffer")?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .context("Failed to wait for render fence")?;
            device
                .reset_fences(&[self.fence])
                .context("Failed to reset render fence")?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.pool, None);
        }
    }
}
