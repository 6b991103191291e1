// Vertex, index and uniform buffers
//
// All buffers live in host-visible memory so set_buffer_data is a plain
// copy into the persistent mapping.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::device::keep_or_release;
use super::{convert, VulkanDevice};
use crate::backend::types::BufferCreateInfo;

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub info: BufferCreateInfo,
}

impl VulkanBuffer {
    pub fn new(device: &VulkanDevice, info: &BufferCreateInfo) -> Result<Self> {
        if info.size == 0 {
            anyhow::bail!("Cannot create an empty buffer");
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(info.size as vk::DeviceSize)
            .usage(convert::buffer_usage(info.kind))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match device.allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut vk_buffer = Self {
            buffer,
            allocation,
            info: BufferCreateInfo {
                data: None,
                ..info.clone()
            },
        };

        let bound = unsafe {
            device.device.bind_buffer_memory(
                buffer,
                vk_buffer.allocation.memory(),
                vk_buffer.allocation.offset(),
            )
        }
        .context("Failed to bind buffer memory");
        let filled = bound.and_then(|()| match &info.data {
            Some(data) => vk_buffer.write(0, data),
            None => Ok(()),
        });

        keep_or_release(filled, vk_buffer, |vk_buffer| {
            if let Err(e) = vk_buffer.destroy(device) {
                log::error!("Failed to release buffer after error: {:#}", e);
            }
        })
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.info.size)
            .with_context(|| {
                format!(
                    "Write of {} bytes at offset {} overflows buffer of {} bytes",
                    data.len(),
                    offset,
                    self.info.size
                )
            })?;

        let mapped = self
            .allocation
            .mapped_slice_mut()
            .context("Buffer memory is not host mapped")?;
        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        device.free(self.allocation)
    }
}
