// Command pool + one-shot submission helper

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Pool on the graphics family; buffers can be reset individually
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Record a throwaway command buffer, submit it on the graphics queue and
    /// block until the GPU has finished it.
    pub fn submit_one_time(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = &self.device.device;
        let command_buffer = self.allocate(1)?[0];

        let result = (|| -> Result<()> {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
                .context("Failed to begin one-time command buffer")?;

            record(device, command_buffer);

            unsafe { device.end_command_buffer(command_buffer) }
                .context("Failed to end one-time command buffer")?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
            unsafe {
                device
                    .queue_submit(self.device.graphics_queue, &[submit_info], vk::Fence::null())
                    .context("Failed to submit one-time command buffer")?;
                device
                    .queue_wait_idle(self.device.graphics_queue)
                    .context("Failed to wait for one-time command buffer")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &[command_buffer]) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}
