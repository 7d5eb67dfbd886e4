// Buffer utilities for vertex, index, staging and uniform buffers
//
// Memory is allocated per buffer with an explicitly chosen memory type.
// Static data goes through a host-visible staging buffer into device-local
// memory; uniform buffers stay host-visible and persistently mapped.

use super::command::CommandPool;
use super::VulkanDevice;
use crate::error::RendererError;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// First memory type allowed by `type_filter` that has all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = type_filter & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(RendererError::NoSuitableMemoryType { type_filter, properties })
}

/// Allocate memory for `requirements` from a matching memory type
pub fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index =
        find_memory_type(&device.memory_properties, requirements.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .context("Failed to allocate device memory")?;
    Ok(memory)
}

/// A buffer and its dedicated memory
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let memory = match allocate_memory(&device, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let this = Self {
            buffer,
            memory,
            size,
            device,
        };

        unsafe { this.device.device.bind_buffer_memory(buffer, memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(this)
    }

    /// Host-visible, host-coherent transfer source holding `data`
    pub fn staging(device: Arc<VulkanDevice>, data: &[u8]) -> Result<Self> {
        let buffer = Self::new(device, data.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC, HOST_MEMORY)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Copy `data` to the start of a host-visible buffer
    pub fn write(&self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes exceeds buffer size {}",
            data.len(),
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Upload `data` into a new device-local buffer through a staging buffer
    pub fn device_local_with_data(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        let staging = Self::staging(device.clone(), data)?;
        let buffer = Self::new(
            device,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        copy_buffer(commands, &staging, &buffer)?;
        Ok(buffer)
    }

    /// Copy the buffer's contents back to the host (buffer needs TRANSFER_SRC)
    #[cfg(test)]
    pub fn read_back(&self, commands: &CommandPool) -> Result<Vec<u8>> {
        let readback = Self::new(self.device.clone(), self.size, vk::BufferUsageFlags::TRANSFER_DST, HOST_MEMORY)?;
        copy_buffer(commands, self, &readback)?;

        let mut bytes = vec![0u8; self.size as usize];
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(readback.memory, 0, readback.size, vk::MemoryMapFlags::empty())
                .context("Failed to map readback memory")? as *const u8;
            ptr.copy_to_nonoverlapping(bytes.as_mut_ptr(), bytes.len());
            self.device.device.unmap_memory(readback.memory);
        }
        Ok(bytes)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Blocking GPU copy of `src` into `dst` (sizes must match)
pub fn copy_buffer(commands: &CommandPool, src: &Buffer, dst: &Buffer) -> Result<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: src.size.min(dst.size),
    };

    commands.submit_one_time(|device, cmd| unsafe {
        device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
    })
}

/// Host-visible uniform buffer, mapped for its whole lifetime
pub struct MappedUniformBuffer {
    // Unmapped in `Drop` before `buffer` is destroyed
    mapped: *mut u8,
    buffer: Buffer,
}

impl MappedUniformBuffer {
    pub fn new(device: Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        let buffer = Buffer::new(device, size, vk::BufferUsageFlags::UNIFORM_BUFFER, HOST_MEMORY)?;

        let mapped = unsafe {
            buffer
                .device
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map uniform buffer")? as *mut u8;

        Ok(Self { mapped, buffer })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }

    /// Overwrite the buffer with `value`. The caller guarantees the GPU is
    /// not reading this buffer (its frame fence has signaled).
    pub fn write<T: bytemuck::Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        let len = bytes.len().min(self.buffer.size as usize);
        unsafe { self.mapped.copy_from_nonoverlapping(bytes.as_ptr(), len) };
    }
}

impl Drop for MappedUniformBuffer {
    fn drop(&mut self) {
        unsafe { self.buffer.device.device.unmap_memory(self.buffer.memory) };
    }
}
