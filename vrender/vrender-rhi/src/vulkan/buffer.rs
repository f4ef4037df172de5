//! Buffers bound to allocator blocks: generic, vertex/index and uniform.

use super::{native_error, RawDevice, VulkanCommandBuffer, VulkanDevice};
use crate::{CommandBuffer, MemoryBlock, MemoryPropertyFlags, RhiError, SharedAllocator};
use ash::vk::{self, Handle};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: MemoryPropertyFlags,
}

/// A `VkBuffer` bound to one [`MemoryBlock`]; the block goes back to the allocator on drop.
pub struct Buffer {
    raw: Arc<RawDevice>,
    allocator: SharedAllocator,
    pub(crate) buffer: vk::Buffer,
    block: MemoryBlock,
    info: BufferInfo,
}

impl Buffer {
    pub fn new(
        device: &VulkanDevice,
        allocator: &SharedAllocator,
        info: BufferInfo,
    ) -> Result<Self, RhiError> {
        let raw = device.raw();
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            raw.device
                .create_buffer(&create_info, None)
                .map_err(native_error("vkCreateBuffer"))?
        };
        let requirements = unsafe { raw.device.get_buffer_memory_requirements(buffer) };
        let block = allocator
            .lock()
            .allocate_with_properties(
                requirements.size,
                requirements.alignment,
                requirements.memory_type_bits,
                info.memory_properties,
            )
            .map_err(|e| {
                unsafe { raw.device.destroy_buffer(buffer, None) };
                e
            })?;
        let bound = unsafe {
            raw.device
                .bind_buffer_memory(buffer, vk::DeviceMemory::from_raw(block.memory), block.offset)
        };
        if let Err(e) = bound {
            unsafe { raw.device.destroy_buffer(buffer, None) };
            let _ = allocator.lock().free(&block);
            return Err(native_error("vkBindBufferMemory")(e));
        }
        Ok(Self {
            raw: Arc::clone(raw),
            allocator: Arc::clone(allocator),
            buffer,
            block,
            info,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    /// Copy `data` into the buffer at `offset`. The buffer must be host-visible.
    pub fn copy_data(&self, data: &[u8], offset: u64) -> Result<(), RhiError> {
        if !self
            .info
            .memory_properties
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(RhiError::Unsupported(
                "copy_data on a buffer that is not host-visible".to_string(),
            ));
        }
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.info.size) {
            return Err(RhiError::Unsupported(format!(
                "copy of {} bytes at offset {} overruns a {} byte buffer",
                len, offset, self.info.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        // Host-visible links stay mapped; the lock serializes writers.
        self.allocator.lock().write(&self.block, offset, data)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_buffer(self.buffer, None);
        }
        if let Err(e) = self.allocator.lock().free(&self.block) {
            log::error!("Buffer drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.info.size)
            .field("usage", &self.info.usage)
            .field("block", &self.block)
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }
}

/// Device-local vertex and `u16` index buffers, filled once through staging buffers.
#[derive(Debug)]
pub struct VertexBuffer {
    vertices: Buffer,
    indices: Buffer,
    vertex_count: u32,
    index_count: u32,
}

impl VertexBuffer {
    pub fn new(
        device: &VulkanDevice,
        allocator: &SharedAllocator,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> Result<Self, RhiError> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(RhiError::Unsupported("empty vertex or index data".to_string()));
        }
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let vertex_buffer =
            upload(device, allocator, vertex_bytes, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer =
            upload(device, allocator, index_bytes, vk::BufferUsageFlags::INDEX_BUFFER)?;
        log::debug!(
            "VertexBuffer: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );
        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    /// Bind both buffers on a Vulkan command buffer.
    pub fn bind(&self, command_buffer: &dyn CommandBuffer) {
        let Some(cmd) = command_buffer
            .as_any()
            .downcast_ref::<VulkanCommandBuffer>()
        else {
            log::error!("VertexBuffer::bind: not a VulkanCommandBuffer");
            return;
        };
        unsafe {
            cmd.device()
                .cmd_bind_vertex_buffers(cmd.handle(), 0, &[self.vertices.buffer], &[0]);
            cmd.device().cmd_bind_index_buffer(
                cmd.handle(),
                self.indices.buffer,
                0,
                vk::IndexType::UINT16,
            );
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Copy `data` into a new device-local buffer. The staging buffer lives only for the copy.
fn upload(
    device: &VulkanDevice,
    allocator: &SharedAllocator,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer, RhiError> {
    let size = data.len() as u64;
    let staging = Buffer::new(
        device,
        allocator,
        BufferInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory_properties: MemoryPropertyFlags::HOST_VISIBLE
                | MemoryPropertyFlags::HOST_COHERENT,
        },
    )?;
    staging.copy_data(data, 0)?;
    let target = Buffer::new(
        device,
        allocator,
        BufferInfo {
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            memory_properties: MemoryPropertyFlags::DEVICE_LOCAL,
        },
    )?;
    device.submit_wait(|dev, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { dev.cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]) };
    })?;
    Ok(target)
}

/// Host-visible, coherent uniform buffer rewritten by the CPU every frame.
#[derive(Debug)]
pub struct UniformBuffer {
    buffer: Buffer,
}

impl UniformBuffer {
    pub fn new(
        device: &VulkanDevice,
        allocator: &SharedAllocator,
        size: u64,
    ) -> Result<Self, RhiError> {
        let buffer = Buffer::new(
            device,
            allocator,
            BufferInfo {
                size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                memory_properties: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
            },
        )?;
        Ok(Self { buffer })
    }

    pub fn write<T: Pod>(&self, value: &T) -> Result<(), RhiError> {
        self.buffer.copy_data(bytemuck::bytes_of(value), 0)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer.buffer,
            offset: 0,
            range: self.buffer.size(),
        }
    }
}
