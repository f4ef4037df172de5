//! Command buffers and one-time submissions.

use super::{native_error, RawDevice};
use crate::{ClearColor, CommandBuffer, Rect2D, RhiError, Swapchain, Viewport};
use ash::vk;
use std::sync::Arc;

pub struct VulkanCommandBuffer {
    raw: Arc<RawDevice>,
    pub(crate) buffer: vk::CommandBuffer,
}

impl VulkanCommandBuffer {
    /// Allocate `count` primary buffers from the device's resettable pool.
    pub fn allocate(raw: &Arc<RawDevice>, count: u32) -> Result<Vec<Self>, RhiError> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe {
            raw.device
                .allocate_command_buffers(&info)
                .map_err(native_error("vkAllocateCommandBuffers"))?
        };
        Ok(buffers
            .into_iter()
            .map(|buffer| Self {
                raw: Arc::clone(raw),
                buffer,
            })
            .collect())
    }

    /// Native handle, for recording scene draws.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn device(&self) -> &ash::Device {
        &self.raw.device
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.raw
                .device
                .free_command_buffers(self.raw.command_pool, &[self.buffer]);
        }
    }
}

impl std::fmt::Debug for VulkanCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandBuffer")
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl CommandBuffer for VulkanCommandBuffer {
    fn begin(&mut self) -> Result<(), RhiError> {
        unsafe {
            self.raw
                .device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(native_error("vkResetCommandBuffer"))?;
            self.raw
                .device
                .begin_command_buffer(self.buffer, &vk::CommandBufferBeginInfo::default())
                .map_err(native_error("vkBeginCommandBuffer"))
        }
    }

    fn end(&mut self) -> Result<(), RhiError> {
        unsafe {
            self.raw
                .device
                .end_command_buffer(self.buffer)
                .map_err(native_error("vkEndCommandBuffer"))
        }
    }

    #[cfg(feature = "window")]
    fn begin_render_pass(&mut self, target: &dyn Swapchain, image_index: u32, clear: ClearColor) {
        let Some(swapchain) = target.as_any().downcast_ref::<super::VulkanSwapchain>() else {
            log::error!("begin_render_pass: target is not a VulkanSwapchain");
            return;
        };
        let Some(framebuffer) = swapchain.framebuffer(image_index) else {
            log::error!("begin_render_pass: no framebuffer for image {}", image_index);
            return;
        };
        let (width, height) = swapchain.extent();
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [clear.r, clear.g, clear.b, clear.a],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(swapchain.render_pass())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .clear_values(&clear_values);
        unsafe {
            self.raw
                .device
                .cmd_begin_render_pass(self.buffer, &info, vk::SubpassContents::INLINE);
        }
    }

    #[cfg(not(feature = "window"))]
    fn begin_render_pass(
        &mut self,
        _target: &dyn Swapchain,
        _image_index: u32,
        _clear: ClearColor,
    ) {
        log::error!("begin_render_pass needs the `window` feature");
    }

    fn end_render_pass(&mut self) {
        unsafe {
            self.raw.device.cmd_end_render_pass(self.buffer);
        }
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let vp = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe {
            self.raw.device.cmd_set_viewport(self.buffer, 0, &[vp]);
        }
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        let rect = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe {
            self.raw.device.cmd_set_scissor(self.buffer, 0, &[rect]);
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Record `record` into a fresh one-time buffer, submit it to the graphics
/// queue and block until the queue is idle. Used for uploads and layout
/// transitions during resource creation.
pub(crate) fn submit_wait(
    raw: &Arc<RawDevice>,
    record: impl FnOnce(&ash::Device, vk::CommandBuffer),
) -> Result<(), RhiError> {
    let mut buffers = VulkanCommandBuffer::allocate(raw, 1)?;
    let Some(command) = buffers.pop() else {
        return Err(RhiError::native("vkAllocateCommandBuffers", 0));
    };
    let begin = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        raw.device
            .begin_command_buffer(command.buffer, &begin)
            .map_err(native_error("vkBeginCommandBuffer"))?;
    }
    record(&raw.device, command.buffer);
    unsafe {
        raw.device
            .end_command_buffer(command.buffer)
            .map_err(native_error("vkEndCommandBuffer"))?;
        let buffers = [command.buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        raw.device
            .queue_submit(raw.graphics_queue, &[submit], vk::Fence::null())
            .map_err(native_error("vkQueueSubmit"))?;
        raw.device
            .queue_wait_idle(raw.graphics_queue)
            .map_err(native_error("vkQueueWaitIdle"))?;
    }
    Ok(())
}
