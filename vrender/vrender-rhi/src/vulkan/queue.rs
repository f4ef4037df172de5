//! Graphics queue submission.

use super::sync::{vk_semaphore, VulkanFence};
use super::{native_error, RawDevice, VulkanCommandBuffer};
use crate::{CommandBuffer, Fence, Queue, RhiError, Semaphore};
use ash::vk;
use std::sync::Arc;

pub struct VulkanQueue {
    raw: Arc<RawDevice>,
    queue: vk::Queue,
}

impl VulkanQueue {
    pub fn new(raw: Arc<RawDevice>, queue: vk::Queue) -> Self {
        Self { raw, queue }
    }
}

impl std::fmt::Debug for VulkanQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanQueue").field("queue", &self.queue).finish()
    }
}

impl Queue for VulkanQueue {
    fn submit(
        &self,
        command_buffers: &[&dyn CommandBuffer],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> Result<(), RhiError> {
        let vk_buffers: Vec<vk::CommandBuffer> = command_buffers
            .iter()
            .filter_map(|b| {
                b.as_any()
                    .downcast_ref::<VulkanCommandBuffer>()
                    .map(|vb| vb.buffer)
            })
            .collect();
        if vk_buffers.is_empty() {
            return Err(RhiError::Unsupported(
                "submit without Vulkan command buffers".to_string(),
            ));
        }
        let wait_semas: Vec<vk::Semaphore> =
            wait_semaphores.iter().filter_map(|s| vk_semaphore(*s)).collect();
        let signal_semas: Vec<vk::Semaphore> =
            signal_semaphores.iter().filter_map(|s| vk_semaphore(*s)).collect();
        let fence = signal_fence
            .and_then(|f| f.as_any().downcast_ref::<VulkanFence>().map(|vf| vf.fence))
            .unwrap_or(vk::Fence::null());

        // The acquired image is first written at color attachment output.
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semas.len()];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&vk_buffers)
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semas);

        unsafe {
            self.raw
                .device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(native_error("vkQueueSubmit"))
        }
    }
}
