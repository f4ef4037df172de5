//! Fences and semaphores.

use super::{native_error, RawDevice};
use crate::{Fence, RhiError, Semaphore};
use ash::vk;
use std::sync::Arc;

pub struct VulkanFence {
    raw: Arc<RawDevice>,
    pub(crate) fence: vk::Fence,
}

impl VulkanFence {
    pub fn new(raw: Arc<RawDevice>, signaled: bool) -> Result<Self, RhiError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe {
            raw.device
                .create_fence(&info, None)
                .map_err(native_error("vkCreateFence"))?
        };
        Ok(Self { raw, fence })
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_fence(self.fence, None);
        }
    }
}

impl std::fmt::Debug for VulkanFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanFence").field("fence", &self.fence).finish()
    }
}

impl Fence for VulkanFence {
    fn wait(&self, timeout_ns: u64) -> Result<(), RhiError> {
        unsafe {
            self.raw
                .device
                .wait_for_fences(&[self.fence], true, timeout_ns)
                .map_err(native_error("vkWaitForFences"))
        }
    }

    fn reset(&self) -> Result<(), RhiError> {
        unsafe {
            self.raw
                .device
                .reset_fences(&[self.fence])
                .map_err(native_error("vkResetFences"))
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct VulkanSemaphore {
    raw: Arc<RawDevice>,
    pub(crate) semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn new(raw: Arc<RawDevice>) -> Result<Self, RhiError> {
        let semaphore = unsafe {
            raw.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(native_error("vkCreateSemaphore"))?
        };
        Ok(Self { raw, semaphore })
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

impl std::fmt::Debug for VulkanSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSemaphore").finish()
    }
}

impl Semaphore for VulkanSemaphore {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Unwrap a semaphore created by this backend; foreign ones are skipped.
pub(crate) fn vk_semaphore(semaphore: &dyn Semaphore) -> Option<vk::Semaphore> {
    semaphore
        .as_any()
        .downcast_ref::<VulkanSemaphore>()
        .map(|s| s.semaphore)
}
