//! Vulkan swap chain with its image views, render pass and framebuffers (feature "window").

use super::image::{DepthTarget, ImageView};
use super::render_pass::{create_framebuffers, create_render_pass};
use super::sync::vk_semaphore;
use super::{
    color_space_to_vk, native_error, present_mode_to_vk, texture_format_to_vk, RawDevice,
};
use crate::{
    AcquireResult, PresentMode, PresentStatus, RhiError, Semaphore, SurfaceFormat, Swapchain,
    SwapchainDescriptor,
};
use ash::khr::swapchain::Device as SwapchainDevice;
use ash::vk;
use std::sync::Arc;

pub struct VulkanSwapchain {
    raw: Arc<RawDevice>,
    loader: SwapchainDevice,
    swapchain: vk::SwapchainKHR,
    // Swap chain images are owned by the swap chain; only views are ours.
    views: Vec<ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: (u32, u32),
    format: SurfaceFormat,
    present_mode: PresentMode,
}

impl VulkanSwapchain {
    pub fn new(
        raw: Arc<RawDevice>,
        desc: &SwapchainDescriptor,
        depth: &DepthTarget,
    ) -> Result<Self, RhiError> {
        let loader = raw
            .swapchain_loader
            .clone()
            .ok_or_else(|| RhiError::Unsupported("device has no swap chain support".to_string()))?;
        let surface = raw
            .instance
            .surface
            .as_ref()
            .ok_or_else(|| {
                RhiError::Unsupported("device was created without a surface".to_string())
            })?;
        let capabilities = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(raw.physical_device, surface.surface)
                .map_err(native_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?
        };

        let color_format = texture_format_to_vk(desc.format.format);
        let families = [raw.graphics_family, raw.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(desc.image_count)
            .image_format(color_format)
            .image_color_space(color_space_to_vk(desc.format.color_space))
            .image_extent(vk::Extent2D {
                width: desc.extent.0,
                height: desc.extent.1,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode_to_vk(desc.present_mode))
            .clipped(true);
        create_info = if raw.graphics_family != raw.present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };
        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(native_error("vkCreateSwapchainKHR"))?
        };

        // From here on, Drop cleans up whatever has been created.
        let mut chain = Self {
            raw,
            loader,
            swapchain,
            views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            extent: desc.extent,
            format: desc.format,
            present_mode: desc.present_mode,
        };
        let images = unsafe {
            chain
                .loader
                .get_swapchain_images(chain.swapchain)
                .map_err(native_error("vkGetSwapchainImagesKHR"))?
        };
        for image in images {
            let view =
                ImageView::new(&chain.raw, image, color_format, vk::ImageAspectFlags::COLOR)?;
            chain.views.push(view);
        }
        chain.render_pass = create_render_pass(
            &chain.raw,
            color_format,
            texture_format_to_vk(desc.depth_format),
        )?;
        let color_views = chain.views.iter().map(ImageView::handle).collect::<Vec<_>>();
        chain.framebuffers = create_framebuffers(
            &chain.raw,
            chain.render_pass,
            &color_views,
            depth.view(),
            desc.extent,
        )?;
        log::debug!(
            "VulkanSwapchain: {} images, {:?}, sharing {}",
            chain.views.len(),
            color_format,
            if chain.raw.graphics_family != chain.raw.present_family {
                "concurrent"
            } else {
                "exclusive"
            }
        );
        Ok(chain)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.raw.device.destroy_framebuffer(framebuffer, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                self.raw.device.destroy_render_pass(self.render_pass, None);
            }
            self.views.clear();
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain")
            .field("extent", &self.extent)
            .field("image_count", &self.views.len())
            .field("present_mode", &self.present_mode)
            .finish()
    }
}

impl Swapchain for VulkanSwapchain {
    fn acquire_next_image(
        &mut self,
        signal: &dyn Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireResult, RhiError> {
        let semaphore = vk_semaphore(signal).unwrap_or(vk::Semaphore::null());
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireResult::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(native_error("vkAcquireNextImageKHR")(e)),
        }
    }

    fn present(&self, image_index: u32, wait: &dyn Semaphore) -> Result<PresentStatus, RhiError> {
        let wait_semas: Vec<vk::Semaphore> = vk_semaphore(wait).into_iter().collect();
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semas)
            .swapchains(std::slice::from_ref(&self.swapchain))
            .image_indices(&image_indices);
        let result = unsafe {
            self.loader
                .queue_present(self.raw.present_queue, &present_info)
        };
        match result {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(native_error("vkQueuePresentKHR")(e)),
        }
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.views.len() as u32
    }

    fn format(&self) -> SurfaceFormat {
        self.format
    }

    fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
