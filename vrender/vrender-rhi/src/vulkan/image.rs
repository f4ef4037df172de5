//! Images bound to allocator blocks, image views and the swap chain depth target.

use super::buffer::Buffer;
use super::{native_error, texture_format_to_vk, RawDevice, VulkanDevice};
use crate::{MemoryBlock, MemoryPropertyFlags, RhiError, SharedAllocator, Texture, TextureFormat};
use ash::vk::{self, Handle};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

impl ImageLayout {
    fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub extent: (u32, u32),
    pub format: TextureFormat,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: MemoryPropertyFlags,
}

/// A 2D, single-mip, optimally tiled `VkImage` bound to one [`MemoryBlock`].
pub struct Image {
    raw: Arc<RawDevice>,
    allocator: SharedAllocator,
    pub(crate) image: vk::Image,
    block: MemoryBlock,
    info: ImageInfo,
}

impl Image {
    pub fn new(
        raw: &Arc<RawDevice>,
        allocator: &SharedAllocator,
        info: ImageInfo,
    ) -> Result<Self, RhiError> {
        let (width, height) = info.extent;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(texture_format_to_vk(info.format))
            .extent(vk::Extent3D {
                width: width.max(1),
                height: height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            raw.device
                .create_image(&create_info, None)
                .map_err(native_error("vkCreateImage"))?
        };
        let requirements = unsafe { raw.device.get_image_memory_requirements(image) };
        let block = allocator
            .lock()
            .allocate_with_properties(
                requirements.size,
                requirements.alignment,
                requirements.memory_type_bits,
                info.memory_properties,
            )
            .map_err(|e| {
                unsafe { raw.device.destroy_image(image, None) };
                e
            })?;
        let bound = unsafe {
            raw.device
                .bind_image_memory(image, vk::DeviceMemory::from_raw(block.memory), block.offset)
        };
        if let Err(e) = bound {
            unsafe { raw.device.destroy_image(image, None) };
            let _ = allocator.lock().free(&block);
            return Err(native_error("vkBindImageMemory")(e));
        }
        Ok(Self {
            raw: Arc::clone(raw),
            allocator: Arc::clone(allocator),
            image,
            block,
            info,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    /// Insert a pipeline barrier moving the image between layouts.
    /// Only the upload path (undefined -> transfer dst -> shader read) is supported.
    pub fn transition_layout(
        &self,
        device: &VulkanDevice,
        old: ImageLayout,
        new: ImageLayout,
    ) -> Result<(), RhiError> {
        let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
            (ImageLayout::Undefined, ImageLayout::TransferDst) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (ImageLayout::TransferDst, ImageLayout::ShaderReadOnly) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => {
                return Err(RhiError::Unsupported(format!(
                    "layout transition {old:?} -> {new:?}"
                )))
            }
        };
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old.to_vk())
            .new_layout(new.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(color_range())
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        device.submit_wait(|dev, cmd| unsafe {
            dev.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Copy tightly packed pixels from `buffer`. The image must be in `TransferDst`.
    pub fn copy_from_buffer(&self, device: &VulkanDevice, buffer: &Buffer) -> Result<(), RhiError> {
        let (width, height) = self.info.extent;
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });
        device.submit_wait(|dev, cmd| unsafe {
            dev.cmd_copy_buffer_to_image(
                cmd,
                buffer.handle(),
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_image(self.image, None);
        }
        if let Err(e) = self.allocator.lock().free(&self.block) {
            log::error!("Image drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("extent", &self.info.extent)
            .field("format", &self.info.format)
            .field("block", &self.block)
            .finish()
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    subresource_range(vk::ImageAspectFlags::COLOR)
}

pub(crate) fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

pub struct ImageView {
    raw: Arc<RawDevice>,
    pub(crate) view: vk::ImageView,
}

impl ImageView {
    /// 2D view over `image`, which may be one this crate does not own (swap chain images).
    pub fn new(
        raw: &Arc<RawDevice>,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self, RhiError> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));
        let view = unsafe {
            raw.device
                .create_image_view(&info, None)
                .map_err(native_error("vkCreateImageView"))?
        };
        Ok(Self {
            raw: Arc::clone(raw),
            view,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_image_view(self.view, None);
        }
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView").field("view", &self.view).finish()
    }
}

/// Depth attachment shared by every swap chain framebuffer; rebuilt on resize.
#[derive(Debug)]
pub struct DepthTarget {
    // View before image: views must die first.
    view: ImageView,
    image: Image,
}

impl DepthTarget {
    pub fn new(
        raw: Arc<RawDevice>,
        allocator: &SharedAllocator,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> Result<Self, RhiError> {
        if !format.is_depth() {
            return Err(RhiError::Unsupported(format!("{format:?} is not a depth format")));
        }
        let image = Image::new(
            &raw,
            allocator,
            ImageInfo {
                extent,
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                memory_properties: MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;
        let view = ImageView::new(
            &raw,
            image.image,
            texture_format_to_vk(format),
            vk::ImageAspectFlags::DEPTH,
        )?;
        Ok(Self { view, image })
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.view
    }
}

impl Texture for DepthTarget {
    fn format(&self) -> TextureFormat {
        self.image.info.format
    }

    fn size(&self) -> (u32, u32) {
        self.image.info.extent
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
