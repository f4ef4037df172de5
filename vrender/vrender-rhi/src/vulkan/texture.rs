//! Sampled 2D textures uploaded from RGBA8 pixels.

use super::buffer::{Buffer, BufferInfo};
use super::image::{Image, ImageInfo, ImageLayout, ImageView};
use super::{native_error, texture_format_to_vk, RawDevice, VulkanDevice};
use crate::{MemoryPropertyFlags, RhiError, SharedAllocator, Texture as TextureTrait, TextureFormat};
use ash::vk;
use std::sync::Arc;

/// Image, view and sampler. Pixel decoding happens before this point.
pub struct Texture {
    raw: Arc<RawDevice>,
    sampler: vk::Sampler,
    view: ImageView,
    image: Image,
}

impl Texture {
    /// Upload `pixels` (`width * height` RGBA8 texels, sRGB) through a staging buffer.
    pub fn from_rgba8(
        device: &VulkanDevice,
        allocator: &SharedAllocator,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self, RhiError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(RhiError::Unsupported(format!(
                "{}x{} texture needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        let raw = device.raw();
        let format = TextureFormat::Rgba8UnormSrgb;

        let staging = Buffer::new(
            device,
            allocator,
            BufferInfo {
                size: pixels.len() as u64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                memory_properties: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
            },
        )?;
        staging.copy_data(pixels, 0)?;

        let image = Image::new(
            raw,
            allocator,
            ImageInfo {
                extent: (width, height),
                format,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                memory_properties: MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;
        image.transition_layout(device, ImageLayout::Undefined, ImageLayout::TransferDst)?;
        image.copy_from_buffer(device, &staging)?;
        image.transition_layout(device, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)?;
        drop(staging);

        let view = ImageView::new(
            raw,
            image.handle(),
            texture_format_to_vk(format),
            vk::ImageAspectFlags::COLOR,
        )?;
        let sampler = create_sampler(raw)?;
        log::debug!("Texture {}x{} uploaded", width, height);
        Ok(Self {
            raw: Arc::clone(raw),
            sampler,
            view,
            image,
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Descriptor info for a combined image sampler binding.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view.handle(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Linear filtering, repeat addressing, anisotropy at the device maximum when enabled.
fn create_sampler(raw: &Arc<RawDevice>) -> Result<vk::Sampler, RhiError> {
    let max_anisotropy = raw.properties.limits.max_sampler_anisotropy.max(1.0);
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(raw.anisotropy_enabled)
        .max_anisotropy(if raw.anisotropy_enabled { max_anisotropy } else { 1.0 })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);
    unsafe {
        raw.device
            .create_sampler(&info, None)
            .map_err(native_error("vkCreateSampler"))
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_sampler(self.sampler, None);
        }
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl TextureTrait for Texture {
    fn format(&self) -> TextureFormat {
        self.image.info().format
    }

    fn size(&self) -> (u32, u32) {
        self.image.info().extent
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
