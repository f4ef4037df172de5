//! Vulkan backend for VRender RHI.
//! Implements MemoryDevice, Device, Queue, Fence, Semaphore, CommandBuffer, Swapchain, Texture.

mod buffer;
mod command;
mod debug;
mod image;
mod queue;
mod sync;
mod texture;

#[cfg(feature = "window")]
mod render_pass;
#[cfg(feature = "window")]
mod swapchain;

use crate::memory::{MemoryHeap, MemoryType};
use crate::{
    ColorSpace, CommandBuffer, Device, DeviceLimits, Fence, MemoryDevice, MemoryHandle,
    MemoryProperties, MemoryPropertyFlags, PresentMode, Queue, RendererConfig, RhiError,
    Semaphore, SharedAllocator, SurfaceFormat, SurfaceSupport, Swapchain, SwapchainDescriptor,
    Texture as TextureTrait, TextureFormat,
};
pub use ash::vk;
use ash::vk::Handle;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;

pub use buffer::{Buffer, BufferInfo, UniformBuffer, Vertex, VertexBuffer};
pub use command::VulkanCommandBuffer;
pub use image::{DepthTarget, Image, ImageInfo, ImageLayout, ImageView};
pub use queue::VulkanQueue;
pub use sync::{VulkanFence, VulkanSemaphore};
pub use texture::Texture;

#[cfg(feature = "window")]
pub use swapchain::VulkanSwapchain;

use debug::DebugMessenger;

/// Log a failed native call and convert it into [`RhiError::Native`].
pub(crate) fn native_error(operation: &'static str) -> impl Fn(vk::Result) -> RhiError {
    move |e| {
        log::error!("{} failed: {:?}", operation, e);
        RhiError::native(operation, e.as_raw())
    }
}

/// Instance-level objects. Destroyed last, after every device built on them.
pub struct RawInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<DebugMessenger>,
    pub(crate) surface: Option<SurfaceState>,
}

pub(crate) struct SurfaceState {
    pub(crate) loader: ash::khr::surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
}

impl Drop for RawInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.surface, None);
            }
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Logical device, queues and the command pool. Every Vulkan resource keeps
/// an `Arc` to this so the device outlives them.
pub struct RawDevice {
    pub instance: Arc<RawInstance>,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub command_pool: vk::CommandPool,
    pub(crate) swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) anisotropy_enabled: bool,
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

impl std::fmt::Debug for RawDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDevice")
            .field("physical_device", &self.physical_device)
            .field("graphics_family", &self.graphics_family)
            .field("present_family", &self.present_family)
            .finish_non_exhaustive()
    }
}

/// Queue families a physical device offers for our purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueFamilies {
    graphics: u32,
    present: u32,
}

pub struct VulkanDevice {
    raw: Arc<RawDevice>,
    queue: VulkanQueue,
    memory_properties: MemoryProperties,
    limits: DeviceLimits,
}

impl VulkanDevice {
    /// Headless device: no surface, no swap chain. Enough for memory, buffers and uploads.
    pub fn new(config: &RendererConfig) -> Result<Arc<Self>, RhiError> {
        let instance = create_instance(config, &[])?;
        Self::from_instance(Arc::new(instance))
    }

    #[cfg(feature = "window")]
    /// Create a Vulkan device with a window surface for swap chain presentation.
    pub fn new_with_surface(
        window: &(impl raw_window_handle::HasDisplayHandle + raw_window_handle::HasWindowHandle),
        config: &RendererConfig,
    ) -> Result<Arc<Self>, RhiError> {
        let display = window
            .display_handle()
            .map_err(|e| RhiError::Window(format!("display handle: {e}")))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| RhiError::Window(format!("window handle: {e}")))?
            .as_raw();
        let extensions = ash_window::enumerate_required_extensions(display)
            .map_err(native_error("vkEnumerateInstanceExtensionProperties"))?;
        let mut instance = create_instance(config, extensions)?;
        let surface = unsafe {
            ash_window::create_surface(&instance.entry, &instance.instance, display, handle, None)
                .map_err(native_error("vkCreateSurfaceKHR"))?
        };
        instance.surface = Some(SurfaceState {
            loader: ash::khr::surface::Instance::new(&instance.entry, &instance.instance),
            surface,
        });
        Self::from_instance(Arc::new(instance))
    }

    fn from_instance(instance: Arc<RawInstance>) -> Result<Arc<Self>, RhiError> {
        let physical_devices = unsafe {
            instance
                .instance
                .enumerate_physical_devices()
                .map_err(native_error("vkEnumeratePhysicalDevices"))?
        };
        let (physical_device, families, score) = physical_devices
            .iter()
            .filter_map(|&pd| {
                let (score, families) = rate_physical_device(&instance, pd);
                families.map(|f| (pd, f, score))
            })
            .max_by_key(|(_, _, score)| *score)
            .filter(|(_, _, score)| *score > 0)
            .ok_or_else(|| {
                log::error!("None of {} physical devices is usable", physical_devices.len());
                RhiError::NoSuitableDevice(format!(
                    "{} physical devices enumerated, none usable",
                    physical_devices.len()
                ))
            })?;

        let properties =
            unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.instance.get_physical_device_features(physical_device) };
        log::info!(
            "Using {:?} ({:?}), score {}",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
            score
        );

        let priorities = [1.0f32];
        let mut unique_families = vec![families.graphics];
        if families.present != families.graphics {
            unique_families.push(families.present);
        }
        let queue_infos = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect::<Vec<_>>();
        let anisotropy_enabled = features.sampler_anisotropy == vk::TRUE;
        let enabled_features =
            vk::PhysicalDeviceFeatures::default().sampler_anisotropy(anisotropy_enabled);
        let has_surface = instance.surface.is_some();
        let extension_names = if has_surface {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            Vec::new()
        };
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&enabled_features);
        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &device_info, None)
                .map_err(native_error("vkCreateDevice"))?
        };

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(native_error("vkCreateCommandPool")(e));
            }
        };
        let swapchain_loader =
            has_surface.then(|| ash::khr::swapchain::Device::new(&instance.instance, &device));

        let vk_memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };
        let memory_properties = convert_memory_properties(&vk_memory_properties);
        let limits = DeviceLimits {
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        };

        let raw = Arc::new(RawDevice {
            instance,
            physical_device,
            device,
            graphics_family: families.graphics,
            present_family: families.present,
            graphics_queue,
            present_queue,
            command_pool,
            swapchain_loader,
            properties,
            anisotropy_enabled,
        });
        Ok(Arc::new(Self {
            queue: VulkanQueue::new(Arc::clone(&raw), graphics_queue),
            raw,
            memory_properties,
            limits,
        }))
    }

    pub fn raw(&self) -> &Arc<RawDevice> {
        &self.raw
    }

    /// Record into a one-time command buffer, submit it and wait for completion.
    pub fn submit_wait(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<(), RhiError> {
        command::submit_wait(&self.raw, record)
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("raw", &self.raw)
            .field("limits", &self.limits)
            .finish()
    }
}

fn create_instance(
    config: &RendererConfig,
    window_extensions: &[*const std::ffi::c_char],
) -> Result<RawInstance, RhiError> {
    let entry = unsafe {
        ash::Entry::load().map_err(|e| {
            log::error!("Unable to load the Vulkan loader: {}", e);
            RhiError::Unsupported(format!("Vulkan loader: {e}"))
        })?
    };
    let app_name = CString::new(config.application_name.as_str())
        .unwrap_or_else(|_| CString::from(c"vrender"));
    let app_info = vk::ApplicationInfo::default()
        .api_version(vk::API_VERSION_1_2)
        .application_name(&app_name)
        .engine_name(c"vrender");

    let validation = config.validation && debug::validation_layer_available(&entry);
    if config.validation && !validation {
        log::warn!("Validation requested but {:?} is not installed", debug::VALIDATION_LAYER);
    }
    let mut extensions = window_extensions.to_vec();
    let mut layers = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        layers.push(debug::VALIDATION_LAYER.as_ptr());
    }
    let instance_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    let instance = unsafe {
        entry
            .create_instance(&instance_info, None)
            .map_err(native_error("vkCreateInstance"))?
    };

    let debug = if validation {
        match DebugMessenger::new(&entry, &instance) {
            Ok(messenger) => Some(messenger),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(native_error("vkCreateDebugUtilsMessengerEXT")(e));
            }
        }
    } else {
        None
    };
    log::info!("Vulkan instance created (validation: {})", validation);
    Ok(RawInstance {
        entry,
        instance,
        debug,
        surface: None,
    })
}

/// Score a physical device; zero (or `None` families) means unusable.
///
/// Needs a graphics queue and, when a surface exists, presentation support,
/// `VK_KHR_swapchain` and at least one surface format and present mode.
/// Discrete GPUs get a large bonus; the max 2D image size breaks ties.
fn rate_physical_device(
    instance: &RawInstance,
    physical_device: vk::PhysicalDevice,
) -> (u32, Option<QueueFamilies>) {
    let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
    let Some(families) = find_queue_families(instance, physical_device) else {
        return (0, None);
    };
    if let Some(surface) = &instance.surface {
        if !supports_extension(instance, physical_device, ash::khr::swapchain::NAME) {
            return (0, None);
        }
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(physical_device, surface.surface)
                .unwrap_or_default()
        };
        let modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(physical_device, surface.surface)
                .unwrap_or_default()
        };
        if formats.is_empty() || modes.is_empty() {
            return (0, None);
        }
    }

    let mut score = properties.limits.max_image_dimension2_d;
    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 1000;
    }
    log::debug!(
        "Physical device {:?}: score {}",
        properties.device_name_as_c_str().unwrap_or(c"unknown"),
        score
    );
    (score, Some(families))
}

fn find_queue_families(
    instance: &RawInstance,
    physical_device: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let families = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical_device)
    };
    let graphics = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;
    let Some(surface) = &instance.surface else {
        return Some(QueueFamilies {
            graphics,
            present: graphics,
        });
    };
    let presents = |family: u32| unsafe {
        surface
            .loader
            .get_physical_device_surface_support(physical_device, family, surface.surface)
            .unwrap_or(false)
    };
    // Prefer one family that does both.
    if presents(graphics) {
        return Some(QueueFamilies {
            graphics,
            present: graphics,
        });
    }
    let present = (0..families.len() as u32).find(|&family| presents(family))?;
    Some(QueueFamilies { graphics, present })
}

fn supports_extension(
    instance: &RawInstance,
    physical_device: vk::PhysicalDevice,
    name: &CStr,
) -> bool {
    unsafe {
        instance
            .instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(name))
    }
}

fn convert_memory_properties(props: &vk::PhysicalDeviceMemoryProperties) -> MemoryProperties {
    MemoryProperties {
        memory_types: props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryType {
                property_flags: MemoryPropertyFlags::from_bits_truncate(ty.property_flags.as_raw()),
                heap_index: ty.heap_index,
            })
            .collect(),
        memory_heaps: props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeap {
                size: heap.size,
                device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            })
            .collect(),
    }
}

pub(crate) fn texture_format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Other(raw) => vk::Format::from_raw(raw),
    }
}

pub(crate) fn texture_format_from_vk(format: vk::Format) -> TextureFormat {
    match format {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8UnormSrgb,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8UnormSrgb,
        vk::Format::D32_SFLOAT => TextureFormat::D32Float,
        vk::Format::D24_UNORM_S8_UINT => TextureFormat::D24UnormS8Uint,
        other => TextureFormat::Other(other.as_raw()),
    }
}

#[cfg_attr(not(feature = "window"), allow(dead_code))]
pub(crate) fn color_space_to_vk(color_space: ColorSpace) -> vk::ColorSpaceKHR {
    match color_space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Other(raw) => vk::ColorSpaceKHR::from_raw(raw),
    }
}

pub(crate) fn color_space_from_vk(color_space: vk::ColorSpaceKHR) -> ColorSpace {
    match color_space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        other => ColorSpace::Other(other.as_raw()),
    }
}

#[cfg_attr(not(feature = "window"), allow(dead_code))]
pub(crate) fn present_mode_to_vk(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

fn present_mode_from_vk(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

impl MemoryDevice for VulkanDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<MemoryHandle, RhiError> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.raw.device.allocate_memory(&info, None) }.map_err(|e| {
            log::error!("vkAllocateMemory of {} bytes failed: {:?}", size, e);
            match e {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    RhiError::OutOfDeviceMemory {
                        size,
                        memory_type_index,
                    }
                }
                other => RhiError::native("vkAllocateMemory", other.as_raw()),
            }
        })?;
        Ok(memory.as_raw())
    }

    fn free_memory(&self, memory: MemoryHandle) {
        unsafe {
            self.raw
                .device
                .free_memory(vk::DeviceMemory::from_raw(memory), None);
        }
    }

    fn map_memory(&self, memory: MemoryHandle, size: u64) -> Result<NonNull<u8>, RhiError> {
        let ptr = unsafe {
            self.raw
                .device
                .map_memory(
                    vk::DeviceMemory::from_raw(memory),
                    0,
                    size,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(native_error("vkMapMemory"))?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            log::error!("vkMapMemory returned a null pointer");
            RhiError::native("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED.as_raw())
        })
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        unsafe {
            self.raw
                .device
                .unmap_memory(vk::DeviceMemory::from_raw(memory));
        }
    }
}

impl Device for VulkanDevice {
    fn create_fence(&self, signaled: bool) -> Result<Box<dyn Fence>, RhiError> {
        Ok(Box::new(VulkanFence::new(Arc::clone(&self.raw), signaled)?))
    }

    fn create_semaphore(&self) -> Result<Box<dyn Semaphore>, RhiError> {
        Ok(Box::new(VulkanSemaphore::new(Arc::clone(&self.raw))?))
    }

    fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<Box<dyn CommandBuffer>>, RhiError> {
        Ok(VulkanCommandBuffer::allocate(&self.raw, count)?
            .into_iter()
            .map(|cb| Box::new(cb) as Box<dyn CommandBuffer>)
            .collect())
    }

    fn graphics_queue(&self) -> &dyn Queue {
        &self.queue
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        unsafe {
            self.raw
                .device
                .device_wait_idle()
                .map_err(native_error("vkDeviceWaitIdle"))
        }
    }

    fn surface_support(&self) -> Result<SurfaceSupport, RhiError> {
        let surface = self
            .raw
            .instance
            .surface
            .as_ref()
            .ok_or_else(|| {
                RhiError::Unsupported("device was created without a surface".to_string())
            })?;
        let pd = self.raw.physical_device;
        let (caps, formats, modes) = unsafe {
            (
                surface
                    .loader
                    .get_physical_device_surface_capabilities(pd, surface.surface)
                    .map_err(native_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?,
                surface
                    .loader
                    .get_physical_device_surface_formats(pd, surface.surface)
                    .map_err(native_error("vkGetPhysicalDeviceSurfaceFormatsKHR"))?,
                surface
                    .loader
                    .get_physical_device_surface_present_modes(pd, surface.surface)
                    .map_err(native_error("vkGetPhysicalDeviceSurfacePresentModesKHR"))?,
            )
        };
        let current = caps.current_extent;
        Ok(SurfaceSupport {
            capabilities: crate::SurfaceCapabilities {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent: (current.width != u32::MAX)
                    .then_some((current.width, current.height)),
                min_extent: (caps.min_image_extent.width, caps.min_image_extent.height),
                max_extent: (caps.max_image_extent.width, caps.max_image_extent.height),
            },
            formats: formats
                .iter()
                .map(|f| SurfaceFormat {
                    format: texture_format_from_vk(f.format),
                    color_space: color_space_from_vk(f.color_space),
                })
                .collect(),
            present_modes: modes.into_iter().filter_map(present_mode_from_vk).collect(),
        })
    }

    #[cfg(feature = "window")]
    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        depth: &dyn TextureTrait,
    ) -> Result<Box<dyn Swapchain>, RhiError> {
        let depth = depth
            .as_any()
            .downcast_ref::<DepthTarget>()
            .ok_or_else(|| {
                RhiError::Unsupported("depth target is not a Vulkan DepthTarget".to_string())
            })?;
        Ok(Box::new(VulkanSwapchain::new(Arc::clone(&self.raw), desc, depth)?))
    }

    #[cfg(not(feature = "window"))]
    fn create_swapchain(
        &self,
        _desc: &SwapchainDescriptor,
        _depth: &dyn TextureTrait,
    ) -> Result<Box<dyn Swapchain>, RhiError> {
        Err(RhiError::Unsupported(
            "swap chains need the `window` feature".to_string(),
        ))
    }

    fn create_depth_target(
        &self,
        allocator: &SharedAllocator,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> Result<Box<dyn TextureTrait>, RhiError> {
        Ok(Box::new(DepthTarget::new(
            Arc::clone(&self.raw),
            allocator,
            extent,
            format,
        )?))
    }
}
