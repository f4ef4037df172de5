//! VRender RHI: GPU device memory sub-allocation and swap chain frame pacing.
//!
//! The crate root defines the backend seam (device, queue, sync objects,
//! command buffers, native swap chains, window). [`memory`], [`swapchain`] and
//! [`renderer`] are written against that seam only; the Vulkan backend lives in
//! [`vulkan`] behind the `vulkan` feature.

use std::any::Any;
use std::fmt::Debug;
use std::ptr::NonNull;

pub mod config;
mod error;
pub mod memory;
pub mod renderer;
pub mod swapchain;

#[cfg(test)]
mod fake;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use config::{AllocatorConfig, RendererConfig, SwapchainConfig};
pub use error::RhiError;
pub use memory::{
    DeviceMemoryAllocator, MemoryAllocation, MemoryBlock, MemoryHandle, MemoryProperties,
    MemoryPropertyFlags, SharedAllocator,
};
pub use renderer::Renderer;
pub use swapchain::{SwapChain, SwapChainState, MAX_FRAMES_IN_FLIGHT};

/// Pixel formats used by presentable images and attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    D32Float,
    D24UnormS8Uint,
    /// A native format this crate has no name for.
    Other(i32),
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonlinear,
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: TextureFormat,
    pub color_space: ColorSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    /// Low-latency triple buffering.
    Mailbox,
    /// Vsync; always supported.
    Fifo,
    FifoRelaxed,
}

/// What the surface currently allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means no upper limit.
    pub max_image_count: u32,
    /// `None` when the platform lets the swap chain pick its own extent.
    pub current_extent: Option<(u32, u32)>,
    pub min_extent: (u32, u32),
    pub max_extent: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSupport {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

/// Parameters for a native swap chain plus its render pass and framebuffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub extent: (u32, u32),
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub image_count: u32,
    pub depth_format: TextureFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub buffer_image_granularity: u64,
    pub max_sampler_anisotropy: f32,
    pub max_image_dimension_2d: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with the `[0, 1]` depth range.
    pub fn from_extent(extent: (u32, u32)) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.0 as f32,
            height: extent.1 as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn from_extent(extent: (u32, u32)) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.0,
            height: extent.1,
        }
    }
}

/// Outcome of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Image { index: u32, suboptimal: bool },
    /// The surface changed; the swap chain must be recreated before rendering.
    OutOfDate,
}

/// Outcome of a present. Only native failures are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// Native memory reservation, the part of a device the allocator needs.
pub trait MemoryDevice: Send + Sync + Debug {
    fn memory_properties(&self) -> MemoryProperties;
    fn limits(&self) -> DeviceLimits;
    /// Reserve `size` bytes of memory type `memory_type_index` in one native call.
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<MemoryHandle, RhiError>;
    fn free_memory(&self, memory: MemoryHandle);
    /// Map all of `memory` into host address space. Only called once per
    /// host-visible reservation; the mapping stays until `unmap_memory`.
    fn map_memory(&self, memory: MemoryHandle, size: u64) -> Result<NonNull<u8>, RhiError>;
    fn unmap_memory(&self, memory: MemoryHandle);
}

/// The device trait the swap chain and renderer drive.
pub trait Device: MemoryDevice {
    fn create_fence(&self, signaled: bool) -> Result<Box<dyn Fence>, RhiError>;
    fn create_semaphore(&self) -> Result<Box<dyn Semaphore>, RhiError>;
    /// Allocate primary command buffers from the device's resettable pool.
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<Box<dyn CommandBuffer>>, RhiError>;
    /// Queue used for frame submissions.
    fn graphics_queue(&self) -> &dyn Queue;
    /// Wait until all submitted work has finished.
    fn wait_idle(&self) -> Result<(), RhiError>;
    /// Query the presentation surface. Fails on headless devices.
    fn surface_support(&self) -> Result<SurfaceSupport, RhiError>;
    /// Create the native swap chain with its image views, render pass and
    /// framebuffers. `depth` is attached to every framebuffer.
    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        depth: &dyn Texture,
    ) -> Result<Box<dyn Swapchain>, RhiError>;
    /// Create a depth attachment backed by `allocator`.
    fn create_depth_target(
        &self,
        allocator: &SharedAllocator,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> Result<Box<dyn Texture>, RhiError>;
}

/// CPU-GPU synchronization.
pub trait Fence: Debug {
    /// Block until signaled or `timeout_ns` elapses.
    fn wait(&self, timeout_ns: u64) -> Result<(), RhiError>;
    fn reset(&self) -> Result<(), RhiError>;
    fn as_any(&self) -> &dyn Any;
}

/// GPU-GPU synchronization.
pub trait Semaphore: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait Queue: Debug {
    /// Submit `command_buffers`. Each wait semaphore blocks the color
    /// attachment output stage; `signal_fence` is signaled on completion.
    fn submit(
        &self,
        command_buffers: &[&dyn CommandBuffer],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> Result<(), RhiError>;
}

/// A primary command buffer, re-recorded every time its frame slot comes around.
pub trait CommandBuffer: Debug {
    /// Reset and begin recording.
    fn begin(&mut self) -> Result<(), RhiError>;
    fn end(&mut self) -> Result<(), RhiError>;
    /// Begin the swap chain's render pass on the framebuffer of `image_index`.
    fn begin_render_pass(&mut self, target: &dyn Swapchain, image_index: u32, clear: ClearColor);
    fn end_render_pass(&mut self);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, scissor: Rect2D);
    fn as_any(&self) -> &dyn Any;
}

/// The presentation engine's image chain.
pub trait Swapchain: Debug {
    /// Acquire the next image, signaling `signal` when it is ready to be written.
    fn acquire_next_image(
        &mut self,
        signal: &dyn Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireResult, RhiError>;
    /// Present `image_index` once `wait` is signaled.
    fn present(&self, image_index: u32, wait: &dyn Semaphore) -> Result<PresentStatus, RhiError>;
    fn extent(&self) -> (u32, u32);
    fn image_count(&self) -> u32;
    fn format(&self) -> SurfaceFormat;
    fn present_mode(&self) -> PresentMode;
    fn as_any(&self) -> &dyn Any;
}

pub trait Texture: Debug {
    fn format(&self) -> TextureFormat;
    fn size(&self) -> (u32, u32);
    fn as_any(&self) -> &dyn Any;
}

/// The window the swap chain presents to.
pub trait Window: Debug {
    /// Current framebuffer size in pixels; zero while minimized.
    fn extent(&self) -> (u32, u32);
    fn framebuffer_resized(&self) -> bool;
    fn set_framebuffer_resized(&self, resized: bool);
    /// Block until the window has something new to report.
    fn wait_events(&self);
}
