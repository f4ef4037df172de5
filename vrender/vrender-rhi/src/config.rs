//! Renderer configuration: allocator sizing, swap chain preferences, validation.

use crate::{ClearColor, ColorSpace, PresentMode, SurfaceFormat, TextureFormat};

/// Device memory allocator tuning.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Smallest native reservation, in pages of `bufferImageGranularity`.
    pub min_allocation_pages: u64,
    /// Share of each heap the allocator expects to use before warning.
    pub heap_budget_percent: u8,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_allocation_pages: 10,
            heap_budget_percent: 75,
        }
    }
}

/// Swap chain selection preferences. Each falls back when the surface lacks it.
#[derive(Clone, Debug)]
pub struct SwapchainConfig {
    /// Exact (format, color space) pair to look for; otherwise the first reported format.
    pub preferred_format: SurfaceFormat,
    /// Preferred present mode; otherwise FIFO.
    pub preferred_present_mode: PresentMode,
    pub depth_format: TextureFormat,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            preferred_format: SurfaceFormat {
                format: TextureFormat::Bgra8UnormSrgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
            preferred_present_mode: PresentMode::Mailbox,
            depth_format: TextureFormat::D32Float,
        }
    }
}

/// Top-level configuration handed to device, swap chain and renderer construction.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub application_name: String,
    /// Enable `VK_LAYER_KHRONOS_validation` and route its messages to `log`.
    pub validation: bool,
    pub clear_color: ClearColor,
    pub allocator: AllocatorConfig,
    pub swapchain: SwapchainConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "vrender".to_string(),
            validation: cfg!(feature = "validation"),
            clear_color: ClearColor {
                r: 0.01,
                g: 0.01,
                b: 0.01,
                a: 1.0,
            },
            allocator: AllocatorConfig::default(),
            swapchain: SwapchainConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Defaults with `VRENDER_VALIDATION` and `VRENDER_PRESENT_MODE` applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var("VRENDER_VALIDATION") {
            self.validation |= matches!(value.trim(), "1" | "true" | "on");
        }
        if let Some(value) = var("VRENDER_PRESENT_MODE") {
            match parse_present_mode(&value) {
                Some(mode) => self.swapchain.preferred_present_mode = mode,
                None => log::warn!("Ignoring unknown VRENDER_PRESENT_MODE {:?}", value),
            }
        }
        self
    }
}

fn parse_present_mode(value: &str) -> Option<PresentMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fifo" => Some(PresentMode::Fifo),
        "fifo_relaxed" => Some(PresentMode::FifoRelaxed),
        "mailbox" => Some(PresentMode::Mailbox),
        "immediate" => Some(PresentMode::Immediate),
        _ => None,
    }
}
