//! Swap chain lifecycle and frame-in-flight synchronization.
//!
//! [`SwapChain`] wraps the backend's native [`Swapchain`] together with the
//! depth target and one [`FrameSync`] per frame slot. It is rebuilt wholesale
//! whenever the surface goes stale.

use crate::{
    AcquireResult, CommandBuffer, Device, Fence, PresentMode, PresentStatus, RhiError, Semaphore,
    SharedAllocator, SurfaceCapabilities, SurfaceFormat, Swapchain, SwapchainConfig,
    SwapchainDescriptor, Texture, Window,
};
use std::sync::Arc;

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapChainState {
    Uninitialized,
    Ready,
    Recreating,
    Destroyed,
}

/// Sync objects of one frame slot.
#[derive(Debug)]
pub struct FrameSync {
    pub image_available: Box<dyn Semaphore>,
    pub render_finished: Box<dyn Semaphore>,
    pub in_flight: Box<dyn Fence>,
}

impl FrameSync {
    /// The fence starts signaled so the first wait on the slot returns at once.
    pub fn new(device: &dyn Device) -> Result<Self, RhiError> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
        })
    }
}

/// Exact match on `preferred`, otherwise the first available format.
pub fn choose_surface_format(
    available: &[SurfaceFormat],
    preferred: SurfaceFormat,
) -> Option<SurfaceFormat> {
    available
        .iter()
        .copied()
        .find(|f| *f == preferred)
        .or_else(|| available.first().copied())
}

/// `preferred` when offered, otherwise FIFO.
pub fn choose_present_mode(available: &[PresentMode], preferred: PresentMode) -> PresentMode {
    if available.contains(&preferred) {
        preferred
    } else {
        PresentMode::Fifo
    }
}

/// The surface's current extent when it defines one, otherwise the window
/// size clamped to the surface limits.
pub fn choose_extent(capabilities: &SurfaceCapabilities, window_extent: (u32, u32)) -> (u32, u32) {
    if let Some(extent) = capabilities.current_extent {
        return extent;
    }
    (
        window_extent
            .0
            .clamp(capabilities.min_extent.0, capabilities.max_extent.0),
        window_extent
            .1
            .clamp(capabilities.min_extent.1, capabilities.max_extent.1),
    )
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn choose_image_count(capabilities: &SurfaceCapabilities) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Presentable images, depth target and per-frame sync objects, plus the
/// acquire/submit/present protocol and resize recovery.
pub struct SwapChain {
    device: Arc<dyn Device>,
    allocator: SharedAllocator,
    window: Arc<dyn Window>,
    config: SwapchainConfig,
    state: SwapChainState,
    native: Option<Box<dyn Swapchain>>,
    depth: Option<Box<dyn Texture>>,
    frames: Vec<FrameSync>,
    /// Frame slot that last rendered to each image.
    images_in_flight: Vec<Option<usize>>,
    current_frame: usize,
    recreate_count: u64,
}

impl SwapChain {
    pub fn new(
        device: Arc<dyn Device>,
        allocator: SharedAllocator,
        window: Arc<dyn Window>,
        config: SwapchainConfig,
    ) -> Result<Self, RhiError> {
        let mut swap_chain = Self {
            device,
            allocator,
            window,
            config,
            state: SwapChainState::Uninitialized,
            native: None,
            depth: None,
            frames: Vec::new(),
            images_in_flight: Vec::new(),
            current_frame: 0,
            recreate_count: 0,
        };
        swap_chain.init()?;
        Ok(swap_chain)
    }

    fn init(&mut self) -> Result<(), RhiError> {
        let support = self.device.surface_support()?;
        let format = choose_surface_format(&support.formats, self.config.preferred_format)
            .ok_or_else(|| RhiError::Unsupported("surface reports no formats".to_string()))?;
        let present_mode =
            choose_present_mode(&support.present_modes, self.config.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, self.window.extent());
        let desc = SwapchainDescriptor {
            extent,
            format,
            present_mode,
            image_count: choose_image_count(&support.capabilities),
            depth_format: self.config.depth_format,
        };

        let depth = self
            .device
            .create_depth_target(&self.allocator, extent, self.config.depth_format)?;
        let native = self.device.create_swapchain(&desc, depth.as_ref())?;
        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(self.device.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Swap chain ready: {}x{}, {:?}, {:?}, {} images",
            native.extent().0,
            native.extent().1,
            native.format().format,
            native.present_mode(),
            native.image_count()
        );
        self.images_in_flight = vec![None; native.image_count() as usize];
        self.native = Some(native);
        self.depth = Some(depth);
        self.frames = frames;
        self.state = SwapChainState::Ready;
        Ok(())
    }

    /// Framebuffers reference the depth view, so the native chain goes first.
    fn cleanup(&mut self) {
        self.native = None;
        self.depth = None;
        self.frames.clear();
        self.images_in_flight.clear();
    }

    /// Tear down and rebuild everything at the window's current size.
    ///
    /// While the window reports a zero extent (minimized) this spins on
    /// [`Window::wait_events`] and does not return until it is visible again.
    pub fn recreate(&mut self) -> Result<(), RhiError> {
        self.state = SwapChainState::Recreating;
        let mut extent = self.window.extent();
        while extent.0 == 0 || extent.1 == 0 {
            self.window.wait_events();
            extent = self.window.extent();
        }
        log::debug!("Recreating swap chain for {}x{}", extent.0, extent.1);

        self.device.wait_idle()?;
        self.cleanup();
        self.init()?;
        self.window.set_framebuffer_resized(false);
        self.recreate_count += 1;
        Ok(())
    }

    /// Wait for the current slot's fence, then acquire the next image.
    ///
    /// The fence wait has no timeout. If the acquired image is still being
    /// rendered by another slot, that slot's fence is waited on too.
    pub fn acquire_next_image(&mut self) -> Result<AcquireResult, RhiError> {
        if self.state != SwapChainState::Ready {
            return Err(RhiError::Unsupported(format!(
                "acquire on a swap chain in state {:?}",
                self.state
            )));
        }
        let frame = &self.frames[self.current_frame];
        frame.in_flight.wait(u64::MAX)?;
        let native = self
            .native
            .as_mut()
            .ok_or_else(|| RhiError::Unsupported("swap chain has no native chain".to_string()))?;
        let result = native.acquire_next_image(frame.image_available.as_ref(), u64::MAX)?;

        if let AcquireResult::Image { index, .. } = result {
            let slot = &mut self.images_in_flight[index as usize];
            if let Some(owner) = slot.filter(|owner| *owner != self.current_frame) {
                self.frames[owner].in_flight.wait(u64::MAX)?;
            }
            *slot = Some(self.current_frame);
        }
        Ok(result)
    }

    /// Submit `command_buffer` for `image_index` and present it.
    ///
    /// Recreates the chain when presentation reports out-of-date or
    /// suboptimal, or when the window was resized. The frame slot advances
    /// whether or not this succeeds.
    pub fn submit_command_buffers(
        &mut self,
        command_buffer: &dyn CommandBuffer,
        image_index: u32,
    ) -> Result<PresentStatus, RhiError> {
        let result = self
            .submit_and_present(command_buffer, image_index)
            .and_then(|status| {
                if status != PresentStatus::Optimal || self.window.framebuffer_resized() {
                    self.recreate()?;
                }
                Ok(status)
            });
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        result
    }

    fn submit_and_present(
        &mut self,
        command_buffer: &dyn CommandBuffer,
        image_index: u32,
    ) -> Result<PresentStatus, RhiError> {
        if self.native.is_none() {
            return Err(RhiError::Unsupported("swap chain has no native chain".to_string()));
        }
        let slot = self.current_frame;
        let frame = &self.frames[slot];
        frame.in_flight.reset()?;
        let submitted = self.device.graphics_queue().submit(
            &[command_buffer],
            &[frame.image_available.as_ref()],
            &[frame.render_finished.as_ref()],
            Some(frame.in_flight.as_ref()),
        );
        if let Err(e) = submitted {
            // Nothing will ever signal the reset fence; the slot gets a signaled one.
            self.frames[slot].in_flight = self.device.create_fence(true)?;
            return Err(e);
        }
        let frame = &self.frames[slot];
        match &self.native {
            Some(native) => native.present(image_index, frame.render_finished.as_ref()),
            None => Err(RhiError::Unsupported("swap chain has no native chain".to_string())),
        }
    }

    pub fn state(&self) -> SwapChainState {
        self.state
    }

    /// Native chain for render pass recording. `None` only mid-recreation.
    pub fn native(&self) -> Option<&dyn Swapchain> {
        self.native.as_deref()
    }

    pub fn depth_target(&self) -> Option<&dyn Texture> {
        self.depth.as_deref()
    }

    pub fn extent(&self) -> (u32, u32) {
        self.native.as_ref().map_or((0, 0), |n| n.extent())
    }

    pub fn format(&self) -> Option<SurfaceFormat> {
        self.native.as_ref().map(|n| n.format())
    }

    pub fn present_mode(&self) -> Option<PresentMode> {
        self.native.as_ref().map(|n| n.present_mode())
    }

    pub fn image_count(&self) -> u32 {
        self.native.as_ref().map_or(0, |n| n.image_count())
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn recreate_count(&self) -> u64 {
        self.recreate_count
    }
}

impl std::fmt::Debug for SwapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChain")
            .field("state", &self.state)
            .field("extent", &self.extent())
            .field("current_frame", &self.current_frame)
            .field("recreate_count", &self.recreate_count)
            .finish()
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle before swap chain teardown: {}", e);
        }
        self.cleanup();
        self.state = SwapChainState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeWindow};
    use crate::{ColorSpace, DeviceMemoryAllocator, TextureFormat};

    fn caps(current: Option<(u32, u32)>) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: current,
            min_extent: (1, 1),
            max_extent: (4096, 2048),
        }
    }

    fn swap_chain(device: &Arc<FakeDevice>, window: &Arc<FakeWindow>) -> SwapChain {
        let allocator = DeviceMemoryAllocator::shared(device.clone(), &Default::default());
        SwapChain::new(
            device.clone(),
            allocator,
            window.clone(),
            SwapchainConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn surface_format_prefers_exact_pair() {
        let srgb = SurfaceFormat {
            format: TextureFormat::Bgra8UnormSrgb,
            color_space: ColorSpace::SrgbNonlinear,
        };
        let unorm = SurfaceFormat {
            format: TextureFormat::Bgra8Unorm,
            color_space: ColorSpace::SrgbNonlinear,
        };
        let other_space = SurfaceFormat {
            format: TextureFormat::Bgra8UnormSrgb,
            color_space: ColorSpace::Other(1000104002),
        };
        assert_eq!(choose_surface_format(&[unorm, srgb], srgb), Some(srgb));
        assert_eq!(choose_surface_format(&[other_space, unorm], srgb), Some(other_space));
        assert_eq!(choose_surface_format(&[], srgb), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [PresentMode::Fifo, PresentMode::Mailbox];
        assert_eq!(choose_present_mode(&modes, PresentMode::Mailbox), PresentMode::Mailbox);
        assert_eq!(
            choose_present_mode(&[PresentMode::Fifo, PresentMode::Immediate], PresentMode::Mailbox),
            PresentMode::Fifo
        );
    }

    #[test]
    fn extent_uses_surface_or_clamps_window() {
        assert_eq!(choose_extent(&caps(Some((800, 600))), (1, 1)), (800, 600));
        assert_eq!(choose_extent(&caps(None), (1280, 720)), (1280, 720));
        assert_eq!(choose_extent(&caps(None), (9000, 0)), (4096, 1));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps(None)), 3);
        let mut unbounded = caps(None);
        unbounded.max_image_count = 0;
        unbounded.min_image_count = 4;
        assert_eq!(choose_image_count(&unbounded), 5);
        let mut tight = caps(None);
        tight.max_image_count = 2;
        assert_eq!(choose_image_count(&tight), 2);
    }

    #[test]
    fn new_builds_ready_chain_at_window_size() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let chain = swap_chain(&device, &window);
        assert_eq!(chain.state(), SwapChainState::Ready);
        assert_eq!(chain.extent(), (640, 480));
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.present_mode(), Some(PresentMode::Mailbox));
        assert_eq!(chain.depth_target().map(|d| d.size()), Some((640, 480)));
    }

    #[test]
    fn suboptimal_present_recreates_and_advances_frame() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let cmd = device.allocate_command_buffers(1).unwrap();

        let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        device.script_present(PresentStatus::Suboptimal);
        let status = chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();
        assert_eq!(status, PresentStatus::Suboptimal);
        assert_eq!(chain.recreate_count(), 1);
        assert_eq!(chain.current_frame(), 1);
        assert_eq!(chain.state(), SwapChainState::Ready);
    }

    #[test]
    fn resize_flag_triggers_recreate_and_is_cleared() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let cmd = device.allocate_command_buffers(1).unwrap();

        let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        window.resize((1024, 768));
        device.set_surface_extent(Some((1024, 768)));
        let status = chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();
        assert_eq!(status, PresentStatus::Optimal);
        assert_eq!(chain.recreate_count(), 1);
        assert_eq!(chain.extent(), (1024, 768));
        assert!(!window.framebuffer_resized());
    }

    #[test]
    fn failed_submit_still_advances_frame() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let cmd = device.allocate_command_buffers(1).unwrap();

        let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        device.fail_next_submit();
        assert!(chain.submit_command_buffers(cmd[0].as_ref(), index).is_err());
        assert_eq!(chain.current_frame(), 1);

        // Both slots keep cycling; the failed slot's fence does not block.
        for expected_slot in [1, 0, 1] {
            let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
                panic!("expected an image");
            };
            assert_eq!(chain.current_frame(), expected_slot);
            chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();
        }
    }

    #[test]
    fn out_of_date_acquire_leaves_slot_fence_signaled() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let cmd = device.allocate_command_buffers(1).unwrap();

        let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();
        let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();

        // Slot 0 again, with its previous submission pending.
        device.script_out_of_date_acquire();
        assert_eq!(chain.acquire_next_image().unwrap(), AcquireResult::OutOfDate);
        assert_eq!(chain.current_frame(), 0);
        // Acquiring again on the same slot without a recreate must not deadlock.
        assert!(matches!(
            chain.acquire_next_image().unwrap(),
            AcquireResult::Image { .. }
        ));
    }

    #[test]
    fn recreate_waits_out_zero_extent() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);

        window.queue_extents(&[(0, 0), (0, 0), (800, 0), (800, 600)]);
        device.set_surface_extent(Some((800, 600)));
        chain.recreate().unwrap();
        // The first three polls were degenerate; the fourth let it through.
        assert_eq!(window.wait_count(), 3);
        assert_eq!(chain.extent(), (800, 600));
        assert_eq!(chain.state(), SwapChainState::Ready);
    }

    #[test]
    fn recreate_rebuilds_sync_objects_after_idle() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let fences_before = device.fences_created();
        chain.recreate().unwrap();
        assert_eq!(device.fences_created(), fences_before + MAX_FRAMES_IN_FLIGHT);
        assert_eq!(device.wait_idle_count(), 1);
    }

    #[test]
    fn image_owned_by_other_slot_is_waited_on() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let mut chain = swap_chain(&device, &window);
        let cmd = device.allocate_command_buffers(1).unwrap();
        // Hand out image 0 to both frame slots.
        device.script_acquire(&[0, 0]);

        for _ in 0..2 {
            let AcquireResult::Image { index, .. } = chain.acquire_next_image().unwrap() else {
                panic!("expected an image");
            };
            assert_eq!(index, 0);
            chain.submit_command_buffers(cmd[0].as_ref(), index).unwrap();
        }
        // Slot 1 had to wait for slot 0's submission to retire.
        assert_eq!(device.in_flight(), 1);
    }

    #[test]
    fn drop_waits_idle_and_releases_depth_memory() {
        let device = FakeDevice::new();
        let window = FakeWindow::new((640, 480));
        let chain = swap_chain(&device, &window);
        drop(chain);
        assert_eq!(device.wait_idle_count(), 1);
        assert_eq!(device.live_depth_targets(), 0);
    }
}
