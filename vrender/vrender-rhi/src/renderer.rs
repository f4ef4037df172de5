//! Per-frame orchestration on top of [`SwapChain`].

use crate::swapchain::{SwapChain, MAX_FRAMES_IN_FLIGHT};
use crate::{
    AcquireResult, ClearColor, CommandBuffer, Device, PresentStatus, Rect2D, RendererConfig,
    RhiError, Viewport,
};
use std::sync::Arc;

/// Drives `begin_frame -> begin_render_pass -> (scene draws) -> end_render_pass -> end_frame`.
///
/// Command buffers are indexed by frame slot, not by swap chain image: the
/// slot's fence is what makes re-recording a buffer safe.
pub struct Renderer {
    device: Arc<dyn Device>,
    command_buffers: Vec<Box<dyn CommandBuffer>>,
    clear_color: ClearColor,
    current_frame: usize,
    current_image: u32,
    frame_started: bool,
}

impl Renderer {
    /// Allocates one command buffer per swap chain image.
    pub fn new(
        device: Arc<dyn Device>,
        swap_chain: &SwapChain,
        config: &RendererConfig,
    ) -> Result<Self, RhiError> {
        let count = swap_chain.image_count().max(MAX_FRAMES_IN_FLIGHT as u32);
        let command_buffers = device.allocate_command_buffers(count)?;
        Ok(Self {
            device,
            command_buffers,
            clear_color: config.clear_color,
            current_frame: swap_chain.current_frame(),
            current_image: 0,
            frame_started: false,
        })
    }

    /// Acquire an image and start recording.
    ///
    /// Returns `Ok(None)` when the swap chain was out of date; it has been
    /// recreated and the caller should skip drawing this frame.
    pub fn begin_frame(
        &mut self,
        swap_chain: &mut SwapChain,
    ) -> Result<Option<&mut dyn CommandBuffer>, RhiError> {
        if self.frame_started {
            return Err(RhiError::Unsupported(
                "begin_frame called while a frame is already being recorded".to_string(),
            ));
        }
        match swap_chain.acquire_next_image()? {
            AcquireResult::OutOfDate => {
                log::debug!("Swap chain out of date on acquire; skipping frame");
                swap_chain.recreate()?;
                return Ok(None);
            }
            AcquireResult::Image { index, .. } => self.current_image = index,
        }
        self.current_frame = swap_chain.current_frame();

        let command_buffer = &mut self.command_buffers[self.current_frame];
        command_buffer.begin()?;
        self.frame_started = true;
        let command_buffer: &mut dyn CommandBuffer = command_buffer.as_mut();
        Ok(Some(command_buffer))
    }

    /// Begin the swap chain's render pass and set viewport and scissor to its extent.
    pub fn begin_render_pass(&mut self, swap_chain: &SwapChain) -> Result<(), RhiError> {
        let native = swap_chain
            .native()
            .ok_or_else(|| RhiError::Unsupported("swap chain is being recreated".to_string()))?;
        let extent = swap_chain.extent();
        let clear = self.clear_color;
        let image = self.current_image;
        let command_buffer = self.recording()?;
        command_buffer.begin_render_pass(native, image, clear);
        command_buffer.set_viewport(Viewport::from_extent(extent));
        command_buffer.set_scissor(Rect2D::from_extent(extent));
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<(), RhiError> {
        self.recording()?.end_render_pass();
        Ok(())
    }

    /// Finish recording, submit and present.
    ///
    /// Out-of-date and suboptimal results come back as statuses after the swap
    /// chain has already recreated itself; only native failures are errors.
    pub fn end_frame(&mut self, swap_chain: &mut SwapChain) -> Result<PresentStatus, RhiError> {
        self.recording()?.end()?;
        self.frame_started = false;
        let status = swap_chain.submit_command_buffers(
            self.command_buffers[self.current_frame].as_ref(),
            self.current_image,
        );
        self.current_frame = swap_chain.current_frame();
        status
    }

    /// Command buffer of the frame being recorded.
    pub fn command_buffer(&mut self) -> Option<&mut dyn CommandBuffer> {
        if !self.frame_started {
            return None;
        }
        let command_buffer: &mut dyn CommandBuffer =
            self.command_buffers[self.current_frame].as_mut();
        Some(command_buffer)
    }

    pub fn set_clear_color(&mut self, clear_color: ClearColor) {
        self.clear_color = clear_color;
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    pub fn is_frame_started(&self) -> bool {
        self.frame_started
    }

    fn recording(&mut self) -> Result<&mut Box<dyn CommandBuffer>, RhiError> {
        if !self.frame_started {
            return Err(RhiError::Unsupported(
                "no frame is being recorded".to_string(),
            ));
        }
        Ok(&mut self.command_buffers[self.current_frame])
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("command_buffers", &self.command_buffers.len())
            .field("current_frame", &self.current_frame)
            .field("current_image", &self.current_image)
            .finish()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Command buffers may still be pending on the queue.
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle before freeing command buffers: {}", e);
        }
    }
}
