//! In-memory device, swap chain and window used by the unit tests.

use crate::memory::{MemoryHeap, MemoryType};
use crate::{
    AcquireResult, ClearColor, ColorSpace, CommandBuffer, Device, DeviceLimits, Fence,
    MemoryBlock, MemoryDevice, MemoryHandle, MemoryProperties, MemoryPropertyFlags, PresentMode,
    PresentStatus, Queue, Rect2D, RhiError, Semaphore, SharedAllocator, SurfaceCapabilities,
    SurfaceFormat, SurfaceSupport, Swapchain, SwapchainDescriptor, Texture, TextureFormat,
    Viewport, Window,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters and scripts shared by the device and everything it creates.
#[derive(Debug, Default)]
struct FakeState {
    next_memory: AtomicU64,
    live_allocations: AtomicUsize,
    /// Host backing for mapped reservations.
    mapped: Mutex<HashMap<MemoryHandle, Box<[u8]>>>,
    map_calls: AtomicUsize,
    fail_next_allocation: AtomicBool,
    fences_created: AtomicUsize,
    command_buffers_allocated: AtomicUsize,
    wait_idle_count: AtomicUsize,
    live_depth_targets: AtomicUsize,
    fail_next_submit: AtomicBool,
    submissions: AtomicUsize,
    /// Bumped by `wait_idle`; fences submitted in an older epoch have retired.
    epoch: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    surface_extent: Mutex<Option<(u32, u32)>>,
    acquire_script: Mutex<VecDeque<AcquireResult>>,
    present_script: Mutex<VecDeque<PresentStatus>>,
}

#[derive(Debug)]
pub struct FakeDevice {
    state: Arc<FakeState>,
    queue: FakeQueue,
    granularity: u64,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Self::with_granularity(256)
    }

    pub fn with_granularity(granularity: u64) -> Arc<Self> {
        let state = Arc::new(FakeState::default());
        Arc::new(Self {
            queue: FakeQueue {
                state: Arc::clone(&state),
            },
            state,
            granularity,
        })
    }

    pub fn live_allocations(&self) -> usize {
        self.state.live_allocations.load(Ordering::SeqCst)
    }

    pub fn map_calls(&self) -> usize {
        self.state.map_calls.load(Ordering::SeqCst)
    }

    pub fn live_mappings(&self) -> usize {
        self.state.mapped.lock().len()
    }

    /// Bytes `offset..offset + len` of a mapped reservation.
    pub fn read_mapped(&self, memory: MemoryHandle, offset: u64, len: usize) -> Vec<u8> {
        let mapped = self.state.mapped.lock();
        let start = offset as usize;
        mapped[&memory][start..start + len].to_vec()
    }

    pub fn fail_next_allocation(&self) {
        self.state.fail_next_allocation.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_submit(&self) {
        self.state.fail_next_submit.store(true, Ordering::SeqCst);
    }

    pub fn fences_created(&self) -> usize {
        self.state.fences_created.load(Ordering::SeqCst)
    }

    pub fn command_buffers_allocated(&self) -> usize {
        self.state.command_buffers_allocated.load(Ordering::SeqCst)
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.wait_idle_count.load(Ordering::SeqCst)
    }

    pub fn live_depth_targets(&self) -> usize {
        self.state.live_depth_targets.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.state.submissions.load(Ordering::SeqCst)
    }

    /// Submissions whose fence nobody has waited on yet.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_surface_extent(&self, extent: Option<(u32, u32)>) {
        *self.state.surface_extent.lock() = extent;
    }

    pub fn script_acquire(&self, indices: &[u32]) {
        self.state.acquire_script.lock().extend(
            indices
                .iter()
                .map(|&index| AcquireResult::Image {
                    index,
                    suboptimal: false,
                }),
        );
    }

    pub fn script_out_of_date_acquire(&self) {
        self.state
            .acquire_script
            .lock()
            .push_back(AcquireResult::OutOfDate);
    }

    pub fn script_present(&self, status: PresentStatus) {
        self.state.present_script.lock().push_back(status);
    }
}

impl MemoryDevice for FakeDevice {
    fn memory_properties(&self) -> MemoryProperties {
        let device_local = MemoryPropertyFlags::DEVICE_LOCAL;
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: device_local,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: device_local,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: device_local | host,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 1 << 30,
                    device_local: true,
                },
                MemoryHeap {
                    size: 1 << 28,
                    device_local: false,
                },
            ],
        }
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            buffer_image_granularity: self.granularity,
            max_sampler_anisotropy: 16.0,
            max_image_dimension_2d: 16384,
        }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<MemoryHandle, RhiError> {
        if self.state.fail_next_allocation.swap(false, Ordering::SeqCst) {
            return Err(RhiError::OutOfDeviceMemory {
                size,
                memory_type_index,
            });
        }
        self.state.live_allocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.next_memory.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn free_memory(&self, _memory: MemoryHandle) {
        self.state.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }

    fn map_memory(&self, memory: MemoryHandle, size: u64) -> Result<NonNull<u8>, RhiError> {
        self.state.map_calls.fetch_add(1, Ordering::SeqCst);
        let mut mapped = self.state.mapped.lock();
        let backing = mapped
            .entry(memory)
            .or_insert_with(|| vec![0u8; size as usize].into_boxed_slice());
        NonNull::new(backing.as_mut_ptr()).ok_or(RhiError::native("vkMapMemory", -1))
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        self.state.mapped.lock().remove(&memory);
    }
}

impl Device for FakeDevice {
    fn create_fence(&self, signaled: bool) -> Result<Box<dyn Fence>, RhiError> {
        self.state.fences_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeFence {
            state: Arc::clone(&self.state),
            signaled: AtomicBool::new(signaled),
            pending: Mutex::new(None),
        }))
    }

    fn create_semaphore(&self) -> Result<Box<dyn Semaphore>, RhiError> {
        Ok(Box::new(FakeSemaphore))
    }

    fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<Box<dyn CommandBuffer>>, RhiError> {
        self.state
            .command_buffers_allocated
            .fetch_add(count as usize, Ordering::SeqCst);
        Ok((0..count)
            .map(|_| Box::new(FakeCommandBuffer::default()) as Box<dyn CommandBuffer>)
            .collect())
    }

    fn graphics_queue(&self) -> &dyn Queue {
        &self.queue
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        self.state.wait_idle_count.fetch_add(1, Ordering::SeqCst);
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        self.state.in_flight.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn surface_support(&self) -> Result<SurfaceSupport, RhiError> {
        Ok(SurfaceSupport {
            capabilities: SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: *self.state.surface_extent.lock(),
                min_extent: (1, 1),
                max_extent: (4096, 4096),
            },
            formats: vec![
                SurfaceFormat {
                    format: TextureFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                SurfaceFormat {
                    format: TextureFormat::Bgra8UnormSrgb,
                    color_space: ColorSpace::SrgbNonlinear,
                },
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        })
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        _depth: &dyn Texture,
    ) -> Result<Box<dyn Swapchain>, RhiError> {
        Ok(Box::new(FakeSwapchain {
            state: Arc::clone(&self.state),
            desc: *desc,
            next_image: 0,
        }))
    }

    fn create_depth_target(
        &self,
        allocator: &SharedAllocator,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> Result<Box<dyn Texture>, RhiError> {
        let size = u64::from(extent.0) * u64::from(extent.1) * 4;
        let block = allocator.lock().allocate_with_properties(
            size,
            256,
            u32::MAX,
            MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.state.live_depth_targets.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDepthTarget {
            state: Arc::clone(&self.state),
            allocator: Arc::clone(allocator),
            block,
            extent,
            format,
        }))
    }
}

#[derive(Debug)]
struct FakeQueue {
    state: Arc<FakeState>,
}

impl Queue for FakeQueue {
    fn submit(
        &self,
        _command_buffers: &[&dyn CommandBuffer],
        _wait_semaphores: &[&dyn Semaphore],
        _signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> Result<(), RhiError> {
        if self.state.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(RhiError::native("vkQueueSubmit", -4));
        }
        self.state.submissions.fetch_add(1, Ordering::SeqCst);
        if let Some(fence) = signal_fence.and_then(|f| f.as_any().downcast_ref::<FakeFence>()) {
            *fence.pending.lock() = Some(self.state.epoch.load(Ordering::SeqCst));
            let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Pending submissions complete when the fence is waited on.
#[derive(Debug)]
struct FakeFence {
    state: Arc<FakeState>,
    signaled: AtomicBool,
    pending: Mutex<Option<u64>>,
}

impl Fence for FakeFence {
    /// An unsignaled fence with nothing submitted would block a real device
    /// forever; report that as an error instead of hanging the test.
    fn wait(&self, _timeout_ns: u64) -> Result<(), RhiError> {
        match self.pending.lock().take() {
            Some(epoch) => {
                if epoch == self.state.epoch.load(Ordering::SeqCst) {
                    self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
            None if !self.signaled.load(Ordering::SeqCst) => {
                return Err(RhiError::Unsupported(
                    "wait on an unsignaled fence with no pending submission would block forever"
                        .to_string(),
                ));
            }
            None => {}
        }
        self.signaled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) -> Result<(), RhiError> {
        self.signaled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct FakeSemaphore;

impl Semaphore for FakeSemaphore {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FakeCommand {
    Begin,
    End,
    BeginRenderPass { image_index: u32, extent: (u32, u32) },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(Rect2D),
}

impl FakeCommand {
    /// Commands recorded since the buffer's last `begin`.
    pub fn recorded(command_buffer: &dyn CommandBuffer) -> Vec<FakeCommand> {
        command_buffer
            .as_any()
            .downcast_ref::<FakeCommandBuffer>()
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct FakeCommandBuffer {
    commands: Vec<FakeCommand>,
}

impl CommandBuffer for FakeCommandBuffer {
    fn begin(&mut self) -> Result<(), RhiError> {
        self.commands.clear();
        self.commands.push(FakeCommand::Begin);
        Ok(())
    }

    fn end(&mut self) -> Result<(), RhiError> {
        self.commands.push(FakeCommand::End);
        Ok(())
    }

    fn begin_render_pass(&mut self, target: &dyn Swapchain, image_index: u32, _clear: ClearColor) {
        self.commands.push(FakeCommand::BeginRenderPass {
            image_index,
            extent: target.extent(),
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(FakeCommand::EndRenderPass);
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(FakeCommand::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        self.commands.push(FakeCommand::SetScissor(scissor));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out images round-robin unless a script says otherwise.
#[derive(Debug)]
struct FakeSwapchain {
    state: Arc<FakeState>,
    desc: SwapchainDescriptor,
    next_image: u32,
}

impl Swapchain for FakeSwapchain {
    fn acquire_next_image(
        &mut self,
        _signal: &dyn Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquireResult, RhiError> {
        if let Some(result) = self.state.acquire_script.lock().pop_front() {
            return Ok(result);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.desc.image_count;
        Ok(AcquireResult::Image {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, _image_index: u32, _wait: &dyn Semaphore) -> Result<PresentStatus, RhiError> {
        Ok(self
            .state
            .present_script
            .lock()
            .pop_front()
            .unwrap_or(PresentStatus::Optimal))
    }

    fn extent(&self) -> (u32, u32) {
        self.desc.extent
    }

    fn image_count(&self) -> u32 {
        self.desc.image_count
    }

    fn format(&self) -> SurfaceFormat {
        self.desc.format
    }

    fn present_mode(&self) -> PresentMode {
        self.desc.present_mode
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct FakeDepthTarget {
    state: Arc<FakeState>,
    allocator: SharedAllocator,
    block: MemoryBlock,
    extent: (u32, u32),
    format: TextureFormat,
}

impl Texture for FakeDepthTarget {
    fn format(&self) -> TextureFormat {
        self.format
    }

    fn size(&self) -> (u32, u32) {
        self.extent
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for FakeDepthTarget {
    fn drop(&mut self) {
        let _ = self.allocator.lock().free(&self.block);
        self.state.live_depth_targets.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Window whose extent can be scripted per `wait_events` poll.
#[derive(Debug)]
pub struct FakeWindow {
    extent: Mutex<(u32, u32)>,
    upcoming: Mutex<VecDeque<(u32, u32)>>,
    resized: AtomicBool,
    waits: AtomicUsize,
}

impl FakeWindow {
    pub fn new(extent: (u32, u32)) -> Arc<Self> {
        Arc::new(Self {
            extent: Mutex::new(extent),
            upcoming: Mutex::new(VecDeque::new()),
            resized: AtomicBool::new(false),
            waits: AtomicUsize::new(0),
        })
    }

    /// Simulate a resize event.
    pub fn resize(&self, extent: (u32, u32)) {
        *self.extent.lock() = extent;
        self.resized.store(true, Ordering::SeqCst);
    }

    /// The first extent applies now, each later one after one more `wait_events`.
    pub fn queue_extents(&self, extents: &[(u32, u32)]) {
        let mut upcoming = self.upcoming.lock();
        upcoming.clear();
        upcoming.extend(extents.iter().copied());
        if let Some(first) = upcoming.pop_front() {
            *self.extent.lock() = first;
        }
    }

    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl Window for FakeWindow {
    fn extent(&self) -> (u32, u32) {
        *self.extent.lock()
    }

    fn framebuffer_resized(&self) -> bool {
        self.resized.load(Ordering::SeqCst)
    }

    fn set_framebuffer_resized(&self, resized: bool) {
        self.resized.store(resized, Ordering::SeqCst);
    }

    fn wait_events(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.upcoming.lock().pop_front() {
            *self.extent.lock() = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_fence_with_nothing_submitted_reports_deadlock() {
        let device = FakeDevice::new();
        let fence = device.create_fence(true).unwrap();
        fence.wait(u64::MAX).unwrap();
        fence.reset().unwrap();
        assert!(matches!(fence.wait(u64::MAX), Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn submitted_fence_signals_on_wait() {
        let device = FakeDevice::new();
        let fence = device.create_fence(false).unwrap();
        device
            .graphics_queue()
            .submit(&[], &[], &[], Some(fence.as_ref()))
            .unwrap();
        assert_eq!(device.in_flight(), 1);
        fence.wait(u64::MAX).unwrap();
        assert_eq!(device.in_flight(), 0);
        // Stays signaled until reset.
        fence.wait(u64::MAX).unwrap();
    }
}
