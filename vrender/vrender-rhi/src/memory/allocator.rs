use super::{
    align_up, find_memory_type, MemoryAllocation, MemoryBlock, MemoryProperties,
    MemoryPropertyFlags,
};
use crate::config::AllocatorConfig;
use crate::{MemoryDevice, RhiError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Allocator handle shared by every resource that owns a block.
pub type SharedAllocator = Arc<Mutex<DeviceMemoryAllocator>>;

/// Per-device allocator: one growable chain of [`MemoryAllocation`]s per memory type.
///
/// Requests are rounded up to the page size (`bufferImageGranularity`) so
/// linear and optimal resources never share a page. Chains grow by doubling.
pub struct DeviceMemoryAllocator {
    device: Arc<dyn MemoryDevice>,
    properties: MemoryProperties,
    page_size: u64,
    min_allocation_size: u64,
    heap_budgets: Vec<u64>,
    heap_usage: Vec<u64>,
    chains: Vec<Vec<MemoryAllocation>>,
}

impl DeviceMemoryAllocator {
    pub fn new(device: Arc<dyn MemoryDevice>, config: &AllocatorConfig) -> Self {
        let properties = device.memory_properties();
        let page_size = device.limits().buffer_image_granularity.max(1);
        let min_allocation_size = page_size.saturating_mul(config.min_allocation_pages.max(1));
        let percent = u64::from(config.heap_budget_percent.min(100));
        let heap_budgets = properties
            .memory_heaps
            .iter()
            .map(|heap| heap.size / 100 * percent)
            .collect::<Vec<_>>();
        let chains = properties.memory_types.iter().map(|_| Vec::new()).collect();
        log::debug!(
            "DeviceMemoryAllocator: {} memory types, {} heaps, page size {}, minimum allocation {}",
            properties.memory_types.len(),
            properties.memory_heaps.len(),
            page_size,
            min_allocation_size
        );
        Self {
            device,
            heap_usage: vec![0; heap_budgets.len()],
            heap_budgets,
            properties,
            page_size,
            min_allocation_size,
            chains,
        }
    }

    /// Wrap a new allocator for sharing between resources.
    pub fn shared(device: Arc<dyn MemoryDevice>, config: &AllocatorConfig) -> SharedAllocator {
        Arc::new(Mutex::new(Self::new(device, config)))
    }

    pub fn properties(&self) -> &MemoryProperties {
        &self.properties
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn min_allocation_size(&self) -> u64 {
        self.min_allocation_size
    }

    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: MemoryPropertyFlags,
    ) -> Result<u32, RhiError> {
        find_memory_type(&self.properties, type_filter, properties).ok_or_else(|| {
            log::error!(
                "No memory type in filter {:#b} supports {:?}",
                type_filter,
                properties
            );
            RhiError::NoSuitableMemoryType {
                type_filter,
                properties,
            }
        })
    }

    /// Sub-allocate `size` bytes at `alignment` from memory type `type_index`,
    /// appending a new chain link when no existing link has room.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        type_index: u32,
    ) -> Result<MemoryBlock, RhiError> {
        let chain = self.chains.get_mut(type_index as usize).ok_or_else(|| {
            RhiError::Unsupported(format!("memory type {type_index} does not exist"))
        })?;
        let request = align_up(size.max(1), self.page_size).ok_or_else(|| {
            log::error!("Allocation of {} bytes overflows page rounding", size);
            RhiError::OutOfDeviceMemory {
                size,
                memory_type_index: type_index,
            }
        })?;

        for link in chain.iter_mut() {
            if link.remaining_size() < request {
                continue;
            }
            if let Some(block) = link.allocate_block(request, alignment) {
                log::trace!(
                    "allocated {} bytes at offset {} from type {} link {}",
                    block.size,
                    block.offset,
                    type_index,
                    block.allocation
                );
                return Ok(block);
            }
        }

        let link = self.grow(request, type_index)?;
        link.allocate_block(request, alignment).ok_or_else(|| {
            RhiError::OutOfDeviceMemory {
                size: request,
                memory_type_index: type_index,
            }
        })
    }

    /// Find a memory type for `type_filter`/`properties` and allocate from it.
    pub fn allocate_with_properties(
        &mut self,
        size: u64,
        alignment: u64,
        type_filter: u32,
        properties: MemoryPropertyFlags,
    ) -> Result<MemoryBlock, RhiError> {
        let type_index = self.find_memory_type(type_filter, properties)?;
        self.allocate(size, alignment, type_index)
    }

    /// Return `block` to the chain link that handed it out.
    pub fn free(&mut self, block: &MemoryBlock) -> Result<(), RhiError> {
        let link = self
            .chains
            .get_mut(block.type_index as usize)
            .and_then(|chain| chain.get_mut(block.allocation))
            .ok_or(RhiError::InvalidBlock)?;
        if link.free_block(block) {
            Ok(())
        } else {
            log::warn!("free of unknown block {:?}", block);
            Err(RhiError::InvalidBlock)
        }
    }

    /// Copy `data` into a host-visible `block` through its link's persistent mapping.
    pub fn write(&self, block: &MemoryBlock, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        self.chains
            .get(block.type_index as usize)
            .and_then(|chain| chain.get(block.allocation))
            .ok_or(RhiError::InvalidBlock)?
            .write(block, offset, data)
    }

    /// Links of the chain for `type_index`, head first.
    pub fn chain(&self, type_index: u32) -> &[MemoryAllocation] {
        self.chains
            .get(type_index as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn allocation_count(&self, type_index: u32) -> usize {
        self.chain(type_index).len()
    }

    /// Bytes reserved from `heap` by this allocator.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.heap_usage.get(heap).copied().unwrap_or(0)
    }

    pub fn heap_budget(&self, heap: usize) -> u64 {
        self.heap_budgets.get(heap).copied().unwrap_or(0)
    }

    fn grow(&mut self, request: u64, type_index: u32) -> Result<&mut MemoryAllocation, RhiError> {
        let chain = &mut self.chains[type_index as usize];
        let doubled = request.checked_mul(2).and_then(|request| match chain.last() {
            None => Some(self.min_allocation_size.max(request)),
            Some(tail) => tail.size().checked_mul(2).map(|tail| tail.max(request)),
        });
        let Some(size) = doubled else {
            log::error!(
                "Chain growth for {} bytes of type {} overflows",
                request,
                type_index
            );
            return Err(RhiError::OutOfDeviceMemory {
                size: request,
                memory_type_index: type_index,
            });
        };
        let link = chain.len();
        let host_visible = self.properties.memory_types[type_index as usize]
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE);
        let allocation =
            MemoryAllocation::new(Arc::clone(&self.device), size, type_index, link, host_visible)?;

        let heap = self.properties.memory_types[type_index as usize].heap_index as usize;
        if let Some(usage) = self.heap_usage.get_mut(heap) {
            *usage = usage.saturating_add(size);
            let budget = self.heap_budgets[heap];
            if *usage > budget {
                log::warn!(
                    "Heap {} over budget: {} bytes reserved, budget {} bytes",
                    heap,
                    usage,
                    budget
                );
            }
        }
        log::info!(
            "New memory allocation: {} bytes, type {}, chain link {}",
            size,
            type_index,
            link
        );
        chain.push(allocation);
        Ok(&mut chain[link])
    }
}

impl std::fmt::Debug for DeviceMemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryAllocator")
            .field("page_size", &self.page_size)
            .field("min_allocation_size", &self.min_allocation_size)
            .field("heap_usage", &self.heap_usage)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceMemoryAllocator {
    fn drop(&mut self) {
        let links: usize = self.chains.iter().map(Vec::len).sum();
        log::debug!("DeviceMemoryAllocator: releasing {} allocations", links);
        for chain in &mut self.chains {
            // Newest link first, the reverse of creation order.
            while chain.pop().is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDevice;

    fn allocator(granularity: u64) -> (Arc<FakeDevice>, DeviceMemoryAllocator) {
        let device = FakeDevice::with_granularity(granularity);
        let allocator = DeviceMemoryAllocator::new(device.clone(), &AllocatorConfig::default());
        (device, allocator)
    }

    #[test]
    fn first_request_creates_head_with_doubling() {
        let (_device, mut allocator) = allocator(256);
        assert_eq!(allocator.min_allocation_size(), 2560);
        let block = allocator.allocate(4096, 256, 2).unwrap();
        assert_eq!(block.offset, 0);
        assert!(block.size >= 4096);
        assert_eq!(block.type_index, 2);
        assert_eq!(allocator.allocation_count(2), 1);
        assert_eq!(allocator.chain(2)[0].size(), 2560u64.max(8192));
        assert_eq!(allocator.allocation_count(0), 0);
    }

    #[test]
    fn minimum_allocation_wins_for_small_requests() {
        let (_device, mut allocator) = allocator(1024);
        let block = allocator.allocate(4096, 256, 2).unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(allocator.chain(2)[0].size(), 10 * 1024);
    }

    #[test]
    fn requests_round_up_to_page_size() {
        let (_device, mut allocator) = allocator(1024);
        assert_eq!(allocator.allocate(1, 1, 0).unwrap().size, 1024);
        assert_eq!(allocator.allocate(1024, 1, 0).unwrap().size, 1024);
        assert_eq!(allocator.allocate(1025, 1, 0).unwrap().size, 2048);
    }

    #[test]
    fn allocate_free_allocate_reuses_without_growth() {
        let (device, mut allocator) = allocator(256);
        let first = allocator.allocate(3000, 256, 1).unwrap();
        allocator.free(&first).unwrap();
        let second = allocator.allocate(3000, 256, 1).unwrap();
        assert_eq!(second.offset, first.offset);
        assert_eq!(allocator.allocation_count(1), 1);
        assert_eq!(device.live_allocations(), 1);
    }

    #[test]
    fn oversized_request_appends_exactly_one_link() {
        let (_device, mut allocator) = allocator(256);
        allocator.allocate(1000, 256, 0).unwrap();
        let head_size = allocator.chain(0)[0].size();
        let request = head_size * 3;
        let block = allocator.allocate(request, 256, 0).unwrap();
        assert_eq!(allocator.allocation_count(0), 2);
        assert_eq!(block.allocation, 1);
        assert!(allocator.chain(0)[1].size() >= request);
        assert!(allocator.chain(0)[1].size() >= head_size * 2);
    }

    #[test]
    fn later_links_are_tried_before_growing() {
        let (_device, mut allocator) = allocator(256);
        // Fill the head exactly, then force a second link.
        allocator.allocate(256, 1, 0).unwrap();
        let remaining = allocator.chain(0)[0].remaining_size();
        allocator.allocate(remaining, 1, 0).unwrap();
        allocator.allocate(256, 1, 0).unwrap();
        assert_eq!(allocator.allocation_count(0), 2);
        let block = allocator.allocate(256, 1, 0).unwrap();
        assert_eq!(block.allocation, 1);
        assert_eq!(allocator.allocation_count(0), 2);
    }

    #[test]
    fn free_dispatches_to_owning_link() {
        let (_device, mut allocator) = allocator(256);
        allocator.allocate(256, 1, 0).unwrap();
        let remaining = allocator.chain(0)[0].remaining_size();
        let head_block = allocator.allocate(remaining, 1, 0).unwrap();
        let tail_block = allocator.allocate(512, 1, 0).unwrap();
        assert_eq!(tail_block.allocation, 1);
        allocator.free(&tail_block).unwrap();
        assert_eq!(allocator.chain(0)[1].allocated_size(), 0);
        assert_eq!(allocator.chain(0)[0].remaining_size(), 0);
        allocator.free(&head_block).unwrap();
        assert_eq!(allocator.free(&head_block), Err(RhiError::InvalidBlock));
    }

    #[test]
    fn aligned_offsets_across_many_requests() {
        let (_device, mut allocator) = allocator(64);
        for (i, size) in [10u64, 300, 70, 4000, 65, 129].iter().enumerate() {
            let alignment = 64 << (i % 3);
            let block = allocator.allocate(*size, alignment, 3).unwrap();
            assert_eq!(block.offset % alignment, 0, "{block:?}");
        }
    }

    #[test]
    fn unknown_memory_type_is_an_error() {
        let (_device, mut allocator) = allocator(256);
        assert!(matches!(
            allocator.allocate(16, 1, 99),
            Err(RhiError::Unsupported(_))
        ));
        assert!(matches!(
            allocator.find_memory_type(0b1, MemoryPropertyFlags::HOST_VISIBLE),
            Err(RhiError::NoSuitableMemoryType { .. })
        ));
    }

    #[test]
    fn native_failure_during_growth_propagates() {
        let (device, mut allocator) = allocator(256);
        device.fail_next_allocation();
        assert!(matches!(
            allocator.allocate(16, 1, 0),
            Err(RhiError::OutOfDeviceMemory { .. })
        ));
        assert_eq!(allocator.allocation_count(0), 0);
        assert!(allocator.allocate(16, 1, 0).is_ok());
    }

    #[test]
    fn huge_requests_fail_instead_of_overflowing() {
        let (device, mut allocator) = allocator(256);
        // Page rounding overflows.
        assert!(matches!(
            allocator.allocate((1 << 63) + 1, 1, 0),
            Err(RhiError::OutOfDeviceMemory { .. })
        ));
        // Already a page multiple, but doubling for growth overflows.
        assert!(matches!(
            allocator.allocate(1 << 63, 1, 0),
            Err(RhiError::OutOfDeviceMemory { .. })
        ));
        assert_eq!(allocator.allocation_count(0), 0);
        assert_eq!(device.live_allocations(), 0);

        allocator.allocate(4096, 1, 0).unwrap();
        let tail = allocator.chain(0)[0].size();
        assert!(matches!(
            allocator.allocate(u64::MAX - 255, 1, 0),
            Err(RhiError::OutOfDeviceMemory { .. })
        ));
        assert_eq!(allocator.allocation_count(0), 1);
        assert_eq!(allocator.chain(0)[0].size(), tail);
    }

    #[test]
    fn host_visible_links_are_mapped_once_and_shared() {
        let (device, mut allocator) = allocator(256);
        let a = allocator.allocate(256, 256, 1).unwrap();
        let b = allocator.allocate(256, 256, 1).unwrap();
        allocator.allocate(256, 256, 0).unwrap();
        assert_eq!(a.allocation, b.allocation);
        assert_eq!(device.map_calls(), 1);
        assert!(allocator.chain(1)[0].is_mapped());
        assert!(!allocator.chain(0)[0].is_mapped());

        allocator.write(&a, 4, &[1, 2, 3]).unwrap();
        allocator.write(&b, 0, &[9; 4]).unwrap();
        assert_eq!(device.read_mapped(a.memory, a.offset, 8), vec![0, 0, 0, 0, 1, 2, 3, 0]);
        assert_eq!(device.read_mapped(b.memory, b.offset, 4), vec![9; 4]);
        assert_eq!(device.map_calls(), 1);

        drop(allocator);
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn writes_are_checked_against_block_and_memory_type() {
        let (_device, mut allocator) = allocator(256);
        let host = allocator.allocate(256, 1, 1).unwrap();
        let local = allocator.allocate(256, 1, 0).unwrap();
        assert!(matches!(
            allocator.write(&local, 0, &[1]),
            Err(RhiError::Unsupported(_))
        ));
        assert!(matches!(
            allocator.write(&host, 250, &[0; 8]),
            Err(RhiError::Unsupported(_))
        ));
        assert!(matches!(
            allocator.write(&host, u64::MAX, &[0; 8]),
            Err(RhiError::Unsupported(_))
        ));
        allocator.free(&host).unwrap();
        assert_eq!(allocator.write(&host, 0, &[1]), Err(RhiError::InvalidBlock));
    }

    #[test]
    fn heap_usage_tracks_reservations() {
        let (_device, mut allocator) = allocator(256);
        allocator.allocate(4096, 1, 0).unwrap();
        allocator.allocate(4096, 1, 1).unwrap();
        let heap0 = allocator.chain(0)[0].size();
        let heap1 = allocator.chain(1)[0].size();
        assert_eq!(allocator.heap_usage(0), heap0);
        assert_eq!(allocator.heap_usage(1), heap1);
        assert_eq!(allocator.heap_budget(0), (1u64 << 30) / 100 * 75);
    }

    #[test]
    fn drop_releases_every_native_allocation() {
        let (device, mut allocator) = allocator(256);
        allocator.allocate(100, 1, 0).unwrap();
        allocator.allocate(1 << 20, 1, 0).unwrap();
        allocator.allocate(100, 1, 2).unwrap();
        assert_eq!(device.live_allocations(), 3);
        drop(allocator);
        assert_eq!(device.live_allocations(), 0);
    }
}
